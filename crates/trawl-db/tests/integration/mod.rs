pub mod cache_tests;
pub mod common;
pub mod engine_tests;
