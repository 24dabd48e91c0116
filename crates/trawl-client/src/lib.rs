pub mod client;

pub use client::ReqwestClient;
