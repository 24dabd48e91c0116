//! Isolated execution of scraper entrypoints.
//!
//! ```text
//! ┌──────────────────────────┐   ControllerMessage    ┌──────────────────────────┐
//! │ SandboxController        │ ─────────────────────▶ │ worker task              │
//! │                          │  launch                │                          │
//! │  • creates sessions      │  fetch_response        │  • ScrapeContext         │
//! │  • re-checks allow-list  │  shutdown              │     - SandboxFs (folder) │
//! │  • performs proxied      │                        │     - NetPermissions     │
//! │    fetches through its   │ ◀───────────────────── │     - own FetchEngine    │
//! │    own FetchEngine       │   WorkerMessage        │  • runs the entrypoint   │
//! │                          │  fetch / complete /    │                          │
//! └──────────────────────────┘  error                 └──────────────────────────┘
//! ```
//!
//! Session states: `Created → Launched → (Running ⇄ ProxyingFetch) →
//! Complete | Errored`. Permission and protocol failures end only the
//! session that caused them.

pub mod context;
pub mod controller;
pub mod permissions;
pub mod protocol;
pub(crate) mod worker;

pub use context::ScrapeContext;
pub use controller::{
    ControllerConfig, SandboxController, Session, SessionEvent, SessionOptions, SessionReporter,
    SessionState, TracingSessionReporter,
};
pub use permissions::{NetPermissions, SandboxFs};
pub use protocol::{ControllerMessage, WorkerErrorKind, WorkerMessage};
