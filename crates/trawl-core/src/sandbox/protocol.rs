//! Typed messages exchanged between the controller and a sandbox worker.
//!
//! Both enums are tagged by `command`, so the same values can cross a process
//! boundary as JSON without changing shape.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::HeaderMap;
use crate::routing::ScraperDefinition;

/// Controller to sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControllerMessage {
    /// Start the entrypoint `entrypoint_ref` of scraper `name` on `input`.
    Launch {
        fetch_piping: bool,
        definition: ScraperDefinition,
        folder: PathBuf,
        database_folder: PathBuf,
        name: String,
        entrypoint_ref: usize,
        input: String,
    },
    /// Answer to a proxied [`WorkerMessage::Fetch`].
    FetchResponse {
        fetch_id: String,
        status: u16,
        #[serde(default)]
        headers: HeaderMap,
        #[serde(default)]
        body: Vec<u8>,
        /// Transport failure on the controller side.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Release owned resources once the entrypoint has finished.
    Shutdown,
}

/// Sandbox to controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WorkerMessage {
    Fetch {
        fetch_id: String,
        method: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "HeaderMap::is_empty")]
        headers: HeaderMap,
    },
    Complete,
    Error {
        #[serde(rename = "type")]
        kind: WorkerErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stacktrace: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerErrorKind {
    PermissionDenied,
    ProtocolViolation,
    Generic,
}

impl ControllerMessage {
    pub fn command(&self) -> &'static str {
        match self {
            ControllerMessage::Launch { .. } => "launch",
            ControllerMessage::FetchResponse { .. } => "fetch_response",
            ControllerMessage::Shutdown => "shutdown",
        }
    }

    /// Parse a JSON message; anything unrecognised is a protocol violation.
    pub fn decode(raw: &str) -> Result<Self, AppError> {
        serde_json::from_str(raw).map_err(|e| {
            AppError::ProtocolViolation(format!("unrecognised controller message: {e}"))
        })
    }

    pub fn encode(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl WorkerMessage {
    pub fn command(&self) -> &'static str {
        match self {
            WorkerMessage::Fetch { .. } => "fetch",
            WorkerMessage::Complete => "complete",
            WorkerMessage::Error { .. } => "error",
        }
    }

    pub fn decode(raw: &str) -> Result<Self, AppError> {
        serde_json::from_str(raw)
            .map_err(|e| AppError::ProtocolViolation(format!("unrecognised worker message: {e}")))
    }

    pub fn encode(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Report a failed entrypoint.
    pub fn from_error(error: &AppError) -> Self {
        match error {
            AppError::InvalidPermissions {
                message,
                stacktrace,
            } => WorkerMessage::Error {
                kind: WorkerErrorKind::PermissionDenied,
                message: message.clone(),
                stacktrace: stacktrace.clone(),
            },
            AppError::ProtocolViolation(message) => WorkerMessage::Error {
                kind: WorkerErrorKind::ProtocolViolation,
                message: message.clone(),
                stacktrace: None,
            },
            other => WorkerMessage::Error {
                kind: WorkerErrorKind::Generic,
                message: other.to_string(),
                stacktrace: None,
            },
        }
    }
}

impl WorkerErrorKind {
    /// The controller-side error for a reported failure.
    pub fn into_error(self, message: String, stacktrace: Option<String>) -> AppError {
        match self {
            WorkerErrorKind::PermissionDenied => AppError::InvalidPermissions {
                message,
                stacktrace,
            },
            WorkerErrorKind::ProtocolViolation => AppError::ProtocolViolation(message),
            WorkerErrorKind::Generic => AppError::Generic(message),
        }
    }
}
