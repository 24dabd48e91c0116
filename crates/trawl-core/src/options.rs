use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::models::OutboundRequest;

/// Which response statuses a caller accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StatusPolicy {
    /// Any 2xx status.
    #[default]
    Success,
    /// Exactly these statuses.
    OneOf(Vec<u16>),
    /// Every status, including errors.
    Any,
}

impl StatusPolicy {
    pub fn accepts(&self, status: u16) -> bool {
        match self {
            StatusPolicy::Success => (200..300).contains(&status),
            StatusPolicy::OneOf(allowed) => allowed.contains(&status),
            StatusPolicy::Any => true,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            StatusPolicy::Success => "2xx".to_string(),
            StatusPolicy::OneOf(allowed) => allowed
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(", "),
            StatusPolicy::Any => "any".to_string(),
        }
    }
}

/// Where a write-mode fetch puts the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FileTarget {
    /// `<download_folder>/files/<folder_prefix><hash>/<url basename>`.
    #[default]
    Generated,
    /// An explicit path; relative paths resolve under the download folder.
    Path(PathBuf),
}

/// Resolved response handling for one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ResponseMode {
    Read,
    Write(FileTarget),
}

/// Per-request fetch policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    /// Consult and populate the request cache.
    pub cache: bool,

    /// Cached entries are ignored after this instant.
    pub expires_on: Option<DateTime<Utc>>,

    /// Headers sent on the wire but excluded from the cache identity.
    pub ignore_headers: Vec<String>,

    pub validate_status: StatusPolicy,

    /// Read the body into memory.
    pub read: bool,

    /// Stream the body to a file. Mutually exclusive with `read`.
    pub write: Option<FileTarget>,

    /// Prefix of the generated folder for [`FileTarget::Generated`].
    pub folder_prefix: Option<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            cache: true,
            expires_on: None,
            ignore_headers: Vec::new(),
            validate_status: StatusPolicy::Success,
            read: true,
            write: None,
            folder_prefix: None,
        }
    }
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_cache(mut self) -> Self {
        self.cache = false;
        self
    }

    pub fn expires_on(mut self, expires_on: DateTime<Utc>) -> Self {
        self.expires_on = Some(expires_on);
        self
    }

    pub fn ignore_header(mut self, name: impl Into<String>) -> Self {
        self.ignore_headers.push(name.into());
        self
    }

    pub fn validate_status(mut self, policy: StatusPolicy) -> Self {
        self.validate_status = policy;
        self
    }

    /// Write the body to `target` instead of reading it.
    pub fn write_to(mut self, target: FileTarget) -> Self {
        self.read = false;
        self.write = Some(target);
        self
    }

    pub fn folder_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.folder_prefix = Some(prefix.into());
        self
    }

    pub(crate) fn mode(&self) -> Result<ResponseMode, AppError> {
        if let Some(prefix) = &self.folder_prefix
            && !is_plain_prefix(prefix)
        {
            return Err(AppError::ConfigError(format!(
                "folder_prefix '{prefix}' must not contain path separators or '..'"
            )));
        }
        match (self.read, &self.write) {
            (true, Some(_)) => Err(AppError::ConfigError(
                "a fetch cannot both read the body into memory and write it to a file".into(),
            )),
            (_, Some(target)) => Ok(ResponseMode::Write(target.clone())),
            (_, None) => Ok(ResponseMode::Read),
        }
    }

    /// Same policy, forced into read mode.
    pub(crate) fn reading(&self) -> Self {
        Self {
            read: true,
            write: None,
            ..self.clone()
        }
    }

    /// Same policy, forced into write mode (generated target unless set).
    pub(crate) fn writing(&self) -> Self {
        Self {
            read: false,
            write: Some(self.write.clone().unwrap_or_default()),
            ..self.clone()
        }
    }
}

/// A prefix is glued onto one generated folder name and must stay inside it.
pub(crate) fn is_plain_prefix(prefix: &str) -> bool {
    !prefix.contains(['/', '\\']) && !prefix.contains("..")
}

impl From<&str> for OutboundRequest {
    fn from(url: &str) -> Self {
        OutboundRequest::get(url)
    }
}

impl From<String> for OutboundRequest {
    fn from(url: String) -> Self {
        OutboundRequest::get(url)
    }
}
