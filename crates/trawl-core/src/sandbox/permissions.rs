//! Capability grants for a sandbox session: which origins it may reach and
//! which folder it may touch.

use std::path::{Component, Path, PathBuf};

use url::Url;

use crate::error::AppError;

#[derive(Debug, Clone, PartialEq, Eq)]
struct OriginPattern {
    host: String,
    port: Option<u16>,
    /// `*.suffix`: any subdomain of `host`.
    wildcard: bool,
}

impl OriginPattern {
    fn parse(raw: &str) -> Result<Self, AppError> {
        let raw = raw.trim().to_ascii_lowercase();
        let (wildcard, rest) = match raw.strip_prefix("*.") {
            Some(rest) => (true, rest.to_string()),
            None => (false, raw.clone()),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    AppError::ConfigError(format!("invalid port in net permission '{raw}'"))
                })?;
                (host.to_string(), Some(port))
            }
            None => (rest, None),
        };
        if host.is_empty() || host.contains('/') || host.contains('*') {
            return Err(AppError::ConfigError(format!("invalid net permission '{raw}'")));
        }
        Ok(Self {
            host,
            port,
            wildcard,
        })
    }

    fn matches(&self, host: &str, port: Option<u16>) -> bool {
        let host_ok = if self.wildcard {
            host.strip_suffix(self.host.as_str())
                .is_some_and(|prefix| prefix.ends_with('.') && prefix.len() > 1)
        } else {
            host == self.host
        };
        host_ok && self.port.is_none_or(|allowed| port == Some(allowed))
    }
}

/// Network allow-list for one session.
///
/// `host` allows any port on that host, `host:port` one port, and
/// `*.suffix` every subdomain of `suffix`. An inherited grant allows
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetPermissions {
    allow: Option<Vec<OriginPattern>>,
}

impl NetPermissions {
    /// No restriction beyond the controller's own.
    pub fn inherit() -> Self {
        Self { allow: None }
    }

    pub fn allow_list<I, S>(patterns: I) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allow = patterns
            .into_iter()
            .map(|p| OriginPattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { allow: Some(allow) })
    }

    /// Build from a scraper definition's optional `permissions` list.
    pub fn from_patterns(patterns: Option<&[String]>) -> Result<Self, AppError> {
        match patterns {
            Some(patterns) => Self::allow_list(patterns),
            None => Ok(Self::inherit()),
        }
    }

    pub fn is_inherited(&self) -> bool {
        self.allow.is_none()
    }

    /// Fail with `InvalidPermissions` unless `url` may be fetched.
    pub fn check(&self, url: &str) -> Result<(), AppError> {
        let Some(allow) = &self.allow else {
            return Ok(());
        };
        let parsed =
            Url::parse(url).map_err(|e| AppError::HttpError(format!("invalid URL '{url}': {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| AppError::HttpError(format!("URL has no host: {url}")))?
            .to_ascii_lowercase();
        let port = parsed.port_or_known_default();

        if allow.iter().any(|pattern| pattern.matches(&host, port)) {
            return Ok(());
        }
        let origin = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };
        Err(AppError::permission_denied(format!(
            "Requires net access to \"{origin}\""
        )))
    }
}

/// File API confined to one folder.
///
/// Paths are resolved lexically against the root; anything that lands
/// outside it fails with `InvalidPermissions` before touching the disk.
#[derive(Debug, Clone)]
pub struct SandboxFs {
    root: PathBuf,
}

impl SandboxFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: normalize(&root.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` inside the root.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf, AppError> {
        let path = path.as_ref();
        let resolved = normalize(&self.root.join(path));
        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(AppError::permission_denied(format!(
                "Requires access to \"{}\", outside the sandbox folder",
                path.display()
            )))
        }
    }

    pub async fn read(&self, path: impl AsRef<Path>) -> Result<Vec<u8>, AppError> {
        Ok(tokio::fs::read(self.resolve(path)?).await?)
    }

    pub async fn read_to_string(&self, path: impl AsRef<Path>) -> Result<String, AppError> {
        Ok(tokio::fs::read_to_string(self.resolve(path)?).await?)
    }

    pub async fn write(
        &self,
        path: impl AsRef<Path>,
        contents: impl AsRef<[u8]>,
    ) -> Result<(), AppError> {
        Ok(tokio::fs::write(self.resolve(path)?, contents).await?)
    }

    pub async fn create_dir_all(&self, path: impl AsRef<Path>) -> Result<(), AppError> {
        Ok(tokio::fs::create_dir_all(self.resolve(path)?).await?)
    }

    pub async fn exists(&self, path: impl AsRef<Path>) -> Result<bool, AppError> {
        Ok(tokio::fs::try_exists(self.resolve(path)?).await?)
    }

    pub async fn remove_file(&self, path: impl AsRef<Path>) -> Result<(), AppError> {
        Ok(tokio::fs::remove_file(self.resolve(path)?).await?)
    }
}

/// Collapse `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
