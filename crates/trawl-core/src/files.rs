//! Download destinations and atomic file writes.
//!
//! Bodies are streamed into `<download_folder>/.tmp/` and renamed into place
//! only once fully written, so a reader never sees a partial file at the
//! final path. The temp area lives inside the download folder to keep the
//! rename on one filesystem.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use url::Url;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::compute_hash;
use crate::options::FileTarget;
use crate::traits::BodyStream;

const TEMP_DIR: &str = ".tmp";
const FILES_DIR: &str = "files";

/// Resolve where a write-mode fetch should land.
pub(crate) fn destination(
    download_folder: &Path,
    target: &FileTarget,
    folder_prefix: Option<&str>,
    request_key: &str,
    url: &str,
) -> PathBuf {
    match target {
        FileTarget::Path(path) if path.is_absolute() => path.clone(),
        FileTarget::Path(path) => download_folder.join(path),
        FileTarget::Generated => {
            let hash = compute_hash(request_key);
            download_folder
                .join(FILES_DIR)
                .join(format!("{}{}", folder_prefix.unwrap_or(""), &hash[..12]))
                .join(url_basename(url))
        }
    }
}

/// Last non-empty path segment of `url`, or `index`.
pub(crate) fn url_basename(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(str::to_string))
        })
        .filter(|name| name != "." && name != "..")
        .unwrap_or_else(|| "index".to_string())
}

/// Stream `body` into `dest` through the temp area. Returns bytes written.
pub(crate) async fn write_stream_atomic(
    download_folder: &Path,
    dest: &Path,
    mut body: BodyStream,
) -> Result<u64, AppError> {
    let temp_dir = download_folder.join(TEMP_DIR);
    tokio::fs::create_dir_all(&temp_dir).await?;
    let temp_path = temp_dir.join(format!("{}.part", Uuid::new_v4()));

    let written = async {
        let mut file = tokio::fs::File::create(&temp_path).await?;
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok::<_, AppError>(written)
    }
    .await;

    let written = match written {
        Ok(written) => written,
        Err(e) => {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e);
        }
    };

    if let Err(e) = move_into_place(&temp_path, dest).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e);
    }
    tracing::debug!(path = %dest.display(), bytes = written, "Wrote response body");
    Ok(written)
}

pub(crate) async fn write_bytes_atomic(
    download_folder: &Path,
    dest: &Path,
    bytes: Bytes,
) -> Result<u64, AppError> {
    let body: BodyStream = Box::pin(futures::stream::once(async move { Ok(bytes) }));
    write_stream_atomic(download_folder, dest, body).await
}

/// Copy an existing body file to `dest` with the same atomicity.
pub(crate) async fn copy_atomic(
    download_folder: &Path,
    src: &Path,
    dest: &Path,
) -> Result<u64, AppError> {
    let bytes = tokio::fs::read(src).await?;
    write_bytes_atomic(download_folder, dest, Bytes::from(bytes)).await
}

async fn move_into_place(temp_path: &Path, dest: &Path) -> Result<(), AppError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::rename(temp_path, dest).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_uses_last_segment() {
        assert_eq!(url_basename("https://search.brave.com/index.html"), "index.html");
        assert_eq!(url_basename("https://example.com/a/b/"), "b");
        assert_eq!(url_basename("https://example.com"), "index");
        assert_eq!(url_basename("not a url"), "index");
    }

    #[test]
    fn generated_destination_carries_prefix() {
        let root = Path::new("/downloads");
        let dest = destination(
            root,
            &FileTarget::Generated,
            Some("foobar-"),
            "key",
            "https://example.com/index.html",
        );
        assert!(dest.starts_with("/downloads/files"));
        assert_eq!(dest.file_name().unwrap(), "index.html");
        let folder = dest.parent().unwrap().file_name().unwrap().to_str().unwrap();
        assert!(folder.starts_with("foobar-"));
        assert_eq!(folder.len(), "foobar-".len() + 12);
    }

    #[test]
    fn relative_targets_resolve_under_download_folder() {
        let root = Path::new("/downloads");
        let target = FileTarget::Path("x/y.bin".into());
        let dest = destination(root, &target, None, "k", "https://e.com");
        assert_eq!(dest, Path::new("/downloads/x/y.bin"));
        let target = FileTarget::Path("/tmp/z.bin".into());
        let dest = destination(root, &target, None, "k", "https://e.com");
        assert_eq!(dest, Path::new("/tmp/z.bin"));
    }

    #[tokio::test]
    async fn writes_land_complete_and_leave_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested/out.txt");
        let body: BodyStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from("hello ")),
            Ok(Bytes::from("world")),
        ]));

        let written = write_stream_atomic(dir.path(), &dest, body).await.unwrap();
        assert_eq!(written, 11);
        assert_eq!(tokio::fs::read_to_string(&dest).await.unwrap(), "hello world");
        let mut temp = tokio::fs::read_dir(dir.path().join(TEMP_DIR)).await.unwrap();
        assert!(temp.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_stream_never_reaches_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.txt");
        let body: BodyStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from("partial")),
            Err(AppError::NetworkError("reset".into())),
        ]));

        assert!(write_stream_atomic(dir.path(), &dest, body).await.is_err());
        assert!(!dest.exists());
        let mut temp = tokio::fs::read_dir(dir.path().join(TEMP_DIR)).await.unwrap();
        assert!(temp.next_entry().await.unwrap().is_none());
    }
}
