//! Fetcher — downloads, verifies, and atomically places function code.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kiln_core::checksum::Checksum;
use kiln_core::{FetchRequest, FetchType, HttpClient, KilnError, KilnResult, PackageContent};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::source::FunctionSource;

const TMP_SUFFIX: &str = ".tmp";
const VERIFY_CHUNK: usize = 64 * 1024;

/// Places code for fetch requests into one shared directory.
#[derive(Clone)]
pub struct Fetcher {
    shared_volume: PathBuf,
    source: Arc<dyn FunctionSource>,
    http: HttpClient,
    download_timeout: Duration,
}

impl Fetcher {
    pub fn new(
        shared_volume: impl Into<PathBuf>,
        source: Arc<dyn FunctionSource>,
        http: HttpClient,
        download_timeout: Duration,
    ) -> Self {
        Self {
            shared_volume: shared_volume.into(),
            source,
            http,
            download_timeout,
        }
    }

    pub fn shared_volume(&self) -> &Path {
        &self.shared_volume
    }

    /// Execute one fetch request, returning the final path on success.
    ///
    /// The content lands in `<filename>.tmp` first and is renamed into
    /// place only once complete and verified; on any failure the
    /// temporary file is removed and nothing appears at the destination.
    pub async fn load(&self, req: &FetchRequest) -> KilnResult<PathBuf> {
        validate_filename(&req.filename)?;
        let dest = self.shared_volume.join(&req.filename);
        let tmp = self
            .shared_volume
            .join(format!("{}{TMP_SUFFIX}", req.filename));

        debug!(fetch_type = %req.fetch_type, filename = %req.filename, "fetch started");
        match self.fetch_into(req, &tmp).await {
            Ok(()) => {
                tokio::fs::rename(&tmp, &dest)
                    .await
                    .map_err(|e| io_error("rename", &tmp, e))?;
                info!(
                    fetch_type = %req.fetch_type,
                    path = %dest.display(),
                    "code placed on shared volume"
                );
                Ok(dest)
            }
            Err(err) => {
                match tokio::fs::remove_file(&tmp).await {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                        warn!(path = %tmp.display(), error = %e, "failed to remove temp file");
                    }
                    _ => {}
                }
                warn!(
                    fetch_type = %req.fetch_type,
                    filename = %req.filename,
                    error = %err,
                    "fetch failed"
                );
                Err(err)
            }
        }
    }

    async fn fetch_into(&self, req: &FetchRequest, tmp: &Path) -> KilnResult<()> {
        match req.fetch_type {
            FetchType::Url => {
                let url = req
                    .url
                    .as_deref()
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| KilnError::Validation("url fetch requires a url".into()))?;
                self.download(url, tmp).await
            }
            FetchType::Source | FetchType::Deployment => {
                let function_ref = req.function.as_ref().ok_or_else(|| {
                    KilnError::Validation(format!(
                        "{} fetch requires a function reference",
                        req.fetch_type
                    ))
                })?;
                let function = self.source.get_function(function_ref).await?;
                if let Some(expected) = &req.content_version {
                    let current = function.metadata.content_version();
                    if *expected != current {
                        return Err(KilnError::NotFound(format!(
                            "{}/{} revision {expected} is gone (current is {current})",
                            function_ref.namespace, function_ref.name
                        )));
                    }
                }
                let package = function.package(req.fetch_type).ok_or_else(|| {
                    KilnError::Internal(format!("no package for {} fetch", req.fetch_type))
                })?;

                match package.content()? {
                    PackageContent::Literal(bytes) => write_file(tmp, bytes).await,
                    PackageContent::Reference { url, checksum } => {
                        self.download(url, tmp).await?;
                        verify_file(tmp, checksum).await
                    }
                }
            }
        }
    }

    async fn download(&self, url: &str, tmp: &Path) -> KilnResult<()> {
        let resp = self
            .http
            .get(url, self.download_timeout)
            .await
            .map_err(|e| KilnError::Download(e.to_string()))?;
        if !resp.is_success() {
            return Err(KilnError::Download(format!(
                "GET {url} returned {}",
                resp.status
            )));
        }
        debug!(%url, bytes = resp.body.len(), "package downloaded");
        write_file(tmp, &resp.body).await
    }
}

/// Accept only a single plain path component.
pub fn validate_filename(filename: &str) -> KilnResult<()> {
    let bad = filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains(['/', '\\', '\0']);
    if bad {
        return Err(KilnError::Validation(format!(
            "filename {filename:?} must be a plain file name"
        )));
    }
    Ok(())
}

async fn write_file(path: &Path, bytes: &[u8]) -> KilnResult<()> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| io_error("create", path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| io_error("write", path, e))?;
    file.sync_all()
        .await
        .map_err(|e| io_error("sync", path, e))?;
    Ok(())
}

/// Hash what actually landed on disk and compare with the declared sum.
async fn verify_file(path: &Path, checksum: &Checksum) -> KilnResult<()> {
    let mut hasher = checksum.hasher()?;
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| io_error("open", path, e))?;
    let mut buf = vec![0u8; VERIFY_CHUNK];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| io_error("read", path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    checksum.verify_hex(&hasher.finish_hex())
}

fn io_error(op: &str, path: &Path, err: std::io::Error) -> KilnError {
    KilnError::Internal(format!("{op} {}: {err}", path.display()))
}
