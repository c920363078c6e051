//! Archive intake: validate, extract and register uploaded ZIP bundles.
//!
//! Every ingestion gets its own fresh directory under
//! `intake.work_root`, created with an exclusive OS-level create, so
//! concurrent or repeated uploads never share a tree. The directory is
//! registered as the user's [`PendingArchive`] only after extraction
//! succeeds; any failure drops it again and leaves the session untouched.
//!
//! Extraction is bounded:
//!
//! | Limit | Config | Error |
//! |-------|--------|-------|
//! | entries per archive | `intake.max_entries` | [`IntakeError::TooLarge`] |
//! | total uncompressed bytes | `intake.max_extracted_bytes` | [`IntakeError::TooLarge`] |
//! | downloaded bytes | `intake.max_download_bytes` | [`IntakeError::TooLarge`] |
//!
//! Entry names that escape the extraction root (absolute paths, `..`)
//! make the whole archive [`IntakeError::Corrupt`]. Downloads are only
//! made from hosts listed in `intake.download_hosts`.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::IntakeConfig;
use crate::models::UserId;
use crate::sessions::{PendingArchive, SessionStore};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("archive is corrupt: {0}")]
    Corrupt(String),
    #[error("archive exceeds the {what} limit of {limit}")]
    TooLarge { what: &'static str, limit: u64 },
    #[error("unsupported upload type: {0}")]
    UnsupportedType(String),
    #[error("archive download failed: {0}")]
    Download(String),
    #[error("downloads from this source are not allowed: {0}")]
    SourceNotAllowed(String),
    #[error("archive I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a successful ingestion.
#[derive(Debug, Clone)]
pub struct IngestedArchive {
    pub dir: PathBuf,
    pub files: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_entries: usize,
    max_bytes: u64,
}

pub struct ArchiveIntake {
    config: IntakeConfig,
    sessions: Arc<SessionStore>,
    http: reqwest::Client,
}

impl ArchiveIntake {
    pub fn new(config: IntakeConfig, sessions: Arc<SessionStore>) -> Result<Self, IntakeError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.download_timeout_secs))
            .build()
            .map_err(|e| IntakeError::Download(e.to_string()))?;
        Ok(Self {
            config,
            sessions,
            http,
        })
    }

    /// Rejects uploads that are not named `*.zip`.
    pub fn check_filename(filename: &str) -> Result<(), IntakeError> {
        if filename.to_ascii_lowercase().ends_with(".zip") {
            Ok(())
        } else {
            Err(IntakeError::UnsupportedType(filename.to_string()))
        }
    }

    /// Downloads archive bytes from `url`, bounded by the download timeout
    /// and `max_download_bytes`. The host must be in `download_hosts`.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, IntakeError> {
        let url = self.allowed_source(url)?;
        let limit = self.config.max_download_bytes;
        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| IntakeError::Download(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IntakeError::Download(format!("HTTP {}", status)));
        }
        if response.content_length().is_some_and(|len| len > limit) {
            return Err(IntakeError::TooLarge {
                what: "download size",
                limit,
            });
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| IntakeError::Download(e.to_string()))?
        {
            if bytes.len() as u64 + chunk.len() as u64 > limit {
                return Err(IntakeError::TooLarge {
                    what: "download size",
                    limit,
                });
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }

    /// Extracts `bytes` into a fresh working directory and registers it as
    /// the pending archive of `user`, superseding any previous one.
    pub async fn ingest(
        &self,
        user: &UserId,
        bytes: Vec<u8>,
    ) -> Result<IngestedArchive, IntakeError> {
        let work_root = self.config.work_root();
        let limits = self.limits();

        let (dir, files, total) = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&work_root)?;
            let dir = tempfile::Builder::new()
                .prefix("relay-")
                .tempdir_in(&work_root)?;
            let (files, total) = extract_archive(&bytes, dir.path(), limits)?;
            Ok::<_, IntakeError>((dir, files, total))
        })
        .await
        .map_err(|e| IntakeError::Io(std::io::Error::other(e)))??;

        let ingested = IngestedArchive {
            dir: dir.path().to_path_buf(),
            files,
            bytes: total,
        };
        info!(
            user = %user,
            dir = %ingested.dir.display(),
            files,
            bytes = total,
            "archive extracted"
        );
        self.sessions.set_pending_archive(user, PendingArchive::new(dir));
        Ok(ingested)
    }

    /// Extracts `bytes` into `dest` under the same limits as [`ingest`],
    /// without touching any session. `dest` must not exist yet.
    ///
    /// [`ingest`]: ArchiveIntake::ingest
    pub async fn unpack_into(
        &self,
        bytes: Vec<u8>,
        dest: &Path,
    ) -> Result<(usize, u64), IntakeError> {
        if dest.exists() {
            return Err(IntakeError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", dest.display()),
            )));
        }
        let dest = dest.to_path_buf();
        let limits = self.limits();
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dest)?;
            let result = extract_archive(&bytes, &dest, limits);
            if result.is_err() {
                let _ = std::fs::remove_dir_all(&dest);
            }
            result
        })
        .await
        .map_err(|e| IntakeError::Io(std::io::Error::other(e)))?
    }

    fn allowed_source(&self, url: &str) -> Result<reqwest::Url, IntakeError> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| IntakeError::SourceNotAllowed(format!("{}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "https" | "http") {
            return Err(IntakeError::SourceNotAllowed(format!(
                "unsupported scheme '{}'",
                parsed.scheme()
            )));
        }
        let host = parsed.host_str().unwrap_or_default();
        let listed = self
            .config
            .download_hosts
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(host));
        if !listed {
            return Err(IntakeError::SourceNotAllowed(host.to_string()));
        }
        Ok(parsed)
    }

    fn limits(&self) -> Limits {
        Limits {
            max_entries: self.config.max_entries,
            max_bytes: self.config.max_extracted_bytes,
        }
    }
}

/// Extracts every entry of the ZIP in `bytes` below `dest`.
/// Returns the number of files written and their total size.
fn extract_archive(
    bytes: &[u8],
    dest: &Path,
    limits: Limits,
) -> Result<(usize, u64), IntakeError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| IntakeError::Corrupt(e.to_string()))?;

    if archive.len() > limits.max_entries {
        return Err(IntakeError::TooLarge {
            what: "entry count",
            limit: limits.max_entries as u64,
        });
    }

    let mut files = 0usize;
    let mut total = 0u64;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| IntakeError::Corrupt(e.to_string()))?;

        let relative = entry
            .enclosed_name()
            .ok_or_else(|| IntakeError::Corrupt(format!("unsafe entry path: {}", entry.name())))?;
        let target = dest.join(&relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }

        // Symlinks could point outside the working directory.
        if entry
            .unix_mode()
            .is_some_and(|mode| mode & 0o170000 == 0o120000)
        {
            warn!(entry = entry.name(), "skipping symlink entry");
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let remaining = limits.max_bytes - total;
        let mut out = std::fs::File::create(&target)?;
        let written = copy_bounded(&mut entry, &mut out, remaining)?;
        if written > remaining {
            return Err(IntakeError::TooLarge {
                what: "extracted size",
                limit: limits.max_bytes,
            });
        }
        total += written;
        files += 1;
    }

    Ok((files, total))
}

/// Copies at most `remaining + 1` bytes, so a result above `remaining`
/// means the entry blew the budget.
fn copy_bounded(
    entry: &mut impl Read,
    out: &mut impl Write,
    remaining: u64,
) -> Result<u64, IntakeError> {
    let mut limited = entry.take(remaining + 1);
    std::io::copy(&mut limited, out).map_err(|e| {
        // The zip reader reports CRC mismatches as InvalidData.
        if e.kind() == std::io::ErrorKind::InvalidData {
            IntakeError::Corrupt(e.to_string())
        } else {
            IntakeError::Io(e)
        }
    })
}
