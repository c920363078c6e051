//! Archive-to-repository synchronization.
//!
//! [`SyncPipeline::synchronize`] reconciles a local working directory with
//! a hosted repository:
//!
//! 1. Resolve the authenticated owner, then get-or-create the repository
//!    (a create conflict falls back to fetching the existing one).
//! 2. Walk the directory for regular files, skipping `sync.exclude_globs`.
//!    Paths are `/`-joined, relative to the root, and sorted.
//! 3. For each file, look up the remote `sha` and create or update it.
//!
//! A failing file does not abort the run; it shows up as
//! [`FileOutcome::Failed`] in the returned [`SyncReport`].

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::SyncConfig;
use crate::hosting::{HostError, RepoHost};
use crate::models::{FileOutcome, FileSync, RepoLocation, SyncReport};

const MAX_REPO_NAME_LEN: usize = 100;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("no archive has been uploaded yet")]
    PreconditionMissing,
    #[error("repository hosting is not configured")]
    HostingDisabled,
    #[error("invalid repository name: '{0}'")]
    InvalidRepoName(String),
    #[error("invalid exclude pattern: {0}")]
    InvalidPattern(String),
    #[error("repository unavailable: {0}")]
    RepoUnavailable(String),
}

/// A file found under the working directory, or the walk error that hid it.
struct LocalFile {
    relative: String,
    absolute: Result<PathBuf, String>,
}

pub struct SyncPipeline {
    host: Arc<dyn RepoHost>,
    excludes: GlobSet,
    commit_message: String,
    private: bool,
    op_timeout: Duration,
}

impl SyncPipeline {
    pub fn new(
        host: Arc<dyn RepoHost>,
        config: &SyncConfig,
        private: bool,
        op_timeout: Duration,
    ) -> Result<Self, SyncError> {
        Ok(Self {
            host,
            excludes: build_globset(&config.exclude_globs)?,
            commit_message: config.commit_message.clone(),
            private,
            op_timeout,
        })
    }

    pub async fn synchronize(
        &self,
        working_dir: &Path,
        repo_name: &str,
    ) -> Result<SyncReport, SyncError> {
        validate_repo_name(repo_name)?;
        let location = self.resolve_repository(repo_name).await?;

        let root = working_dir.to_path_buf();
        let excludes = self.excludes.clone();
        let local = tokio::task::spawn_blocking(move || collect_files(&root, &excludes))
            .await
            .map_err(|e| SyncError::RepoUnavailable(format!("file walk aborted: {}", e)))?;

        let mut files = Vec::with_capacity(local.len());
        for file in local {
            let outcome = match file.absolute {
                Ok(path) => self.sync_file(&location, &file.relative, &path).await,
                Err(reason) => FileOutcome::Failed(reason),
            };
            match &outcome {
                FileOutcome::Failed(reason) => {
                    warn!(path = %file.relative, reason = %reason, "file sync failed");
                }
                other => {
                    debug!(path = %file.relative, outcome = ?other, "file synced");
                }
            }
            files.push(FileSync {
                path: file.relative,
                outcome,
            });
        }

        let report = SyncReport { location, files };
        info!(
            repo = %report.location.html_url,
            created = report.created(),
            updated = report.updated(),
            failed = report.failed().len(),
            "sync finished"
        );
        Ok(report)
    }

    async fn resolve_repository(&self, name: &str) -> Result<RepoLocation, SyncError> {
        let owner = self
            .bounded(self.host.authenticated_login())
            .await
            .map_err(unavailable)?;

        match self.bounded(self.host.create_repository(name, self.private)).await {
            Ok(location) => {
                info!(repo = %location.html_url, "repository created");
                Ok(location)
            }
            Err(HostError::Conflict(_)) => {
                debug!(owner = %owner, repo = name, "repository exists, reusing");
                self.bounded(self.host.get_repository(&owner, name))
                    .await
                    .map_err(unavailable)
            }
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn sync_file(&self, repo: &RepoLocation, relative: &str, path: &Path) -> FileOutcome {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) => return FileOutcome::Failed(format!("read failed: {}", e)),
        };

        let prior = match self
            .bounded(self.host.get_file(&repo.owner, &repo.name, relative))
            .await
        {
            Ok(prior) => prior.and_then(|file| file.sha),
            Err(e) => return FileOutcome::Failed(e.to_string()),
        };

        let put = self.host.put_file(
            &repo.owner,
            &repo.name,
            relative,
            &content,
            prior.as_deref(),
            &self.commit_message,
        );
        match self.bounded(put).await {
            Ok(()) if prior.is_some() => FileOutcome::Updated,
            Ok(()) => FileOutcome::Created,
            Err(e) => FileOutcome::Failed(e.to_string()),
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, HostError>>,
    ) -> Result<T, HostError> {
        tokio::time::timeout(self.op_timeout, call)
            .await
            .unwrap_or(Err(HostError::Timeout))
    }
}

fn unavailable(e: HostError) -> SyncError {
    SyncError::RepoUnavailable(e.to_string())
}

pub fn validate_repo_name(name: &str) -> Result<(), SyncError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_REPO_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(SyncError::InvalidRepoName(name.to_string()))
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, SyncError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).map_err(|e| SyncError::InvalidPattern(e.to_string()))?);
    }
    builder
        .build()
        .map_err(|e| SyncError::InvalidPattern(e.to_string()))
}

/// Regular files under `root`, relative and sorted. Symlinks are not
/// followed.
fn collect_files(root: &Path, excludes: &GlobSet) -> Vec<LocalFile> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let relative = e
                    .path()
                    .map(|p| relative_path(root, p))
                    .unwrap_or_default();
                files.push(LocalFile {
                    relative,
                    absolute: Err(e.to_string()),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = relative_path(root, entry.path());
        if excludes.is_match(&relative) {
            continue;
        }
        files.push(LocalFile {
            relative,
            absolute: Ok(entry.into_path()),
        });
    }

    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    files
}

fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RemoteFile;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct HostState {
        repos: HashSet<String>,
        files: HashMap<String, (Vec<u8>, String)>,
        create_calls: usize,
        puts: Vec<(String, Option<String>)>,
        reject_paths: HashSet<String>,
        stall_paths: HashSet<String>,
        create_error: Option<HostError>,
    }

    /// In-memory host keyed by `repo/path`, owned by "octo".
    #[derive(Default)]
    struct FakeHost {
        state: Mutex<HostState>,
    }

    impl FakeHost {
        fn location(name: &str) -> RepoLocation {
            RepoLocation {
                owner: "octo".to_string(),
                name: name.to_string(),
                html_url: format!("https://github.com/octo/{}", name),
            }
        }
    }

    #[async_trait]
    impl RepoHost for FakeHost {
        async fn authenticated_login(&self) -> Result<String, HostError> {
            Ok("octo".to_string())
        }

        async fn create_repository(
            &self,
            name: &str,
            _private: bool,
        ) -> Result<RepoLocation, HostError> {
            let mut state = self.state.lock().unwrap();
            state.create_calls += 1;
            if let Some(e) = state.create_error.clone() {
                return Err(e);
            }
            if !state.repos.insert(name.to_string()) {
                return Err(HostError::Conflict("name already exists".into()));
            }
            Ok(Self::location(name))
        }

        async fn get_repository(&self, _owner: &str, name: &str) -> Result<RepoLocation, HostError> {
            if self.state.lock().unwrap().repos.contains(name) {
                Ok(Self::location(name))
            } else {
                Err(HostError::NotFound)
            }
        }

        async fn get_file(
            &self,
            _owner: &str,
            repo: &str,
            path: &str,
        ) -> Result<Option<RemoteFile>, HostError> {
            let state = self.state.lock().unwrap();
            Ok(state
                .files
                .get(&format!("{}/{}", repo, path))
                .map(|(content, sha)| RemoteFile {
                    path: path.to_string(),
                    content: content.clone(),
                    sha: Some(sha.clone()),
                }))
        }

        async fn put_file(
            &self,
            _owner: &str,
            repo: &str,
            path: &str,
            content: &[u8],
            prior_sha: Option<&str>,
            _message: &str,
        ) -> Result<(), HostError> {
            let stall = {
                let mut state = self.state.lock().unwrap();
                state
                    .puts
                    .push((path.to_string(), prior_sha.map(str::to_string)));
                state.stall_paths.contains(path)
            };
            if stall {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            let mut state = self.state.lock().unwrap();
            if state.reject_paths.contains(path) {
                return Err(HostError::Status {
                    status: 422,
                    message: "rejected".into(),
                });
            }
            let sha = format!("sha-{}", state.puts.len());
            state
                .files
                .insert(format!("{}/{}", repo, path), (content.to_vec(), sha));
            Ok(())
        }
    }

    fn pipeline(host: Arc<FakeHost>) -> SyncPipeline {
        SyncPipeline::new(host, &SyncConfig::default(), true, Duration::from_secs(5)).unwrap()
    }

    fn tree(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (path, content) in files {
            let target = dir.path().join(path);
            std::fs::create_dir_all(target.parent().unwrap()).unwrap();
            std::fs::write(target, content).unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn fresh_repo_creates_every_file() {
        let host = Arc::new(FakeHost::default());
        let dir = tree(&[("a.txt", "a"), ("sub/b.txt", "b")]);

        let report = pipeline(host.clone())
            .synchronize(dir.path(), "demo")
            .await
            .unwrap();

        assert_eq!(report.location.html_url, "https://github.com/octo/demo");
        assert_eq!(report.created(), 2);
        assert!(report.failed().is_empty());
        let state = host.state.lock().unwrap();
        assert_eq!(state.create_calls, 1);
        assert_eq!(
            state.puts,
            vec![("a.txt".to_string(), None), ("sub/b.txt".to_string(), None)]
        );
        assert_eq!(state.files["demo/sub/b.txt"].0, b"b");
    }

    #[tokio::test]
    async fn resync_updates_with_prior_sha() {
        let host = Arc::new(FakeHost::default());
        let dir = tree(&[("a.txt", "a"), ("sub/b.txt", "b")]);
        let pipeline = pipeline(host.clone());

        pipeline.synchronize(dir.path(), "demo").await.unwrap();
        std::fs::write(dir.path().join("a.txt"), "changed").unwrap();
        let report = pipeline.synchronize(dir.path(), "demo").await.unwrap();

        assert_eq!(report.updated(), 2);
        assert_eq!(report.created(), 0);
        let state = host.state.lock().unwrap();
        assert_eq!(state.create_calls, 2);
        assert_eq!(state.puts[2], ("a.txt".to_string(), Some("sha-1".to_string())));
        assert_eq!(state.puts[3], ("sub/b.txt".to_string(), Some("sha-2".to_string())));
        assert_eq!(state.files["demo/a.txt"].0, b"changed");
    }

    #[tokio::test]
    async fn empty_directory_succeeds_without_file_operations() {
        let host = Arc::new(FakeHost::default());
        let dir = TempDir::new().unwrap();

        let report = pipeline(host.clone())
            .synchronize(dir.path(), "empty")
            .await
            .unwrap();

        assert!(report.files.is_empty());
        assert_eq!(report.location.name, "empty");
        assert!(host.state.lock().unwrap().puts.is_empty());
    }

    #[tokio::test]
    async fn per_file_failure_is_reported_not_fatal() {
        let host = Arc::new(FakeHost::default());
        host.state
            .lock()
            .unwrap()
            .reject_paths
            .insert("bad.bin".to_string());
        let dir = tree(&[("bad.bin", "x"), ("good.txt", "y")]);

        let report = pipeline(host.clone())
            .synchronize(dir.path(), "demo")
            .await
            .unwrap();

        assert_eq!(report.uploaded(), 1);
        let failed = report.failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].path, "bad.bin");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_file_times_out_and_others_still_upload() {
        let host = Arc::new(FakeHost::default());
        host.state
            .lock()
            .unwrap()
            .stall_paths
            .insert("b.txt".to_string());
        let dir = tree(&[("a.txt", "a"), ("b.txt", "b"), ("c.txt", "c")]);

        let report = pipeline(host.clone())
            .synchronize(dir.path(), "demo")
            .await
            .unwrap();

        let outcomes: Vec<(&str, &FileOutcome)> = report
            .files
            .iter()
            .map(|f| (f.path.as_str(), &f.outcome))
            .collect();
        assert_eq!(outcomes[0], ("a.txt", &FileOutcome::Created));
        assert_eq!(
            outcomes[1],
            ("b.txt", &FileOutcome::Failed(HostError::Timeout.to_string()))
        );
        assert_eq!(outcomes[2], ("c.txt", &FileOutcome::Created));
        let state = host.state.lock().unwrap();
        assert!(!state.files.contains_key("demo/b.txt"));
        assert!(state.files.contains_key("demo/c.txt"));
    }

    #[tokio::test]
    async fn create_failure_makes_repo_unavailable() {
        let host = Arc::new(FakeHost::default());
        host.state.lock().unwrap().create_error = Some(HostError::Status {
            status: 403,
            message: "forbidden".into(),
        });
        let dir = tree(&[("a.txt", "a")]);

        let err = pipeline(host.clone())
            .synchronize(dir.path(), "demo")
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::RepoUnavailable(_)));
        assert!(host.state.lock().unwrap().puts.is_empty());
    }

    #[tokio::test]
    async fn invalid_name_is_rejected_before_network() {
        let host = Arc::new(FakeHost::default());
        let dir = TempDir::new().unwrap();

        let err = pipeline(host.clone())
            .synchronize(dir.path(), "bad name!")
            .await
            .unwrap_err();

        assert_eq!(err, SyncError::InvalidRepoName("bad name!".to_string()));
        assert_eq!(host.state.lock().unwrap().create_calls, 0);
    }

    #[tokio::test]
    async fn excluded_paths_are_skipped() {
        let host = Arc::new(FakeHost::default());
        let dir = tree(&[
            ("src/main.rs", "fn main() {}"),
            ("src/.git/config", "x"),
            ("__MACOSX/._main.rs", "x"),
        ]);

        let report = pipeline(host.clone())
            .synchronize(dir.path(), "demo")
            .await
            .unwrap();

        let paths: Vec<&str> = report.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["src/main.rs"]);
    }

    #[test]
    fn repo_name_rules() {
        assert!(validate_repo_name("my-new_project.v2").is_ok());
        assert!(validate_repo_name("").is_err());
        assert!(validate_repo_name("a/b").is_err());
        assert!(validate_repo_name(&"x".repeat(101)).is_err());
    }

    #[test]
    fn bad_exclude_pattern_fails_construction() {
        let config = SyncConfig {
            exclude_globs: vec!["[".to_string()],
            ..SyncConfig::default()
        };
        let result = SyncPipeline::new(
            Arc::new(FakeHost::default()),
            &config,
            true,
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(SyncError::InvalidPattern(_))));
    }
}
