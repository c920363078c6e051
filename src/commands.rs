//! One-shot CLI commands.
//!
//! Each `run_*` function backs one `relay` subcommand and prints
//! human-readable output to stdout.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::intake::ArchiveIntake;
use crate::models::{ConversationTurn, FileOutcome};
use crate::relay::{describe_report, dispatcher_from_config, sync_from_config};
use crate::sessions::SessionStore;
use crate::sync::SyncError;

/// Prints the effective configuration and fails if the process could not
/// serve with it.
pub fn run_check(config: &Config) -> Result<()> {
    let creds = &config.credentials;
    let set = |present: bool| if present { "set" } else { "missing" };

    println!("{:<20} {}", "SETTING", "VALUE");
    println!("{:<20} {}", "completion keys", creds.completion_keys.len());
    println!("{:<20} {}", "completion model", config.completion.model);
    println!("{:<20} {}", "completion url", config.completion.base_url);
    println!(
        "{:<20} {}",
        "messaging token",
        set(creds.messaging_token.is_some())
    );
    println!(
        "{:<20} {}",
        "hosting",
        if creds.hosting_token.is_some() {
            "enabled"
        } else {
            "disabled (no GITHUB_TOKEN)"
        }
    );
    println!("{:<20} {}", "work root", config.intake.work_root().display());
    println!("{:<20} {}", "listen", config.server.bind_addr());

    creds.require_serving()?;
    // Builds every collaborator, which also validates exclude globs and URLs.
    sync_from_config(config)?;
    dispatcher_from_config(config)?;
    println!("\nConfiguration OK.");
    Ok(())
}

/// Sends one message through the dispatcher and prints the answer.
pub async fn run_complete(config: &Config, text: &str) -> Result<()> {
    let dispatcher = dispatcher_from_config(config)?;
    let answer = dispatcher
        .complete(&[ConversationTurn::user(text)])
        .await
        .context("Completion failed")?;
    println!("{}", answer);
    Ok(())
}

/// Pushes a local directory to the repository `repo`.
pub async fn run_push(config: &Config, dir: &Path, repo: &str) -> Result<()> {
    if !dir.is_dir() {
        bail!("Not a directory: {}", dir.display());
    }
    let pipeline = sync_from_config(config)?.ok_or(SyncError::HostingDisabled)?;
    let report = pipeline.synchronize(dir, repo).await?;

    for file in &report.files {
        let status = match &file.outcome {
            FileOutcome::Created => "created".to_string(),
            FileOutcome::Updated => "updated".to_string(),
            FileOutcome::Failed(reason) => format!("FAILED: {}", reason),
        };
        println!("  {:<60} {}", file.path, status);
    }
    println!("{}", describe_report(&report));

    let failed = report.failed().len();
    if failed > 0 {
        bail!("{} file(s) failed to upload", failed);
    }
    Ok(())
}

/// Validates and extracts a local ZIP into `dest` under the intake limits.
pub async fn run_unpack(config: &Config, archive: &Path, dest: &Path) -> Result<()> {
    let filename = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    ArchiveIntake::check_filename(&filename)?;

    let bytes = std::fs::read(archive)
        .with_context(|| format!("Failed to read {}", archive.display()))?;
    let sessions = Arc::new(SessionStore::new(&config.sessions));
    let intake = ArchiveIntake::new(config.intake.clone(), sessions)?;
    let (files, total) = intake.unpack_into(bytes, dest).await?;

    println!(
        "Extracted {} files ({}) to {}",
        files,
        format_bytes(total),
        dest.display()
    );
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
