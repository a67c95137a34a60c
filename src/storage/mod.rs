//! Stage 5: persists artifacts for a finished task and cleans up its
//! temporary state.
//!
//! Local output layout, per task:
//! `<local path>/<url-derived dirname>/<task uuid>/{resource_metadata.json,
//! resources/, task.log}`.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use url::Url;

use crate::result::FinalResult;
use crate::task::defaults::{RESOURCE_METADATA_FILE, RESOURCE_SUBDIR, TASK_LOG_FILE};

/// Characters that cannot appear in a directory name on either Unix or
/// Windows; each is replaced with `-`.
const DISALLOWED_DIR_CHARS: [char; 8] = ['/', '\\', '>', '<', ':', '|', '?', '*'];

/// How long to keep retrying removal of the user data directory. The
/// browser can briefly hold handles after it exits.
const UDD_REMOVE_ATTEMPTS: u32 = 30;
const UDD_REMOVE_BACKOFF: Duration = Duration::from_secs(1);

/// Derives a filesystem-safe directory name from a URL: host (with port)
/// plus the escaped path, with disallowed characters replaced by `-`.
pub fn dir_name_from_url(s: &str) -> Result<String> {
    let url = Url::parse(s).with_context(|| format!("failed to parse URL: {s}"))?;

    let mut name = String::new();
    name.push_str(url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        name.push(':');
        name.push_str(&port.to_string());
    }
    // A bare "/" path carries no information and would only leave a
    // trailing separator behind.
    if url.path() != "/" {
        name.push_str(url.path());
    }

    Ok(name.replace(&DISALLOWED_DIR_CHARS[..], "-"))
}

/// Persists the task's artifacts to every enabled sink. Storage errors are
/// task-level failures, not pipeline failures.
pub async fn store(fr: &mut FinalResult) -> Result<()> {
    fr.summary.timing.begin_storage = Some(Utc::now());

    if fr.task.task.output.local.enable {
        store_local(fr)?;
    }

    if fr.task.task.output.sftp.enable {
        tracing::warn!(
            host = %fr.task.task.output.sftp.host,
            "SFTP output is configured but not supported by this build; skipping"
        );
        fr.task.log.warn("SFTP output configured but not supported, skipping");
    }

    fr.summary.timing.end_storage = Some(Utc::now());
    Ok(())
}

fn store_local(fr: &mut FinalResult) -> Result<()> {
    let out_path = output_path(fr)?;

    if out_path.exists() {
        bail!("task local output directory exists: {}", out_path.display());
    }
    fs::create_dir_all(&out_path).context("failed to create local output directory")?;

    if fr.task.task.output.local.data.resource_metadata {
        let data = serde_json::to_vec(&fr.resources)
            .context("failed to marshal resource metadata for local storage")?;
        fs::write(out_path.join(RESOURCE_METADATA_FILE), data)
            .context("failed to write resource metadata file")?;
    }

    if fr.task.task.output.local.data.all_resources {
        let resource_dir = fr.task.task.user_data_dir.join(RESOURCE_SUBDIR);
        if resource_dir.exists() {
            fs::rename(&resource_dir, out_path.join(RESOURCE_SUBDIR))
                .context("failed to move resources directory into results directory")?;
        }
    }

    Ok(())
}

/// Removes the task's temporary state: the user data directory (with
/// retries), the per-task log (moved into the output directory when one
/// exists), and the temp directory. Runs whether or not storage succeeded.
pub async fn cleanup(fr: &mut FinalResult) {
    let udd = fr.task.task.user_data_dir.clone();
    let mut removed = false;
    for attempt in 0..UDD_REMOVE_ATTEMPTS {
        match fs::remove_dir_all(&udd) {
            Ok(()) => {
                removed = true;
                break;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                removed = true;
                break;
            }
            Err(e) => {
                tracing::debug!(attempt, error = %e, "user data directory removal failed, retrying");
                tokio::time::sleep(UDD_REMOVE_BACKOFF).await;
            }
        }
    }
    if !removed {
        tracing::warn!(path = %udd.display(), "giving up on user data directory removal");
    }

    // Move the per-task log alongside the stored results.
    fr.task.log.flush();
    if let Ok(out_path) = output_path(fr) {
        if out_path.exists() {
            if let Err(e) = fs::rename(fr.task.log.path(), out_path.join(TASK_LOG_FILE)) {
                tracing::warn!(error = %e, "failed to move task log into results directory");
            }
        } else if let Err(e) = fs::remove_file(fr.task.log.path()) {
            tracing::debug!(error = %e, "failed to remove task log");
        }
    }

    if fr.task.temp_dir.exists() {
        if let Err(e) = fs::remove_dir_all(&fr.task.temp_dir) {
            tracing::warn!(error = %e, "failed to remove task temp directory");
        }
    }
}

fn output_path(fr: &FinalResult) -> Result<PathBuf> {
    let dir_name = dir_name_from_url(&fr.task.task.url)
        .context("failed to extract directory name from URL")?;
    Ok(fr
        .task
        .task
        .output
        .local
        .path
        .join(dir_name)
        .join(fr.task.uuid.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postprocess;
    use crate::result::{CrawlerInfo, DevToolsRawData, RawResult, TaskSummary};
    use crate::task::sanitize::sanitize_task;
    use crate::task::{
        BrowserSettings, DataSettings, LocalOutputSettings, OutputSettings, RawTask,
    };

    #[test]
    fn dir_name_strips_scheme_and_replaces_separators() {
        assert_eq!(
            dir_name_from_url("https://example.com").unwrap(),
            "example.com"
        );
        assert_eq!(
            dir_name_from_url("https://example.com/a/b").unwrap(),
            "example.com-a-b"
        );
        assert_eq!(
            dir_name_from_url("https://127.0.0.1:1/").unwrap(),
            "127.0.0.1-1"
        );
    }

    #[test]
    fn dir_name_contains_no_disallowed_characters() {
        let urls = [
            "https://example.com/a/b?c=d",
            "https://example.com:8443/x",
            "https://example.com/p%3Cq%3E",
            "http://user@example.com/deep/path/",
        ];
        for url in urls {
            let name = dir_name_from_url(url).unwrap();
            assert!(
                !name.contains(&DISALLOWED_DIR_CHARS[..]),
                "{name:?} contains a disallowed character"
            );
        }
    }

    #[test]
    fn dir_name_rejects_invalid_urls() {
        assert!(dir_name_from_url("not a url").is_err());
    }

    fn final_result(root: &std::path::Path, out_root: &std::path::Path) -> FinalResult {
        let rt = RawTask {
            url: Some("https://example.com".into()),
            browser_settings: Some(BrowserSettings {
                browser_binary: Some("/bin/sh".into()),
                ..Default::default()
            }),
            data_settings: Some(DataSettings {
                all_resources: Some(false),
                resource_metadata: Some(true),
            }),
            output_settings: Some(OutputSettings {
                local_output_settings: Some(LocalOutputSettings {
                    enable: Some(true),
                    path: Some(out_root.to_str().unwrap().into()),
                    data_settings: None,
                }),
                sftp_output_settings: None,
            }),
            ..Default::default()
        };
        let task = sanitize_task(&rt, root).unwrap();

        postprocess::process(RawResult {
            crawler_info: CrawlerInfo::default(),
            task,
            summary: TaskSummary {
                success: true,
                ..Default::default()
            },
            devtools: DevToolsRawData::default(),
        })
    }

    #[tokio::test]
    async fn local_store_writes_metadata_and_cleanup_moves_log() {
        let temp_root = tempfile::tempdir().unwrap();
        let out_root = tempfile::tempdir().unwrap();
        let mut fr = final_result(temp_root.path(), out_root.path());

        store(&mut fr).await.unwrap();

        let out_path = out_root
            .path()
            .join("example.com")
            .join(fr.task.uuid.to_string());
        assert!(out_path.join(RESOURCE_METADATA_FILE).is_file());
        assert!(fr.summary.timing.begin_storage.is_some());
        assert!(fr.summary.timing.end_storage.is_some());

        cleanup(&mut fr).await;
        assert!(out_path.join(TASK_LOG_FILE).is_file());
        assert!(!fr.task.temp_dir.exists());
    }

    #[tokio::test]
    async fn existing_output_directory_fails_the_task() {
        let temp_root = tempfile::tempdir().unwrap();
        let out_root = tempfile::tempdir().unwrap();
        let mut fr = final_result(temp_root.path(), out_root.path());

        let out_path = out_root
            .path()
            .join("example.com")
            .join(fr.task.uuid.to_string());
        fs::create_dir_all(&out_path).unwrap();

        assert!(store(&mut fr).await.is_err());
    }
}
