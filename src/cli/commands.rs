//! Thin async handlers behind each subcommand.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::info;
use url::Url;

use crate::amqp;
use crate::pipeline::{self, ingest::TaskSource};
use crate::task::sanitize::validate_url;
use crate::task::{
    defaults, read_tasks_from_file, write_compressed_task_set_to_file, BrowserSettings,
    CompletionSettings, CompressedTaskSet, DataSettings, LocalOutputSettings, OutputSettings,
    SftpOutputSettings,
};

use super::config::Config;
use super::BuildOpts;

/// `mida file`: run the pipeline over a JSON task file.
pub async fn run_file(config: &Config, task_file: PathBuf, shuffle: bool) -> Result<()> {
    pipeline::run(
        TaskSource::File {
            path: task_file,
            shuffle,
        },
        config,
    )
    .await
}

/// `mida go`: build a task set from CLI options and run it immediately.
pub async fn run_go(config: &Config, opts: &BuildOpts, shuffle: bool) -> Result<()> {
    let set = build_compressed_task_set(opts)?;
    pipeline::run(TaskSource::Builder { set, shuffle }, config).await
}

/// `mida build`: build a task set from CLI options and save it as JSON.
pub fn run_build(opts: &BuildOpts, outfile: &Path, overwrite: bool) -> Result<()> {
    if outfile.exists() && !overwrite {
        bail!(
            "task file '{}' already exists (use '-x' to overwrite)",
            outfile.display()
        );
    }

    let set = build_compressed_task_set(opts)?;
    write_compressed_task_set_to_file(&set, outfile)?;
    info!(path = %outfile.display(), "successfully wrote task file");
    Ok(())
}

/// `mida load`: publish a task file into the shared AMQP queue.
pub async fn run_load(
    config: &Config,
    task_file: PathBuf,
    queue: &str,
    priority: u8,
    shuffle: bool,
) -> Result<()> {
    if priority < 1 || priority > amqp::MAX_PRIORITY {
        bail!("task priority must be between 1 and {}", amqp::MAX_PRIORITY);
    }

    let tasks = read_tasks_from_file(&task_file)?;
    let loaded =
        amqp::load_tasks(tasks, &config.conn_params(), queue, priority, shuffle).await?;
    info!(loaded, queue, priority, "loaded tasks into queue");
    Ok(())
}

/// `mida client`: pull tasks from the shared AMQP queue until a `quit`
/// broadcast arrives.
pub async fn run_client(config: &Config) -> Result<()> {
    pipeline::run(
        TaskSource::Amqp {
            params: config.conn_params(),
            queue: config.amqp.task_queue.clone(),
        },
        config,
    )
    .await
}

/// Synthesizes a CompressedTaskSet from builder options. URLs come from the
/// given file, one per line, each validated the same way sanitization will
/// validate them later.
pub fn build_compressed_task_set(opts: &BuildOpts) -> Result<CompressedTaskSet> {
    let url_file = fs::read_to_string(&opts.url_file)
        .with_context(|| format!("failed to read URL file: {}", opts.url_file.display()))?;

    let mut urls = Vec::new();
    for line in url_file.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        urls.push(validate_url(line)?);
    }
    if urls.is_empty() {
        bail!("no URLs given in file: {}", opts.url_file.display());
    }

    let data = DataSettings {
        all_resources: Some(opts.all_resources),
        resource_metadata: Some(opts.resource_metadata),
    };

    Ok(CompressedTaskSet {
        url: Some(urls),
        browser_settings: Some(BrowserSettings {
            browser_binary: opts.browser.clone(),
            user_data_directory: opts.user_data_dir.clone(),
            add_browser_flags: non_empty(&opts.add_browser_flags),
            remove_browser_flags: non_empty(&opts.remove_browser_flags),
            set_browser_flags: non_empty(&opts.set_browser_flags),
            extensions: non_empty(&opts.extensions),
        }),
        completion_settings: Some(CompletionSettings {
            completion_condition: Some(opts.completion.clone()),
            timeout: Some(opts.timeout),
            time_after_load: Some(opts.time_after_load),
        }),
        data_settings: Some(data.clone()),
        output_settings: Some(output_settings(&opts.results_output_path, &data)?),
        repeat: Some(opts.repeat),
    })
}

fn non_empty(flags: &[String]) -> Option<Vec<String>> {
    (!flags.is_empty()).then(|| flags.to_vec())
}

/// Interprets the results output path: "none" disables all sinks, an
/// `ssh://` URL selects the SFTP sink, anything else is a local directory.
fn output_settings(results_output_path: &str, data: &DataSettings) -> Result<OutputSettings> {
    if results_output_path == "none" {
        return Ok(OutputSettings {
            local_output_settings: Some(LocalOutputSettings {
                enable: Some(false),
                ..Default::default()
            }),
            sftp_output_settings: Some(SftpOutputSettings {
                enable: Some(false),
                ..Default::default()
            }),
        });
    }

    if results_output_path.starts_with("ssh://") {
        let remote = Url::parse(results_output_path)
            .with_context(|| format!("invalid remote output path: {results_output_path}"))?;
        let host = remote
            .host_str()
            .context("remote output path is missing a host")?
            .to_string();
        let user = remote.username();

        return Ok(OutputSettings {
            local_output_settings: None,
            sftp_output_settings: Some(SftpOutputSettings {
                enable: Some(true),
                host: Some(host),
                port: Some(remote.port().unwrap_or(defaults::DEFAULT_SFTP_PORT) as i64),
                path: Some(remote.path().to_string()),
                user_name: (!user.is_empty()).then(|| user.to_string()),
                private_key_file: None,
                data_settings: Some(data.clone()),
            }),
        });
    }

    Ok(OutputSettings {
        local_output_settings: Some(LocalOutputSettings {
            enable: Some(true),
            path: Some(results_output_path.to_string()),
            data_settings: Some(data.clone()),
        }),
        sftp_output_settings: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::expand_compressed_task_set;

    fn opts_with_urls(dir: &tempfile::TempDir, urls: &str) -> BuildOpts {
        let url_file = dir.path().join("urls.txt");
        fs::write(&url_file, urls).unwrap();
        BuildOpts {
            url_file,
            browser: None,
            user_data_dir: None,
            add_browser_flags: vec![],
            remove_browser_flags: vec![],
            set_browser_flags: vec![],
            extensions: vec![],
            completion: "TimeoutOnly".into(),
            timeout: defaults::DEFAULT_TIMEOUT_SECS,
            time_after_load: defaults::DEFAULT_TIME_AFTER_LOAD_SECS,
            all_resources: true,
            resource_metadata: true,
            results_output_path: defaults::DEFAULT_LOCAL_OUTPUT_PATH.into(),
            repeat: 2,
        }
    }

    #[test]
    fn builder_validates_and_expands_urls() {
        let dir = tempfile::tempdir().unwrap();
        let opts = opts_with_urls(&dir, "example.com\nhttps://b.test\n\n");

        let set = build_compressed_task_set(&opts).unwrap();
        assert_eq!(
            set.url.as_ref().unwrap(),
            &vec!["https://example.com".to_string(), "https://b.test".to_string()]
        );
        assert_eq!(expand_compressed_task_set(&set).len(), 4);
    }

    #[test]
    fn builder_rejects_empty_url_file() {
        let dir = tempfile::tempdir().unwrap();
        let opts = opts_with_urls(&dir, "\n\n");
        assert!(build_compressed_task_set(&opts).is_err());
    }

    #[test]
    fn ssh_output_path_selects_the_sftp_sink() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = opts_with_urls(&dir, "example.com");
        opts.results_output_path = "ssh://crawler@collector.test:2222/data/results".into();

        let set = build_compressed_task_set(&opts).unwrap();
        let sftp = set
            .output_settings
            .unwrap()
            .sftp_output_settings
            .unwrap();
        assert_eq!(sftp.enable, Some(true));
        assert_eq!(sftp.host.as_deref(), Some("collector.test"));
        assert_eq!(sftp.port, Some(2222));
        assert_eq!(sftp.user_name.as_deref(), Some("crawler"));
        assert_eq!(sftp.path.as_deref(), Some("/data/results"));
    }

    #[test]
    fn none_output_path_disables_all_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = opts_with_urls(&dir, "example.com");
        opts.results_output_path = "none".into();

        let set = build_compressed_task_set(&opts).unwrap();
        let out = set.output_settings.unwrap();
        assert_eq!(out.local_output_settings.unwrap().enable, Some(false));
        assert_eq!(out.sftp_output_settings.unwrap().enable, Some(false));
    }

    #[test]
    fn build_refuses_to_overwrite_without_flag() {
        let dir = tempfile::tempdir().unwrap();
        let opts = opts_with_urls(&dir, "example.com");
        let outfile = dir.path().join("tasks.json");

        run_build(&opts, &outfile, false).unwrap();
        assert!(run_build(&opts, &outfile, false).is_err());
        run_build(&opts, &outfile, true).unwrap();

        let written = read_tasks_from_file(&outfile).unwrap();
        assert_eq!(written.len(), 2);
    }
}
