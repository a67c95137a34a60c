//! Stage 2: validation and defaulting of raw tasks.
//!
//! Every task that enters the visit pipeline passes through [`sanitize_task`],
//! which either produces a fully resolved [`TaskWrapper`] or rejects the task
//! with a typed error. Nothing downstream ever re-reads the raw task.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::task::defaults;
use crate::task::wrapper::{
    CompletionCondition, CompletionPolicy, DataPolicy, LocalSink, OutputPolicy, SanitizedTask,
    SftpSink, TaskLog, TaskWrapper,
};
use crate::task::{
    CompletionSettings, DataSettings, LocalOutputSettings, OutputSettings, RawTask,
    SftpOutputSettings,
};

#[derive(Debug, Error)]
pub enum SanitizeError {
    #[error("missing or empty URL for task")]
    MissingUrl,

    #[error("bad url: {0}")]
    BadUrl(String),

    #[error("no browser binary provided and could not find a default")]
    NoDefaultBrowser,

    #[error("could not find browser: {0}")]
    BrowserNotFound(String),

    #[error("given extension [ {0} ] does not exist")]
    ExtensionMissing(String),

    #[error("given extension [ {0} ] is not a directory")]
    ExtensionNotDirectory(String),

    #[error("invalid completion condition: {0}")]
    InvalidCompletionCondition(String),

    #[error("timeout value must be positive")]
    NonPositiveTimeout,

    #[error("time_after_load value must be non-negative")]
    NegativeTimeAfterLoad,

    #[error("invalid SFTP port: {0}")]
    InvalidSftpPort(i64),

    #[error("required field for SFTP output not specified")]
    SftpMissingField,

    #[error("failed to determine current user")]
    UnknownCurrentUser,

    #[error("failed to create task workspace: {0}")]
    Workspace(#[from] std::io::Error),
}

/// Validates a raw task, fills in defaults, and wraps the result together
/// with a fresh UUID, a per-task temp directory, and a per-task log sink.
pub fn sanitize_task(rt: &RawTask, temp_root: &Path) -> Result<TaskWrapper, SanitizeError> {
    let url = match rt.url.as_deref() {
        Some(u) if !u.is_empty() => validate_url(u)?,
        _ => return Err(SanitizeError::MissingUrl),
    };

    let uuid = Uuid::new_v4();

    let browser_binary = browser_binary_path(rt)?;
    let browser_flags = browser_flags(rt)?;
    let user_data_dir = user_data_directory(rt, &uuid, temp_root);
    let completion = completion_policy(rt.completion_settings.as_ref())?;
    let data = data_policy(rt.data_settings.as_ref(), None);
    let output = output_policy(rt.output_settings.as_ref(), &data)?;

    let uuid_string = uuid.to_string();
    let short_id = &uuid_string[..8];
    let temp_dir = temp_root.join(short_id);
    fs::create_dir_all(&temp_dir)?;
    // The log lives beside the task's temp directory, not inside it, so
    // that user-data-dir removal cannot take the log with it.
    let log = TaskLog::create(temp_root.join(format!("{short_id}.log")))?;

    let task = SanitizedTask {
        url,
        browser_binary,
        browser_flags,
        user_data_dir,
        completion,
        data,
        output,
    };

    Ok(TaskWrapper::new(uuid, task, temp_dir, log))
}

/// Best-effort URL validation. A URL without a scheme is retried with
/// `https://` prepended; the returned string is what the browser navigates
/// to and what storage later derives the output directory name from.
pub fn validate_url(s: &str) -> Result<String, SanitizeError> {
    if Url::parse(s).is_ok() {
        return Ok(s.to_string());
    }

    if !s.contains("://") {
        let prefixed = format!("{}{}", defaults::DEFAULT_PROTOCOL_PREFIX, s);
        if Url::parse(&prefixed).is_ok() {
            return Ok(prefixed);
        }
    }

    Err(SanitizeError::BadUrl(s.to_string()))
}

fn chromium_default() -> Option<PathBuf> {
    let p = Path::new(defaults::DEFAULT_CHROMIUM_PATH);
    p.exists().then(|| p.to_path_buf())
}

fn chrome_default() -> Option<PathBuf> {
    let p = Path::new(defaults::DEFAULT_CHROME_PATH);
    p.exists().then(|| p.to_path_buf())
}

/// Resolves the full path to the browser binary for this task. An explicit
/// path is honored if it exists on disk; the literal names "chrome",
/// "chromium", and "chromium-browser" select the platform default for that
/// browser; no setting at all prefers Chromium over Chrome.
fn browser_binary_path(rt: &RawTask) -> Result<PathBuf, SanitizeError> {
    let requested = rt
        .browser_settings
        .as_ref()
        .and_then(|bs| bs.browser_binary.as_deref())
        .filter(|s| !s.is_empty());

    let Some(requested) = requested else {
        return chromium_default()
            .or_else(chrome_default)
            .ok_or(SanitizeError::NoDefaultBrowser);
    };

    if Path::new(requested).exists() {
        return Ok(PathBuf::from(requested));
    }

    match requested.to_lowercase().as_str() {
        "chrome" => chrome_default().ok_or_else(|| SanitizeError::BrowserNotFound("chrome".into())),
        "chromium" | "chromium-browser" => {
            chromium_default().ok_or_else(|| SanitizeError::BrowserNotFound("chromium".into()))
        }
        other => Err(SanitizeError::BrowserNotFound(other.to_string())),
    }
}

/// Computes the final flag list for the browser launch. `set_browser_flags`
/// replaces the defaults verbatim; otherwise the defaults are unioned with
/// `add_browser_flags` and anything in `remove_browser_flags` is excluded.
/// Extensions append a single `--disable-extensions-except` flag and force
/// the removal of `--incognito` and `--disable-extensions`, both of which
/// defeat extensions.
fn browser_flags(rt: &RawTask) -> Result<Vec<String>, SanitizeError> {
    let defaults: Vec<String> = defaults::DEFAULT_BROWSER_FLAGS
        .iter()
        .map(|f| f.to_string())
        .collect();

    let Some(bs) = rt.browser_settings.as_ref() else {
        return Ok(defaults);
    };

    let mut add = bs.add_browser_flags.clone().unwrap_or_default();
    let mut remove = bs.remove_browser_flags.clone().unwrap_or_default();

    if let Some(extensions) = bs.extensions.as_ref().filter(|e| !e.is_empty()) {
        for ext in extensions {
            let meta = fs::metadata(ext)
                .map_err(|_| SanitizeError::ExtensionMissing(ext.clone()))?;
            if !meta.is_dir() {
                return Err(SanitizeError::ExtensionNotDirectory(ext.clone()));
            }
        }

        add.push(format!("--disable-extensions-except={}", extensions.join(",")));
        remove.push("--incognito".to_string());
        remove.push("--disable-extensions".to_string());
    }

    if let Some(set) = bs.set_browser_flags.as_ref().filter(|s| !s.is_empty()) {
        return Ok(set.clone());
    }

    let flags = defaults
        .into_iter()
        .chain(add)
        .filter(|flag| !remove.contains(flag))
        .collect();

    Ok(flags)
}

/// The task's user data directory, or `<temp root>/<first 8 uuid chars>` by
/// default.
fn user_data_directory(rt: &RawTask, uuid: &Uuid, temp_root: &Path) -> PathBuf {
    rt.browser_settings
        .as_ref()
        .and_then(|bs| bs.user_data_directory.as_deref())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| temp_root.join(&uuid.to_string()[..8]))
}

fn completion_policy(
    cs: Option<&CompletionSettings>,
) -> Result<CompletionPolicy, SanitizeError> {
    let condition = match cs.and_then(|c| c.completion_condition.as_deref()) {
        None => CompletionCondition::TimeoutOnly,
        Some(s) => s
            .parse::<CompletionCondition>()
            .map_err(SanitizeError::InvalidCompletionCondition)?,
    };

    let timeout = match cs.and_then(|c| c.timeout) {
        None => defaults::DEFAULT_TIMEOUT_SECS,
        Some(t) if t > 0 => t,
        Some(_) => return Err(SanitizeError::NonPositiveTimeout),
    };

    let time_after_load = match cs.and_then(|c| c.time_after_load) {
        None => defaults::DEFAULT_TIME_AFTER_LOAD_SECS,
        Some(t) if t >= 0 => t,
        Some(_) => return Err(SanitizeError::NegativeTimeAfterLoad),
    };

    Ok(CompletionPolicy {
        condition,
        timeout: Duration::from_secs(timeout as u64),
        time_after_load: Duration::from_secs(time_after_load as u64),
    })
}

/// Resolves data settings: defaults, then the parent sink's settings, then
/// the task's explicit settings, later layers winning.
fn data_policy(ds: Option<&DataSettings>, parent: Option<&DataPolicy>) -> DataPolicy {
    let mut all_resources = defaults::DEFAULT_ALL_RESOURCES;
    let mut resource_metadata = defaults::DEFAULT_RESOURCE_METADATA;

    if let Some(parent) = parent {
        all_resources = parent.all_resources;
        resource_metadata = parent.resource_metadata;
    }
    if let Some(ds) = ds {
        if let Some(v) = ds.all_resources {
            all_resources = v;
        }
        if let Some(v) = ds.resource_metadata {
            resource_metadata = v;
        }
    }

    DataPolicy {
        all_resources,
        resource_metadata,
    }
}

fn output_policy(
    ops: Option<&OutputSettings>,
    ds: &DataPolicy,
) -> Result<OutputPolicy, SanitizeError> {
    // No output settings at all defaults to local filesystem output only.
    let Some(ops) = ops else {
        return Ok(OutputPolicy {
            local: LocalSink {
                enable: true,
                path: PathBuf::from(defaults::DEFAULT_LOCAL_OUTPUT_PATH),
                data: *ds,
            },
            sftp: disabled_sftp_sink(ds),
        });
    };

    Ok(OutputPolicy {
        local: local_sink(ops.local_output_settings.as_ref(), ds)?,
        sftp: sftp_sink(ops.sftp_output_settings.as_ref(), ds)?,
    })
}

fn local_sink(
    los: Option<&LocalOutputSettings>,
    ds: &DataPolicy,
) -> Result<LocalSink, SanitizeError> {
    let Some(los) = los else {
        return Ok(LocalSink {
            enable: false,
            path: PathBuf::from(defaults::DEFAULT_LOCAL_OUTPUT_PATH),
            data: *ds,
        });
    };

    let path = match los.path.as_deref() {
        Some(p) => expand_path(p),
        None => PathBuf::from(defaults::DEFAULT_LOCAL_OUTPUT_PATH),
    };

    Ok(LocalSink {
        enable: los.enable.unwrap_or(false),
        path,
        data: data_policy(los.data_settings.as_ref(), Some(ds)),
    })
}

fn disabled_sftp_sink(ds: &DataPolicy) -> SftpSink {
    SftpSink {
        enable: false,
        host: String::new(),
        port: defaults::DEFAULT_SFTP_PORT,
        user: String::new(),
        private_key: PathBuf::new(),
        path: String::new(),
        data: *ds,
    }
}

fn sftp_sink(
    sos: Option<&SftpOutputSettings>,
    ds: &DataPolicy,
) -> Result<SftpSink, SanitizeError> {
    let Some(sos) = sos.filter(|s| s.enable == Some(true)) else {
        return Ok(disabled_sftp_sink(ds));
    };

    let (Some(host), Some(path)) = (sos.host.clone(), sos.path.clone()) else {
        return Err(SanitizeError::SftpMissingField);
    };

    let port = match sos.port {
        None => defaults::DEFAULT_SFTP_PORT,
        Some(p) if (1..=65535).contains(&p) => p as u16,
        Some(p) => return Err(SanitizeError::InvalidSftpPort(p)),
    };

    let user = match sos.user_name.clone() {
        Some(u) => u,
        None => current_user().ok_or(SanitizeError::UnknownCurrentUser)?,
    };

    let private_key = match sos.private_key_file.as_deref() {
        Some(p) => expand_path(p),
        None => expand_path(defaults::DEFAULT_SFTP_PRIVATE_KEY),
    };

    Ok(SftpSink {
        enable: true,
        host,
        port,
        user,
        private_key,
        path,
        data: data_policy(sos.data_settings.as_ref(), Some(ds)),
    })
}

fn current_user() -> Option<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .ok()
        .filter(|u| !u.is_empty())
}

/// Expands a leading `~/` to the user's home directory.
pub fn expand_path(p: &str) -> PathBuf {
    if let Some(rest) = p.strip_prefix("~/") {
        if let Some(dirs) = directories::UserDirs::new() {
            return dirs.home_dir().join(rest);
        }
    }
    PathBuf::from(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::BrowserSettings;

    fn raw_task(url: &str) -> RawTask {
        RawTask {
            url: Some(url.to_string()),
            ..Default::default()
        }
    }

    /// A task pointing at an always-existing "browser binary" so sanitize
    /// does not depend on an installed Chromium.
    fn runnable_task(url: &str) -> RawTask {
        let mut rt = raw_task(url);
        rt.browser_settings = Some(BrowserSettings {
            browser_binary: Some("/bin/sh".into()),
            ..Default::default()
        });
        rt
    }

    #[test]
    fn url_without_scheme_gets_https_prefix() {
        assert_eq!(validate_url("example.com").unwrap(), "https://example.com");
        assert_eq!(
            validate_url("https://example.com").unwrap(),
            "https://example.com"
        );
    }

    #[test]
    fn rejects_unparseable_url() {
        assert!(validate_url("http://[broken").is_err());
    }

    #[test]
    fn rejects_missing_or_empty_url() {
        let root = tempfile::tempdir().unwrap();
        let rt = RawTask::default();
        assert!(matches!(
            sanitize_task(&rt, root.path()),
            Err(SanitizeError::MissingUrl)
        ));

        let rt = raw_task("");
        assert!(matches!(
            sanitize_task(&rt, root.path()),
            Err(SanitizeError::MissingUrl)
        ));
    }

    #[test]
    fn explicit_existing_binary_path_is_used_verbatim() {
        let root = tempfile::tempdir().unwrap();
        let tw = sanitize_task(&runnable_task("example.com"), root.path()).unwrap();
        assert_eq!(tw.task.browser_binary, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn unknown_browser_name_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let mut rt = raw_task("example.com");
        rt.browser_settings = Some(BrowserSettings {
            browser_binary: Some("/definitely/not/a/browser".into()),
            ..Default::default()
        });
        assert!(matches!(
            sanitize_task(&rt, root.path()),
            Err(SanitizeError::BrowserNotFound(_))
        ));
    }

    #[test]
    fn no_browser_settings_yields_default_flags() {
        let flags = browser_flags(&raw_task("example.com")).unwrap();
        assert_eq!(flags.len(), defaults::DEFAULT_BROWSER_FLAGS.len());
        assert!(flags.iter().any(|f| f == "--incognito"));
    }

    #[test]
    fn set_browser_flags_wins_over_add() {
        let mut rt = raw_task("example.com");
        rt.browser_settings = Some(BrowserSettings {
            set_browser_flags: Some(vec!["--foo".into()]),
            add_browser_flags: Some(vec!["--bar".into()]),
            ..Default::default()
        });
        assert_eq!(browser_flags(&rt).unwrap(), vec!["--foo".to_string()]);
    }

    #[test]
    fn add_then_remove_is_applied_to_defaults() {
        let mut rt = raw_task("example.com");
        rt.browser_settings = Some(BrowserSettings {
            add_browser_flags: Some(vec!["--mute-audio".into()]),
            remove_browser_flags: Some(vec!["--no-sandbox".into()]),
            ..Default::default()
        });
        let flags = browser_flags(&rt).unwrap();
        assert!(flags.iter().any(|f| f == "--mute-audio"));
        assert!(!flags.iter().any(|f| f == "--no-sandbox"));
    }

    #[test]
    fn extensions_override_incognito_and_disable_extensions() {
        let ext_dir = tempfile::tempdir().unwrap();
        let ext = ext_dir.path().to_str().unwrap().to_string();

        let mut rt = raw_task("example.com");
        rt.browser_settings = Some(BrowserSettings {
            extensions: Some(vec![ext.clone()]),
            ..Default::default()
        });

        let flags = browser_flags(&rt).unwrap();
        assert!(flags
            .iter()
            .any(|f| f == &format!("--disable-extensions-except={ext}")));
        assert!(!flags.iter().any(|f| f == "--incognito"));
        assert!(!flags.iter().any(|f| f == "--disable-extensions"));
    }

    #[test]
    fn extension_path_must_be_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("not-a-dir");
        std::fs::write(&file_path, b"x").unwrap();

        let mut rt = raw_task("example.com");
        rt.browser_settings = Some(BrowserSettings {
            extensions: Some(vec![file_path.to_str().unwrap().into()]),
            ..Default::default()
        });
        assert!(matches!(
            browser_flags(&rt),
            Err(SanitizeError::ExtensionNotDirectory(_))
        ));
    }

    #[test]
    fn flag_resolution_is_idempotent() {
        let mut rt = raw_task("example.com");
        rt.browser_settings = Some(BrowserSettings {
            add_browser_flags: Some(vec!["--mute-audio".into()]),
            remove_browser_flags: Some(vec!["--incognito".into()]),
            ..Default::default()
        });

        let first = browser_flags(&rt).unwrap();

        // Feed the resolved list back in as a verbatim set, round-tripped
        // through JSON, and expect the same list out.
        let mut second_rt = raw_task("example.com");
        second_rt.browser_settings = Some(BrowserSettings {
            set_browser_flags: Some(first.clone()),
            ..Default::default()
        });
        let bytes = serde_json::to_vec(&second_rt).unwrap();
        let decoded: RawTask = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(browser_flags(&decoded).unwrap(), first);
    }

    #[test]
    fn completion_defaults() {
        let policy = completion_policy(None).unwrap();
        assert_eq!(policy.condition, CompletionCondition::TimeoutOnly);
        assert_eq!(policy.timeout, Duration::from_secs(10));
        assert_eq!(policy.time_after_load, Duration::from_secs(5));
    }

    #[test]
    fn rejects_invalid_completion_condition() {
        let cs = CompletionSettings {
            completion_condition: Some("Never".into()),
            ..Default::default()
        };
        assert!(matches!(
            completion_policy(Some(&cs)),
            Err(SanitizeError::InvalidCompletionCondition(_))
        ));
    }

    #[test]
    fn rejects_non_positive_timeout_and_negative_time_after_load() {
        let cs = CompletionSettings {
            timeout: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            completion_policy(Some(&cs)),
            Err(SanitizeError::NonPositiveTimeout)
        ));

        let cs = CompletionSettings {
            time_after_load: Some(-1),
            ..Default::default()
        };
        assert!(matches!(
            completion_policy(Some(&cs)),
            Err(SanitizeError::NegativeTimeAfterLoad)
        ));

        let cs = CompletionSettings {
            timeout: Some(1),
            time_after_load: Some(0),
            ..Default::default()
        };
        assert!(completion_policy(Some(&cs)).is_ok());
    }

    #[test]
    fn data_settings_default_to_true_and_layer() {
        let base = data_policy(None, None);
        assert!(base.all_resources);
        assert!(base.resource_metadata);

        let parent = DataPolicy {
            all_resources: false,
            resource_metadata: true,
        };
        let ds = DataSettings {
            resource_metadata: Some(false),
            all_resources: None,
        };
        let resolved = data_policy(Some(&ds), Some(&parent));
        assert!(!resolved.all_resources);
        assert!(!resolved.resource_metadata);
    }

    #[test]
    fn missing_output_settings_default_to_local_results_dir() {
        let ds = data_policy(None, None);
        let out = output_policy(None, &ds).unwrap();
        assert!(out.local.enable);
        assert_eq!(out.local.path, PathBuf::from("results"));
        assert!(!out.sftp.enable);
    }

    #[test]
    fn enabled_sftp_requires_host_and_path() {
        let ds = data_policy(None, None);
        let sos = SftpOutputSettings {
            enable: Some(true),
            host: Some("collector.test".into()),
            ..Default::default()
        };
        assert!(matches!(
            sftp_sink(Some(&sos), &ds),
            Err(SanitizeError::SftpMissingField)
        ));

        let sos = SftpOutputSettings {
            enable: Some(true),
            host: Some("collector.test".into()),
            path: Some("/data".into()),
            user_name: Some("crawler".into()),
            ..Default::default()
        };
        let sink = sftp_sink(Some(&sos), &ds).unwrap();
        assert!(sink.enable);
        assert_eq!(sink.port, 22);
        assert_eq!(sink.user, "crawler");
        assert!(sink.private_key.ends_with(".ssh/id_rsa"));
    }

    #[test]
    fn sanitized_task_carries_temp_dir_and_log() {
        let root = tempfile::tempdir().unwrap();
        let tw = sanitize_task(&runnable_task("example.com"), root.path()).unwrap();

        assert!(tw.temp_dir.starts_with(root.path()));
        assert!(tw.temp_dir.is_dir());
        assert!(tw.log.path().starts_with(root.path()));
        assert_eq!(tw.task.url, "https://example.com");
        assert_eq!(tw.task.user_data_dir, root.path().join(tw.short_id()));
    }
}
