use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

/// Condition under which a site visit completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCondition {
    /// Complete only when the timeout is reached
    TimeoutOnly,
    /// Wait a given number of seconds after the load event
    TimeAfterLoad,
    /// Terminate the visit immediately when the load event fires
    LoadEvent,
}

impl FromStr for CompletionCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TimeoutOnly" => Ok(CompletionCondition::TimeoutOnly),
            "TimeAfterLoad" => Ok(CompletionCondition::TimeAfterLoad),
            "LoadEvent" => Ok(CompletionCondition::LoadEvent),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for CompletionCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompletionCondition::TimeoutOnly => "TimeoutOnly",
            CompletionCondition::TimeAfterLoad => "TimeAfterLoad",
            CompletionCondition::LoadEvent => "LoadEvent",
        };
        f.write_str(s)
    }
}

/// Fully resolved completion settings for a sanitized task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionPolicy {
    pub condition: CompletionCondition,
    pub timeout: Duration,
    pub time_after_load: Duration,
}

/// Fully resolved data-gathering settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPolicy {
    pub all_resources: bool,
    pub resource_metadata: bool,
}

/// Resolved local filesystem sink.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalSink {
    pub enable: bool,
    pub path: PathBuf,
    pub data: DataPolicy,
}

/// Resolved SSH/SFTP sink.
#[derive(Debug, Clone, PartialEq)]
pub struct SftpSink {
    pub enable: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub private_key: PathBuf,
    pub path: String,
    pub data: DataPolicy,
}

/// Resolved output sinks for a sanitized task.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputPolicy {
    pub local: LocalSink,
    pub sftp: SftpSink,
}

/// The defaulted, validated form of a task produced by the sanitize stage.
/// Contains everything a site visit needs without re-reading the raw task:
/// the URL is guaranteed parseable and scheme-prefixed, the browser binary
/// exists on disk at admission time, and all settings carry concrete values.
#[derive(Debug, Clone, PartialEq)]
pub struct SanitizedTask {
    pub url: String,
    pub browser_binary: PathBuf,
    pub browser_flags: Vec<String>,
    pub user_data_dir: PathBuf,
    pub completion: CompletionPolicy,
    pub data: DataPolicy,
    pub output: OutputPolicy,
}

/// Line-oriented per-task log file. The global tracing subscriber covers
/// the process; each task additionally gets its own sink which travels
/// with the results into the output directory.
#[derive(Debug)]
pub struct TaskLog {
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
}

impl TaskLog {
    pub fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&self, level: &str, msg: &str) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{} [{}] {}", Utc::now().to_rfc3339(), level, msg);
        }
    }

    pub fn debug(&self, msg: impl AsRef<str>) {
        self.write_line("DEBUG", msg.as_ref());
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        self.write_line("INFO", msg.as_ref());
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        self.write_line("WARN", msg.as_ref());
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        self.write_line("ERROR", msg.as_ref());
    }

    /// Flushes buffered lines out to disk. Called before the file is moved
    /// into the task output directory.
    pub fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

/// Internal envelope around a SanitizedTask. Exactly one wrapper exists per
/// admitted task; it is owned successively by the visit, post-process, and
/// storage stages and destroyed after storage cleanup.
#[derive(Debug)]
pub struct TaskWrapper {
    pub uuid: Uuid,
    pub task: SanitizedTask,
    /// Per-task scratch directory, `<temp root>/<first 8 uuid chars>`
    pub temp_dir: PathBuf,
    pub log: TaskLog,
    failure_code: Option<String>,
}

impl TaskWrapper {
    pub fn new(uuid: Uuid, task: SanitizedTask, temp_dir: PathBuf, log: TaskLog) -> Self {
        Self {
            uuid,
            task,
            temp_dir,
            log,
            failure_code: None,
        }
    }

    /// Records a failure code for the task. The first recorded failure wins;
    /// later calls only leave a trace in the task log.
    pub fn record_failure(&mut self, code: impl Into<String>) {
        let code = code.into();
        self.log.error(&code);
        if self.failure_code.is_none() {
            self.failure_code = Some(code);
        }
    }

    pub fn failure_code(&self) -> Option<&str> {
        self.failure_code.as_deref()
    }

    pub fn has_failed(&self) -> bool {
        self.failure_code.is_some()
    }

    /// First 8 characters of the task UUID, used for temp directory names.
    pub fn short_id(&self) -> String {
        self.uuid.to_string()[..8].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> SanitizedTask {
        SanitizedTask {
            url: "https://example.com".into(),
            browser_binary: PathBuf::from("/usr/bin/chromium-browser"),
            browser_flags: vec!["--no-first-run".into()],
            user_data_dir: PathBuf::from("/tmp/mida-test"),
            completion: CompletionPolicy {
                condition: CompletionCondition::TimeoutOnly,
                timeout: Duration::from_secs(10),
                time_after_load: Duration::from_secs(5),
            },
            data: DataPolicy {
                all_resources: true,
                resource_metadata: true,
            },
            output: OutputPolicy {
                local: LocalSink {
                    enable: true,
                    path: PathBuf::from("results"),
                    data: DataPolicy {
                        all_resources: true,
                        resource_metadata: true,
                    },
                },
                sftp: SftpSink {
                    enable: false,
                    host: String::new(),
                    port: 22,
                    user: String::new(),
                    private_key: PathBuf::new(),
                    path: String::new(),
                    data: DataPolicy {
                        all_resources: true,
                        resource_metadata: true,
                    },
                },
            },
        }
    }

    #[test]
    fn completion_condition_parses_known_names_only() {
        assert_eq!(
            "TimeoutOnly".parse::<CompletionCondition>().unwrap(),
            CompletionCondition::TimeoutOnly
        );
        assert_eq!(
            "LoadEvent".parse::<CompletionCondition>().unwrap(),
            CompletionCondition::LoadEvent
        );
        assert!("Never".parse::<CompletionCondition>().is_err());
        assert!("timeoutonly".parse::<CompletionCondition>().is_err());
    }

    #[test]
    fn first_recorded_failure_wins() {
        let dir = tempfile::tempdir().unwrap();
        let log = TaskLog::create(dir.path().join("task.log")).unwrap();
        let mut tw = TaskWrapper::new(Uuid::new_v4(), sample_task(), dir.path().into(), log);

        assert!(!tw.has_failed());
        tw.record_failure("timeout on connection to webserver");
        tw.record_failure("browser closed during connection to site");
        assert_eq!(
            tw.failure_code(),
            Some("timeout on connection to webserver")
        );
    }

    #[test]
    fn task_log_writes_lines_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task.log");
        let log = TaskLog::create(&path).unwrap();
        log.info("initiated site visit log");
        log.flush();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[INFO] initiated site visit log"));
    }
}
