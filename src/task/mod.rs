pub mod defaults;
pub mod sanitize;
pub mod wrapper;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Settings describing the way in which a browser will be opened.
///
/// Every field is optional so that "absent" stays distinguishable from an
/// explicit zero value once the task has round-tripped through JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrowserSettings {
    /// Binary for the browser (e.g. "/usr/bin/chromium-browser")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_binary: Option<String>,

    /// Path to the user data directory to use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_directory: Option<String>,

    /// Flags to be added to the default browser flags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_browser_flags: Option<Vec<String>>,

    /// Flags to be removed from the default browser flags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_browser_flags: Option<Vec<String>>,

    /// Flags which replace the default browser flags entirely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_browser_flags: Option<Vec<String>>,

    /// Paths to browser extension directories to load for the crawl
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<String>>,
}

/// Settings describing how a particular site visit will terminate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionSettings {
    /// One of "TimeoutOnly", "TimeAfterLoad", "LoadEvent"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_condition: Option<String>,

    /// Maximum number of seconds the browser will remain open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,

    /// Seconds to remain on the page after the load event fires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_after_load: Option<i64>,
}

/// Settings describing which data will be captured from the crawl.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_resources: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_metadata: Option<bool>,
}

/// Settings for output of results to the local filesystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalOutputSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_settings: Option<DataSettings>,
}

/// Settings for output of results via SSH/SFTP.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SftpOutputSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_settings: Option<DataSettings>,
}

/// Aggregation of the output sinks for a task or task set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_output_settings: Option<LocalOutputSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sftp_output_settings: Option<SftpOutputSettings>,
}

/// A raw task as authored by a user. This is the struct that is read from
/// and written to file when tasks are stored as JSON. Unknown fields are
/// ignored on input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTask {
    /// The URL to be visited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_settings: Option<BrowserSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_settings: Option<CompletionSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_settings: Option<DataSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_settings: Option<OutputSettings>,
}

/// A grouping of tasks for multiple URLs that may be repeated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressedTaskSet {
    /// List of URLs to be visited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_settings: Option<BrowserSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_settings: Option<CompletionSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_settings: Option<DataSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_settings: Option<OutputSettings>,

    /// Number of times each URL will be visited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<i64>,
}

/// Expands a CompressedTaskSet into a flat slice of RawTasks, iterating
/// repeat-outer and url-inner so a set of `{[a, b], repeat: 2}` yields
/// `a, b, a, b`.
pub fn expand_compressed_task_set(cts: &CompressedTaskSet) -> Vec<RawTask> {
    let urls = match &cts.url {
        Some(urls) => urls.as_slice(),
        None => return Vec::new(),
    };

    let repeats = cts.repeat.filter(|r| *r > 0).unwrap_or(1);

    let mut tasks = Vec::with_capacity(urls.len() * repeats as usize);
    for _ in 0..repeats {
        for url in urls {
            tasks.push(RawTask {
                url: Some(url.clone()),
                browser_settings: cts.browser_settings.clone(),
                completion_settings: cts.completion_settings.clone(),
                data_settings: cts.data_settings.clone(),
                output_settings: cts.output_settings.clone(),
            });
        }
    }
    tasks
}

/// Reads tasks from a byte slice, accepting any of the three supported
/// shapes: a single RawTask object, an array of RawTasks, or a
/// CompressedTaskSet (tried in that order).
pub fn read_tasks_from_bytes(data: &[u8]) -> Result<Vec<RawTask>> {
    // Every field of RawTask is optional, so an arbitrary JSON object would
    // "parse" as an empty task; require the URL to accept this shape.
    if let Ok(task) = serde_json::from_slice::<RawTask>(data) {
        if task.url.is_some() {
            return Ok(vec![task]);
        }
    }

    if let Ok(tasks) = serde_json::from_slice::<Vec<RawTask>>(data) {
        return Ok(tasks);
    }

    let cts: CompressedTaskSet = serde_json::from_slice(data)
        .context("failed to unmarshal tasks from any supported shape")?;
    if cts.url.as_ref().map_or(true, |u| u.is_empty()) {
        anyhow::bail!("no URLs given in task set");
    }

    Ok(expand_compressed_task_set(&cts))
}

/// Reads single tasks, full task lists, or compressed task sets from file.
pub fn read_tasks_from_file(path: impl AsRef<Path>) -> Result<Vec<RawTask>> {
    let path = path.as_ref();
    let data = fs::read(path)
        .with_context(|| format!("failed to read task file: {}", path.display()))?;
    read_tasks_from_bytes(&data)
}

/// Writes a CompressedTaskSet out as a JSON file.
pub fn write_compressed_task_set_to_file(
    cts: &CompressedTaskSet,
    path: impl AsRef<Path>,
) -> Result<()> {
    let path = path.as_ref();
    let data = serde_json::to_vec_pretty(cts).context("failed to serialize task set")?;
    fs::write(path, data)
        .with_context(|| format!("failed to write task file: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressed(urls: &[&str], repeat: i64) -> CompressedTaskSet {
        CompressedTaskSet {
            url: Some(urls.iter().map(|s| s.to_string()).collect()),
            repeat: Some(repeat),
            ..Default::default()
        }
    }

    #[test]
    fn expansion_preserves_repeat_outer_url_inner_order() {
        let cts = compressed(&["a.test", "b.test"], 2);
        let tasks = expand_compressed_task_set(&cts);

        let urls: Vec<_> = tasks.iter().map(|t| t.url.clone().unwrap()).collect();
        assert_eq!(urls, vec!["a.test", "b.test", "a.test", "b.test"]);
    }

    #[test]
    fn expansion_treats_missing_or_non_positive_repeat_as_one() {
        let mut cts = compressed(&["a.test"], 0);
        assert_eq!(expand_compressed_task_set(&cts).len(), 1);

        cts.repeat = None;
        assert_eq!(expand_compressed_task_set(&cts).len(), 1);
    }

    #[test]
    fn reads_single_task_object() {
        let tasks = read_tasks_from_bytes(br#"{"url": "https://example.com"}"#).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].url.as_deref(), Some("https://example.com"));
    }

    #[test]
    fn reads_task_array() {
        let tasks =
            read_tasks_from_bytes(br#"[{"url": "https://a.test"}, {"url": "https://b.test"}]"#)
                .unwrap();
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn reads_compressed_task_set() {
        let tasks = read_tasks_from_bytes(
            br#"{"url": ["https://a.test", "https://b.test"], "repeat": 3}"#,
        )
        .unwrap();
        assert_eq!(tasks.len(), 6);
    }

    #[test]
    fn rejects_task_set_without_urls() {
        assert!(read_tasks_from_bytes(br#"{"repeat": 2}"#).is_err());
        assert!(read_tasks_from_bytes(br#"{"url": [], "repeat": 2}"#).is_err());
    }

    #[test]
    fn ignores_unknown_fields() {
        let tasks =
            read_tasks_from_bytes(br#"{"url": "https://example.com", "bogus": 42}"#).unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn raw_task_round_trips_through_json() {
        let task = RawTask {
            url: Some("https://example.com".into()),
            browser_settings: Some(BrowserSettings {
                browser_binary: Some("/usr/bin/chromium-browser".into()),
                add_browser_flags: Some(vec!["--mute-audio".into()]),
                ..Default::default()
            }),
            completion_settings: Some(CompletionSettings {
                completion_condition: Some("LoadEvent".into()),
                timeout: Some(15),
                time_after_load: None,
            }),
            data_settings: Some(DataSettings {
                all_resources: Some(false),
                resource_metadata: Some(true),
            }),
            output_settings: None,
        };

        let bytes = serde_json::to_vec(&task).unwrap();
        let decoded: RawTask = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, task);
    }

    #[test]
    fn absent_fields_stay_absent_after_round_trip() {
        let task: RawTask = serde_json::from_str(r#"{"url": "https://example.com"}"#).unwrap();
        let encoded = serde_json::to_string(&task).unwrap();
        assert_eq!(encoded, r#"{"url":"https://example.com"}"#);
    }
}
