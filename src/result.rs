//! Result types shared by the visit, post-process, and storage stages.

use std::collections::HashMap;

use chromiumoxide::cdp::browser_protocol::network::{
    EventRequestWillBeSent, EventResponseReceived,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::task::wrapper::TaskWrapper;

/// Wall-clock instants observed while processing a task. Each instant is
/// assigned at most once, at the moment it is observed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskTiming {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub begin_crawl: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_open: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_established: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_event: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dom_content_event: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_close: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub begin_postprocess: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_postprocess: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub begin_storage: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_storage: Option<DateTime<Utc>>,
}

/// Statistics gathered about a single task.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskSummary {
    /// True if the task recorded no failure
    pub success: bool,
    pub timing: TaskTiming,
    /// Number of distinct resources the browser requested
    pub num_resources: usize,
}

/// Information about the infrastructure used to perform a crawl.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlerInfo {
    pub host_name: String,
    pub version: String,
    pub browser: String,
    pub user_agent: String,
}

/// Raw network-level event streams captured during a visit, keyed by the
/// browser-assigned request id. Redirect chains share a request id, so a
/// single id can carry several RequestWillBeSent events; at most one final
/// ResponseReceived is kept per id.
#[derive(Debug, Clone, Default)]
pub struct DevToolsRawData {
    pub request_will_be_sent: HashMap<String, Vec<EventRequestWillBeSent>>,
    pub response_received: HashMap<String, EventResponseReceived>,
}

/// Everything stage 3 hands to post-processing: infrastructure info, the
/// task envelope, summary statistics, and the raw event streams.
#[derive(Debug)]
pub struct RawResult {
    pub crawler_info: CrawlerInfo,
    pub task: TaskWrapper,
    pub summary: TaskSummary,
    pub devtools: DevToolsRawData,
}

/// A single resource: the ordered requests sharing a request id paired with
/// the final response, if one was observed.
#[derive(Debug, Clone, Serialize)]
pub struct DtResource {
    pub requests: Vec<EventRequestWillBeSent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<EventResponseReceived>,
}

/// The post-processed form of a visit, ready for storage.
#[derive(Debug)]
pub struct FinalResult {
    pub task: TaskWrapper,
    pub summary: TaskSummary,
    pub resources: HashMap<String, DtResource>,
}
