//! Stage 4: folds the raw DevTools event streams into the per-resource
//! model storage writes out.

use std::collections::HashMap;

use chrono::Utc;

use crate::result::{DtResource, FinalResult, RawResult};

/// Converts a raw result into a final result. The resource map is keyed by
/// request id; every id present in the request map appears exactly once,
/// paired with its response if one was observed. Responses whose id never
/// appeared in a request are dropped.
pub fn process(raw: RawResult) -> FinalResult {
    let RawResult {
        task,
        mut summary,
        mut devtools,
        ..
    } = raw;

    summary.timing.begin_postprocess = Some(Utc::now());
    summary.num_resources = devtools.request_will_be_sent.len();

    let mut resources = HashMap::with_capacity(devtools.request_will_be_sent.len());
    for (request_id, requests) in devtools.request_will_be_sent.drain() {
        let response = devtools.response_received.remove(&request_id);
        resources.insert(request_id, DtResource { requests, response });
    }

    let orphans = devtools.response_received.len();
    if orphans > 0 {
        tracing::debug!(orphans, "dropped responses without a matching request");
    }

    summary.timing.end_postprocess = Some(Utc::now());

    FinalResult {
        task,
        summary,
        resources,
    }
}
