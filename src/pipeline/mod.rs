//! The five-stage visit pipeline: ingest, sanitize, visit, post-process,
//! store. Stages are connected by bounded channels; a slow downstream stage
//! stalls its producer instead of buffering unboundedly.
//!
//! Shutdown is cyclic: stage 2 cannot close its output until stage 5
//! drains, but stage 5 is fed (through 3 and 4) by stage 2. The
//! [`InflightCounter`] breaks the cycle: stage 2 stops sanitizing when
//! ingest closes, waits for the counter to drain, and only then closes the
//! sanitized stream, which lets the visit workers (and with them the rest
//! of the pipeline) wind down.

pub mod inflight;
pub mod ingest;

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::browser;
use crate::cli::config::Config;
use crate::monitor;
use crate::postprocess;
use crate::result::{FinalResult, RawResult};
use crate::storage;
use crate::task::sanitize::sanitize_task;
use crate::task::wrapper::TaskWrapper;
use crate::task::RawTask;

use inflight::InflightCounter;
use ingest::TaskSource;

/// Capacity of the streams connecting the pipeline stages.
const STAGE_CHANNEL_BUFFER: usize = 32;

/// Runs the full pipeline to completion: every task the source produces is
/// either rejected at sanitization or carried through storage and cleanup.
pub async fn run(source: TaskSource, config: &Config) -> Result<()> {
    let temp_root = config.temp_dir.clone();
    fs::create_dir_all(&temp_root).context("failed to create temp directory")?;

    let (raw_tx, mut raw_rx) = mpsc::channel::<RawTask>(STAGE_CHANNEL_BUFFER);
    let (wrapper_tx, wrapper_rx) = mpsc::channel::<TaskWrapper>(STAGE_CHANNEL_BUFFER);
    let (raw_result_tx, mut raw_result_rx) = mpsc::channel::<RawResult>(STAGE_CHANNEL_BUFFER);
    let (final_tx, final_rx) = mpsc::channel::<FinalResult>(STAGE_CHANNEL_BUFFER);

    let inflight = Arc::new(InflightCounter::new());

    let monitor = if config.monitor {
        let (tx, rx) = mpsc::channel(256);
        let handle = tokio::spawn(monitor::run(rx, config.prom_port));
        Some((tx, handle))
    } else {
        None
    };
    let monitor_tx = monitor.as_ref().map(|(tx, _)| tx.clone());

    // Stage 5: storers share one receiver; each finalized task decrements
    // the inflight counter exactly once, whatever happened to it upstream.
    let shared_final_rx = Arc::new(Mutex::new(final_rx));
    let mut storers = JoinSet::new();
    for worker in 0..config.storers.max(1) {
        let shared_final_rx = shared_final_rx.clone();
        let inflight = inflight.clone();
        let monitor_tx = monitor_tx.clone();
        storers.spawn(async move {
            loop {
                let next = { shared_final_rx.lock().await.recv().await };
                let Some(mut fr) = next else { break };

                if let Err(e) = storage::store(&mut fr).await {
                    error!(worker, url = %fr.task.task.url, error = %e, "storage failed");
                    fr.task.record_failure(e.to_string());
                    fr.summary.success = false;
                }
                storage::cleanup(&mut fr).await;

                info!(
                    worker,
                    url = %fr.task.task.url,
                    uuid = %fr.task.uuid,
                    success = fr.summary.success,
                    resources = fr.summary.num_resources,
                    "task finalized"
                );
                if let Some(tx) = &monitor_tx {
                    let _ = tx.send(fr.summary.clone()).await;
                }
                inflight.done();
            }
        });
    }
    drop(monitor_tx);

    // Stage 4: a single post-processing worker.
    let postprocessor = tokio::spawn(async move {
        while let Some(raw) = raw_result_rx.recv().await {
            let fr = postprocess::process(raw);
            if final_tx.send(fr).await.is_err() {
                break;
            }
        }
    });

    // Stage 3: visit workers. A fatal visit error aborts the task, and the
    // worker then owes the counter its decrement.
    let shared_wrapper_rx = Arc::new(Mutex::new(wrapper_rx));
    let mut visitors = JoinSet::new();
    for worker in 0..config.crawlers.max(1) {
        let shared_wrapper_rx = shared_wrapper_rx.clone();
        let raw_result_tx = raw_result_tx.clone();
        let inflight = inflight.clone();
        visitors.spawn(async move {
            loop {
                let next = { shared_wrapper_rx.lock().await.recv().await };
                let Some(tw) = next else { break };

                debug!(worker, url = %tw.task.url, uuid = %tw.uuid, "visiting site");
                match browser::visit_page_devtools(tw).await {
                    Ok(raw) => {
                        if raw_result_tx.send(raw).await.is_err() {
                            inflight.done();
                            break;
                        }
                    }
                    Err(e) => {
                        error!(worker, error = %e, "aborting task after fatal visit error");
                        inflight.done();
                    }
                }
            }
        });
    }
    drop(raw_result_tx);

    // Stage 2: sanitize until ingest closes, then hold the sanitized stream
    // open until every admitted task has exited stage 5.
    let sanitizer = {
        let inflight = inflight.clone();
        let temp_root = temp_root.clone();
        tokio::spawn(async move {
            while let Some(rt) = raw_rx.recv().await {
                match sanitize_task(&rt, &temp_root) {
                    Ok(tw) => {
                        inflight.add();
                        if wrapper_tx.send(tw).await.is_err() {
                            inflight.done();
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(url = rt.url.as_deref().unwrap_or(""), error = %e, "rejecting task");
                    }
                }
            }
            inflight.drained().await;
            drop(wrapper_tx);
        })
    };

    // Stage 1: the task source.
    let ingester = tokio::spawn(ingest::run(source, raw_tx));

    while visitors.join_next().await.is_some() {}
    let _ = postprocessor.await;
    while storers.join_next().await.is_some() {}
    let _ = sanitizer.await;
    let _ = ingester.await;

    if let Some((tx, handle)) = monitor {
        drop(tx);
        let _ = handle.await;
    }

    if let Err(e) = fs::remove_dir_all(&temp_root) {
        debug!(error = %e, "failed to remove temp directory");
    }

    info!("pipeline drained");
    Ok(())
}
