//! Stage 3: the site visit over the DevTools protocol.
//!
//! One worker drives one task end-to-end: browser setup and launch, domain
//! enablement, a navigation task raced against timers and browser death,
//! the completion-condition wait, and an orderly shutdown that always fires
//! both cascading cancellations (browser and event listeners) before the
//! raw result is emitted.

pub mod events;
pub mod flags;

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::EnableParams as NetworkEnableParams;
use chromiumoxide::cdp::browser_protocol::page::{
    EnableParams as PageEnableParams, NavigateParams,
};
use chromiumoxide::cdp::js_protocol::debugger::EnableParams as DebuggerEnableParams;
use chromiumoxide::cdp::js_protocol::runtime::DisableParams as RuntimeDisableParams;
use chromiumoxide::page::Page;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep_until, timeout, Instant};

use crate::result::{CrawlerInfo, RawResult, TaskSummary};
use crate::task::defaults::{DEFAULT_NAV_TIMEOUT_SECS, RESOURCE_SUBDIR};
use crate::task::wrapper::{CompletionCondition, TaskLog, TaskWrapper};

use events::{SharedVisitRecord, VisitRecord};

/// How long a graceful browser close may take before the hard kill.
const GRACEFUL_CLOSE: Duration = Duration::from_secs(5);

enum PhaseB {
    Load,
    Timeout,
    BrowserDone,
}

/// Visits the task's URL and returns the raw result, failure or not. An
/// `Err` is returned only for fatal infrastructure problems (no usable
/// user data directory, no DevTools domains); ordinary visit failures are
/// recorded on the task and still produce a result.
pub async fn visit_page_devtools(mut tw: TaskWrapper) -> Result<RawResult> {
    let begin_crawl = Utc::now();

    // Make sure the user data directory exists. Failing to create it means
    // a major misconfiguration, bad enough to abort the task entirely.
    if !tw.task.user_data_dir.exists() {
        fs::create_dir_all(&tw.task.user_data_dir)
            .context("failed to create user data directory")?;
    }

    tw.log
        .info(format!("initiated site visit log for {}", tw.task.url));

    if tw.task.data.all_resources {
        let resource_dir = tw.task.user_data_dir.join(RESOURCE_SUBDIR);
        if !resource_dir.exists() {
            fs::create_dir_all(&resource_dir)
                .context("failed to create resource subdirectory")?;
        }
    }

    // Translate the sanitized flag strings into launch arguments. Bad flags
    // are logged and skipped; they do not fail the task.
    let mut args = Vec::with_capacity(tw.task.browser_flags.len());
    for flag in &tw.task.browser_flags {
        match flags::format_flag(flag) {
            Ok((name, value)) => args.push(flags::render_flag(&name, value.as_deref())),
            Err(_) => {
                tracing::warn!(flag = %flag, "skipping bad browser flag");
                tw.log.warn(format!("skipping bad flag: {flag}"));
            }
        }
    }

    let config = BrowserConfig::builder()
        .chrome_executable(&tw.task.browser_binary)
        .user_data_dir(&tw.task.user_data_dir)
        .args(args)
        .build()
        .map_err(|e| anyhow!("invalid browser configuration: {e}"))?;

    let (mut browser, mut handler) = Browser::launch(config)
        .await
        .context("failed to spawn browser")?;
    let browser_open = Utc::now();

    // The handler stream must be driven for the browser connection to make
    // progress; it ending is our browser-death signal.
    let (death_tx, death_rx) = watch::channel(false);
    let driver: JoinHandle<()> = tokio::spawn(async move {
        while let Some(res) = handler.next().await {
            if res.is_err() {
                break;
            }
        }
        let _ = death_tx.send(true);
    });

    let crawler_info = match browser.version().await {
        Ok(version) => CrawlerInfo {
            host_name: host_name(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            browser: version.product,
            user_agent: version.user_agent,
        },
        Err(e) => {
            tracing::warn!(error = %e, "failed to query browser version");
            CrawlerInfo {
                host_name: host_name(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            }
        }
    };

    let record: SharedVisitRecord = Arc::new(Mutex::new(VisitRecord::default()));
    {
        let mut r = record.lock().unwrap_or_else(|p| p.into_inner());
        r.timing.begin_crawl = Some(begin_crawl);
        r.timing.browser_open = Some(browser_open);
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (load_tx, mut load_rx) = mpsc::channel::<()>(1);
    let mut workers = JoinSet::new();

    let page = match browser.new_page("about:blank").await {
        Ok(page) => page,
        Err(e) => {
            abort_visit(&mut browser, &cancel_tx, &mut workers, &driver).await;
            return Err(anyhow!("failed to open page: {e}"));
        }
    };

    if let Err(e) = events::spawn_event_workers(
        &page,
        record.clone(),
        load_tx,
        cancel_rx.clone(),
        &mut workers,
    )
    .await
    {
        abort_visit(&mut browser, &cancel_tx, &mut workers, &driver).await;
        return Err(anyhow!("failed to register event listeners: {e}"));
    }

    // If the domains cannot be enabled something is seriously wrong with
    // the browser; no results are produced.
    if let Err(e) = enable_domains(&page).await {
        tw.log.error("failed to enable DevTools domains");
        abort_visit(&mut browser, &cancel_tx, &mut workers, &driver).await;
        return Err(anyhow!("failed to enable DevTools domains: {e}"));
    }

    // The navigation task reports its outcome on a one-shot channel so the
    // completion race below can observe it alongside the timers.
    let (nav_tx, nav_rx) = oneshot::channel::<Result<()>>();
    let nav_page = page.clone();
    let nav_url = tw.task.url.clone();
    tokio::spawn(async move {
        let _ = nav_tx.send(navigate(&nav_page, &nav_url).await);
    });

    let overall_deadline = Instant::now() + tw.task.completion.timeout;
    let nav_deadline = Instant::now() + Duration::from_secs(DEFAULT_NAV_TIMEOUT_SECS);
    let mut death = death_rx.clone();

    // Phase A: race the navigation result against the nav timer, the
    // overall timer, and browser death.
    let mut connected = false;
    tokio::select! {
        res = nav_rx => match res {
            Ok(Ok(())) => {
                let mut r = record.lock().unwrap_or_else(|p| p.into_inner());
                r.timing.connection_established = Some(Utc::now());
                connected = true;
            }
            Ok(Err(e)) => tw.record_failure(e.to_string()),
            Err(_) => tw.record_failure("browser closed during connection to site"),
        },
        _ = sleep_until(nav_deadline) => {
            tw.record_failure("timeout on connection to webserver");
        }
        _ = sleep_until(overall_deadline) => {
            tw.record_failure("total site visit time exceeded before we connected to webserver");
        }
        _ = death.changed() => {
            tw.record_failure("browser closed during connection to site");
        }
    }

    if !connected {
        shutdown_browser(&mut browser, &tw.log).await;
        return Ok(finish_visit(tw, crawler_info, record, cancel_tx, workers, driver).await);
    }

    // Phase B: connected and navigating; wait out the completion condition.
    let outcome = tokio::select! {
        _ = death.changed() => PhaseB::BrowserDone,
        _ = sleep_until(overall_deadline) => PhaseB::Timeout,
        ev = load_rx.recv() => if ev.is_some() { PhaseB::Load } else { PhaseB::BrowserDone },
    };

    match outcome {
        PhaseB::BrowserDone => {
            tw.log
                .warn("browser crashed, closed manually, or we lost connection");
        }
        PhaseB::Timeout => {
            tw.log.debug("hit general timeout before load event");
        }
        PhaseB::Load => match tw.task.completion.condition {
            CompletionCondition::LoadEvent => {
                tw.log.debug("got load event so we are concluding site visit");
            }
            CompletionCondition::TimeAfterLoad => {
                let after_load = Instant::now() + tw.task.completion.time_after_load;
                tokio::select! {
                    _ = death.changed() => {
                        tw.log.warn("browser crashed, closed manually, or we lost connection (after load event)");
                    }
                    _ = sleep_until(overall_deadline) => {
                        tw.log.debug("general timeout hit before time_after_load");
                    }
                    _ = sleep_until(after_load) => {
                        tw.log.debug("hit time_after_load");
                    }
                }
            }
            CompletionCondition::TimeoutOnly => {
                tokio::select! {
                    _ = death.changed() => {
                        tw.log.warn("browser crashed, closed manually, or we lost connection (after load event)");
                    }
                    _ = sleep_until(overall_deadline) => {
                        tw.log.debug("hit general timeout");
                    }
                }
            }
        },
    }

    shutdown_browser(&mut browser, &tw.log).await;
    Ok(finish_visit(tw, crawler_info, record, cancel_tx, workers, driver).await)
}

async fn navigate(page: &Page, url: &str) -> Result<()> {
    let params = NavigateParams::builder()
        .url(url)
        .build()
        .map_err(|e| anyhow!("invalid navigation parameters: {e}"))?;

    let response = page.execute(params).await.map_err(|e| anyhow!("{e}"))?;

    match response.result.error_text.as_deref() {
        Some(text) if !text.is_empty() => Err(anyhow!("{text}")),
        _ => Ok(()),
    }
}

async fn enable_domains(page: &Page) -> Result<()> {
    page.execute(RuntimeDisableParams::default()).await?;
    page.execute(PageEnableParams::default()).await?;
    page.execute(DebuggerEnableParams::default()).await?;
    page.execute(NetworkEnableParams::default()).await?;
    Ok(())
}

/// Attempts a graceful browser close within [`GRACEFUL_CLOSE`]; on timeout
/// or error the child process is killed outright.
async fn shutdown_browser(browser: &mut Browser, log: &TaskLog) {
    match timeout(GRACEFUL_CLOSE, browser.close()).await {
        Ok(Ok(_)) => {
            if timeout(GRACEFUL_CLOSE, browser.wait()).await.is_err() {
                log.warn("browser did not exit after close, killing it");
                let _ = browser.kill().await;
            }
        }
        Ok(Err(e)) => {
            log.warn(format!(
                "failed to close browser gracefully, so we had to force it ({e})"
            ));
            let _ = browser.kill().await;
        }
        Err(_) => {
            log.warn("failed to close browser gracefully within the allotted time, forcing it");
            let _ = browser.kill().await;
        }
    }
}

/// Records the browser-close instant, releases the event workers, joins
/// them, and assembles the raw result. Runs on every emitting exit path.
async fn finish_visit(
    tw: TaskWrapper,
    crawler_info: CrawlerInfo,
    record: SharedVisitRecord,
    cancel_tx: watch::Sender<bool>,
    mut workers: JoinSet<()>,
    driver: JoinHandle<()>,
) -> RawResult {
    {
        let mut r = record.lock().unwrap_or_else(|p| p.into_inner());
        r.timing.browser_close = Some(Utc::now());
    }

    let _ = cancel_tx.send(true);
    while workers.join_next().await.is_some() {}
    driver.abort();

    tw.log
        .debug("finished waiting on event workers, site visit concluded");

    let data = match Arc::try_unwrap(record) {
        Ok(mutex) => mutex.into_inner().unwrap_or_else(|p| p.into_inner()),
        Err(record) => record.lock().unwrap_or_else(|p| p.into_inner()).clone(),
    };

    let success = !tw.has_failed();
    RawResult {
        crawler_info,
        summary: TaskSummary {
            success,
            timing: data.timing,
            num_resources: 0,
        },
        task: tw,
        devtools: data.devtools,
    }
}

/// Tears down a visit that failed before the completion race could start:
/// kill the browser, then release and join any already-running workers.
async fn abort_visit(
    browser: &mut Browser,
    cancel_tx: &watch::Sender<bool>,
    workers: &mut JoinSet<()>,
    driver: &JoinHandle<()>,
) {
    let _ = browser.kill().await;
    let _ = cancel_tx.send(true);
    while workers.join_next().await.is_some() {}
    driver.abort();
}

fn host_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}
