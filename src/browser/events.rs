//! DevTools event plumbing for a single site visit.
//!
//! Each event kind of interest gets a bounded channel. A demultiplexer task
//! per kind drains the page's typed event stream into that channel, and a
//! dedicated handler worker folds the channel into the shared visit record
//! under its mutex. Handlers run until their channel closes or the shared
//! cancellation signal fires, and are all joined before the visit emits its
//! raw result.

use std::sync::{Arc, Mutex};

use chromiumoxide::cdp::browser_protocol::network::{
    EventRequestWillBeSent, EventResponseReceived,
};
use chromiumoxide::cdp::browser_protocol::page::{
    EventDomContentEventFired, EventLoadEventFired,
};
use chromiumoxide::page::Page;
use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::result::{DevToolsRawData, TaskTiming};
use crate::task::defaults::DEFAULT_EVENT_CHANNEL_BUFFER;

/// The per-visit state written concurrently by the event handler workers.
/// The mutex is held only across field updates, never across I/O.
#[derive(Debug, Clone, Default)]
pub struct VisitRecord {
    pub timing: TaskTiming,
    pub devtools: DevToolsRawData,
}

pub type SharedVisitRecord = Arc<Mutex<VisitRecord>>;

/// Registers the event listeners for every kind of interest and spawns the
/// demultiplexer and handler workers onto `workers`. `load_signal` has
/// capacity one and is signalled exactly once, on the first load event.
pub async fn spawn_event_workers(
    page: &Page,
    record: SharedVisitRecord,
    load_signal: mpsc::Sender<()>,
    cancel: watch::Receiver<bool>,
    workers: &mut JoinSet<()>,
) -> anyhow::Result<()> {
    let load_stream = page.event_listener::<EventLoadEventFired>().await?;
    let dom_stream = page.event_listener::<EventDomContentEventFired>().await?;
    let request_stream = page.event_listener::<EventRequestWillBeSent>().await?;
    let response_stream = page.event_listener::<EventResponseReceived>().await?;

    let (load_tx, load_rx) = mpsc::channel(DEFAULT_EVENT_CHANNEL_BUFFER);
    let (dom_tx, dom_rx) = mpsc::channel(DEFAULT_EVENT_CHANNEL_BUFFER);
    let (request_tx, request_rx) = mpsc::channel(DEFAULT_EVENT_CHANNEL_BUFFER);
    let (response_tx, response_rx) = mpsc::channel(DEFAULT_EVENT_CHANNEL_BUFFER);

    workers.spawn(demux(load_stream, load_tx, cancel.clone()));
    workers.spawn(demux(dom_stream, dom_tx, cancel.clone()));
    workers.spawn(demux(request_stream, request_tx, cancel.clone()));
    workers.spawn(demux(response_stream, response_tx, cancel.clone()));

    workers.spawn(handle_load_event_fired(
        load_rx,
        record.clone(),
        load_signal,
        cancel.clone(),
    ));
    workers.spawn(handle_dom_content_event_fired(
        dom_rx,
        record.clone(),
        cancel.clone(),
    ));
    workers.spawn(handle_request_will_be_sent(
        request_rx,
        record.clone(),
        cancel.clone(),
    ));
    workers.spawn(handle_response_received(response_rx, record, cancel));

    Ok(())
}

/// Routes one typed event stream into its bounded per-kind channel. When the
/// channel is full the demultiplexer blocks, back-pressuring the browser's
/// event delivery rather than dropping events.
async fn demux<T, S>(mut events: S, tx: mpsc::Sender<Arc<T>>, mut cancel: watch::Receiver<bool>)
where
    T: Send + Sync + 'static,
    S: Stream<Item = Arc<T>> + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            ev = events.next() => match ev {
                Some(ev) => {
                    if tx.send(ev).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = cancel.changed() => break,
        }
    }
}

/// Records the load-event instant on the first event and signals the
/// completion state machine exactly once; later load events are drained
/// without re-signalling.
async fn handle_load_event_fired(
    mut events: mpsc::Receiver<Arc<EventLoadEventFired>>,
    record: SharedVisitRecord,
    load_signal: mpsc::Sender<()>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut signalled = false;
    loop {
        tokio::select! {
            ev = events.recv() => match ev {
                Some(_) => {
                    {
                        let mut record = lock(&record);
                        if record.timing.load_event.is_none() {
                            record.timing.load_event = Some(Utc::now());
                        }
                    }
                    if !signalled {
                        signalled = true;
                        // The send races cancellation so the handler can
                        // never wedge on an unconsumed signal channel.
                        tokio::select! {
                            _ = load_signal.send(()) => {}
                            _ = cancel.changed() => return,
                        }
                    }
                }
                None => return,
            },
            _ = cancel.changed() => return,
        }
    }
}

async fn handle_dom_content_event_fired(
    mut events: mpsc::Receiver<Arc<EventDomContentEventFired>>,
    record: SharedVisitRecord,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            ev = events.recv() => match ev {
                Some(_) => {
                    let mut record = lock(&record);
                    if record.timing.dom_content_event.is_none() {
                        record.timing.dom_content_event = Some(Utc::now());
                    }
                }
                None => return,
            },
            _ = cancel.changed() => return,
        }
    }
}

/// Appends each event to the per-request-id list, preserving arrival order.
/// Redirects arrive as additional events sharing the original request id.
async fn handle_request_will_be_sent(
    mut events: mpsc::Receiver<Arc<EventRequestWillBeSent>>,
    record: SharedVisitRecord,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            ev = events.recv() => match ev {
                Some(ev) => {
                    let mut record = lock(&record);
                    record
                        .devtools
                        .request_will_be_sent
                        .entry(ev.request_id.inner().clone())
                        .or_default()
                        .push((*ev).clone());
                }
                None => return,
            },
            _ = cancel.changed() => return,
        }
    }
}

/// Last write wins: the protocol emits at most one final response per
/// request id, redirects excepted.
async fn handle_response_received(
    mut events: mpsc::Receiver<Arc<EventResponseReceived>>,
    record: SharedVisitRecord,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            ev = events.recv() => match ev {
                Some(ev) => {
                    let mut record = lock(&record);
                    record
                        .devtools
                        .response_received
                        .insert(ev.request_id.inner().clone(), (*ev).clone());
                }
                None => return,
            },
            _ = cancel.changed() => return,
        }
    }
}

fn lock(record: &SharedVisitRecord) -> std::sync::MutexGuard<'_, VisitRecord> {
    record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
