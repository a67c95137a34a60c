//! Stage 1: producing raw tasks from a file, a CLI-built task set, or a
//! shared AMQP queue.

use std::path::PathBuf;

use futures::StreamExt;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::amqp::{self, ConnParams};
use crate::task::{expand_compressed_task_set, read_tasks_from_file, CompressedTaskSet, RawTask};

/// Where stage 1 pulls its raw tasks from.
#[derive(Debug)]
pub enum TaskSource {
    /// A JSON task file (single task, task list, or compressed set)
    File { path: PathBuf, shuffle: bool },
    /// A task set synthesized from CLI options
    Builder {
        set: CompressedTaskSet,
        shuffle: bool,
    },
    /// A shared AMQP queue plus the control broadcast exchange
    Amqp { params: ConnParams, queue: String },
}

/// Emits raw tasks onto the stage-1 output stream until the source is
/// exhausted (or, for the AMQP source, until a `quit` broadcast arrives),
/// then closes the stream by dropping the sender. Back-pressure comes from
/// the bounded channel; ingest itself never buffers beyond one batch.
pub async fn run(source: TaskSource, tx: mpsc::Sender<RawTask>) {
    match source {
        TaskSource::File { path, shuffle } => {
            let tasks = match read_tasks_from_file(&path) {
                Ok(tasks) => tasks,
                Err(e) => {
                    error!(error = %e, "failed to read task file");
                    return;
                }
            };
            emit_batch(tasks, shuffle, &tx).await;
        }
        TaskSource::Builder { set, shuffle } => {
            let tasks = expand_compressed_task_set(&set);
            emit_batch(tasks, shuffle, &tx).await;
        }
        TaskSource::Amqp { params, queue } => {
            consume_queue(&params, &queue, &tx).await;
        }
    }
}

async fn emit_batch(mut tasks: Vec<RawTask>, shuffle: bool, tx: &mpsc::Sender<RawTask>) {
    if shuffle {
        tasks.shuffle(&mut rand::thread_rng());
    }
    for task in tasks {
        if tx.send(task).await.is_err() {
            return;
        }
    }
}

/// Remains a client of the AMQP broker, forwarding task messages in arrival
/// order, until a `quit` broadcast is received.
async fn consume_queue(params: &ConnParams, queue: &str, tx: &mpsc::Sender<RawTask>) {
    let mut tasks = match amqp::task_consumer(params, queue).await {
        Ok(consumer) => consumer,
        Err(e) => {
            error!(error = %e, "failed to connect task consumer");
            return;
        }
    };
    let mut broadcasts =
        match amqp::broadcast_consumer(params, amqp::DEFAULT_BROADCAST_EXCHANGE).await {
            Ok(consumer) => consumer,
            Err(e) => {
                error!(error = %e, "failed to connect broadcast consumer");
                return;
            }
        };

    info!(queue, "connected to AMQP task queue");

    loop {
        tokio::select! {
            delivery = broadcasts.deliveries.next() => {
                let Some(Ok(delivery)) = delivery else {
                    warn!("broadcast channel closed, shutting down ingest");
                    return;
                };
                let body = String::from_utf8_lossy(&delivery.data);
                warn!(message = %body, "broadcast received");
                if body == "quit" {
                    return;
                }
            }
            delivery = tasks.deliveries.next() => {
                let Some(Ok(delivery)) = delivery else {
                    warn!("task channel closed, shutting down ingest");
                    return;
                };
                match amqp::decode_raw_task(&delivery.data) {
                    Ok(task) => {
                        if tx.send(task).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => error!(error = %e, "discarding undecodable task message"),
                }
            }
        }
    }
}
