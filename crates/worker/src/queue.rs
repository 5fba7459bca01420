// In-process event queue and the worker pool consuming it

use anyhow::{Context, Result};
use stagehand_core::dispatcher::NodeExecutionEventDispatcher;
use stagehand_core::events::NodeExecutionEvent;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Deliveries attempted before an event is dropped
pub const MAX_DELIVERY_ATTEMPTS: u32 = 3;

#[derive(Debug)]
pub struct QueuedEvent {
    pub event: NodeExecutionEvent,
    pub attempt: u32,
}

/// Producer side of the event queue
#[derive(Clone)]
pub struct EventQueue {
    tx: mpsc::Sender<QueuedEvent>,
}

pub type EventReceiver = mpsc::Receiver<QueuedEvent>;

pub fn channel(capacity: usize) -> (EventQueue, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventQueue { tx }, rx)
}

impl EventQueue {
    pub async fn enqueue(&self, event: NodeExecutionEvent) -> Result<()> {
        self.send(QueuedEvent { event, attempt: 1 }).await
    }

    async fn send(&self, queued: QueuedEvent) -> Result<()> {
        self.tx
            .send(queued)
            .await
            .map_err(|_| anyhow::anyhow!("Event queue is closed"))
    }
}

/// Spawn `concurrency` workers sharing one receiver
pub fn spawn_workers(
    receiver: EventReceiver,
    queue: EventQueue,
    dispatcher: Arc<NodeExecutionEventDispatcher>,
    concurrency: usize,
) -> Vec<JoinHandle<()>> {
    let receiver = Arc::new(Mutex::new(receiver));
    (0..concurrency.max(1))
        .map(|worker_id| {
            let receiver = receiver.clone();
            let queue = queue.clone();
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                tracing::debug!("Worker {} started", worker_id);
                loop {
                    // Hold the lock only while waiting for the next event
                    let next = receiver.lock().await.recv().await;
                    let Some(queued) = next else {
                        break;
                    };
                    if let Err(e) = process(&dispatcher, &queue, queued).await {
                        tracing::error!("Worker {} failed to process event: {:#}", worker_id, e);
                    }
                }
                tracing::debug!("Worker {} stopped", worker_id);
            })
        })
        .collect()
}

async fn process(
    dispatcher: &NodeExecutionEventDispatcher,
    queue: &EventQueue,
    queued: QueuedEvent,
) -> Result<()> {
    let QueuedEvent { event, attempt } = queued;
    let event_id = event.id.clone();

    match dispatcher.dispatch(event.clone()).await {
        Ok(handled) => {
            if !handled {
                tracing::warn!("Event {} completed with a failure response", event_id);
            }
            Ok(())
        }
        Err(e) if attempt < MAX_DELIVERY_ATTEMPTS => {
            tracing::warn!(
                "Redelivering event {} (attempt {}): {:#}",
                event_id,
                attempt + 1,
                e
            );
            queue
                .send(QueuedEvent {
                    event,
                    attempt: attempt + 1,
                })
                .await
                .context("Failed to redeliver event")
        }
        Err(e) => Err(e.context(format!(
            "Dropping event {} after {} attempts",
            event_id, attempt
        ))),
    }
}
