// Application event loop.
//
// Receives gateway events, fans chat messages out to one worker task per
// user (so a user's turns are handled in order while different users are
// handled concurrently), and periodically expires idle sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use episteme_core::UserId;

use crate::conversation::ConversationManager;
use crate::gateway::GatewayEvent;
use crate::protocol::{InboundEvent, OutboundMessage};

/// Queue depth of each per-user worker.
const WORKER_QUEUE: usize = 32;

/// A worker with nothing to do for this long shuts itself down.
const WORKER_IDLE: Duration = Duration::from_secs(300);

/// Reply to a user whose queue is full.
const BUSY_NOTICE: &str = "I'm still working through your earlier messages. Please send that again in a moment.";

struct Worker {
    tx: mpsc::Sender<InboundEvent>,
    task: JoinHandle<()>,
}

pub struct AppState {
    manager: Arc<ConversationManager>,
    outbound: mpsc::Sender<OutboundMessage>,
    workers: HashMap<UserId, Worker>,
    worker_queue: usize,
}

impl AppState {
    pub fn new(manager: Arc<ConversationManager>, outbound: mpsc::Sender<OutboundMessage>) -> Self {
        AppState {
            manager,
            outbound,
            workers: HashMap::new(),
            worker_queue: WORKER_QUEUE,
        }
    }

    /// Hand an event to its user's worker, starting one if needed.
    ///
    /// Never waits: a user whose queue is full is told to retry, so one slow
    /// user cannot hold up the loop.
    fn dispatch(&mut self, event: InboundEvent) {
        let user = event.user_id.clone();
        let event = match self.workers.get(&user) {
            Some(worker) => match worker.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    warn!("Queue for {} is full; dropping a message", user);
                    if self
                        .outbound
                        .try_send(OutboundMessage::direct(user, BUSY_NOTICE))
                        .is_err()
                    {
                        warn!("Outbound channel full; busy notice not sent");
                    }
                    return;
                }
                Err(TrySendError::Closed(event)) => {
                    debug!("Worker for {} has stopped; starting a new one", user);
                    event
                }
            },
            None => event,
        };

        // The new worker waits for the old one to drain, keeping order.
        let previous = self.workers.remove(&user).map(|w| w.task);
        let worker = spawn_worker(
            self.manager.clone(),
            self.outbound.clone(),
            self.worker_queue,
            previous,
        );
        if worker.tx.try_send(event).is_err() {
            warn!("Fresh worker for {} refused its first event", user);
        }
        self.workers.insert(user, worker);
    }

    async fn sweep(&mut self) {
        self.workers.retain(|_, w| !w.task.is_finished());

        let notices = self.manager.expire_idle(Instant::now());
        if !notices.is_empty() {
            info!("Expired {} idle session(s)", notices.len());
        }
        for notice in notices {
            if self.outbound.send(notice).await.is_err() {
                warn!("Outbound channel closed during sweep");
                break;
            }
        }
    }
}

/// Spawn a task that handles one user's events in arrival order.
///
/// The task first waits for `previous` (the user's earlier worker) to
/// finish, and exits on its own after `WORKER_IDLE` without events.
fn spawn_worker(
    manager: Arc<ConversationManager>,
    outbound: mpsc::Sender<OutboundMessage>,
    queue: usize,
    previous: Option<JoinHandle<()>>,
) -> Worker {
    let (tx, mut rx) = mpsc::channel::<InboundEvent>(queue.max(1));
    let task = tokio::spawn(async move {
        if let Some(previous) = previous {
            let _ = previous.await;
        }
        loop {
            let event = match tokio::time::timeout(WORKER_IDLE, rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => return,
                Err(_) => {
                    // Refuse new events, then finish whatever is queued.
                    rx.close();
                    continue;
                }
            };
            for reply in manager.handle(&event) {
                if outbound.send(reply).await.is_err() {
                    debug!("Outbound channel closed; worker exiting");
                    return;
                }
            }
        }
    });
    Worker { tx, task }
}

/// Run the event loop until the gateway channel closes.
pub async fn run(
    mut gateway_rx: mpsc::Receiver<GatewayEvent>,
    mut state: AppState,
    sweep_interval: Duration,
) -> anyhow::Result<()> {
    info!("Application event loop started");

    let mut sweep = tokio::time::interval(sweep_interval);
    // The first tick completes immediately.
    sweep.tick().await;

    loop {
        tokio::select! {
            event = gateway_rx.recv() => {
                match event {
                    Some(GatewayEvent::Connected { addr }) => {
                        info!("Bridge connected from {}", addr);
                    }
                    Some(GatewayEvent::Disconnected) => {
                        info!("Bridge disconnected");
                    }
                    Some(GatewayEvent::Message(json)) => match InboundEvent::from_json(&json) {
                        Ok(event) => state.dispatch(event),
                        Err(e) => warn!("Ignoring malformed bridge frame: {} ({})", e, json),
                    },
                    None => {
                        info!("Gateway channel closed, shutting down");
                        break;
                    }
                }
            }

            _ = sweep.tick() => {
                state.sweep().await;
            }
        }
    }

    Ok(())
}
