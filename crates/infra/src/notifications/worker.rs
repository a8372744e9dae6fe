//! Background workers feeding transition events to the dispatcher.
//!
//! - One bus subscription, shared by `workers` threads through a mutex
//! - Each thread polls with `poll_interval` so shutdown is noticed promptly
//! - Delivery outcomes only update statistics; nothing flows back to the
//!   publisher

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use consular_events::{EventBus, Subscription, TransitionEvent};

use super::dispatcher::{DispatchOutcome, NotificationDispatcher};

#[derive(Debug, Clone)]
pub struct NotificationWorkerConfig {
    pub workers: usize,
    pub poll_interval: Duration,
    /// Thread name prefix.
    pub name: String,
}

impl Default for NotificationWorkerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_millis(250),
            name: "notify".to_string(),
        }
    }
}

impl NotificationWorkerConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotificationWorkerStats {
    pub received: u64,
    pub sent: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl NotificationWorkerStats {
    /// Events whose handling has finished.
    pub fn processed(&self) -> u64 {
        self.sent + self.failed + self.skipped
    }
}

#[derive(Debug)]
pub struct NotificationWorkerHandle {
    shutdown: Arc<AtomicBool>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<NotificationWorkerStats>>,
}

impl NotificationWorkerHandle {
    /// Request graceful shutdown and wait for every worker to stop.
    ///
    /// Events still queued in the subscription are dropped.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for join in self.joins {
            let _ = join.join();
        }
    }

    pub fn stats(&self) -> NotificationWorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

pub struct NotificationWorker;

impl NotificationWorker {
    /// Subscribe to `bus` and start the worker threads.
    ///
    /// The subscription is taken before this returns, so every event
    /// published afterwards is seen.
    pub fn spawn<B>(
        bus: &B,
        dispatcher: Arc<NotificationDispatcher>,
        config: NotificationWorkerConfig,
    ) -> io::Result<NotificationWorkerHandle>
    where
        B: EventBus<TransitionEvent>,
    {
        let queue = Arc::new(Mutex::new(bus.subscribe()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(NotificationWorkerStats::default()));

        let mut joins = Vec::with_capacity(config.workers);
        for index in 0..config.workers.max(1) {
            let name = format!("{}-{index}", config.name);
            let ctx = WorkerContext {
                name: name.clone(),
                queue: queue.clone(),
                dispatcher: dispatcher.clone(),
                shutdown: shutdown.clone(),
                stats: stats.clone(),
                poll_interval: config.poll_interval,
            };
            match thread::Builder::new().name(name).spawn(move || ctx.run()) {
                Ok(join) => joins.push(join),
                Err(err) => {
                    shutdown.store(true, Ordering::SeqCst);
                    for join in joins {
                        let _ = join.join();
                    }
                    return Err(err);
                }
            }
        }

        info!(workers = joins.len(), "notification workers started");
        Ok(NotificationWorkerHandle {
            shutdown,
            joins,
            stats,
        })
    }
}

struct WorkerContext {
    name: String,
    queue: Arc<Mutex<Subscription<TransitionEvent>>>,
    dispatcher: Arc<NotificationDispatcher>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<Mutex<NotificationWorkerStats>>,
    poll_interval: Duration,
}

impl WorkerContext {
    fn run(self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            let next = match self.queue.lock() {
                Ok(sub) => sub.recv_timeout(self.poll_interval),
                Err(_) => {
                    warn!(worker = %self.name, "event queue poisoned, stopping");
                    break;
                }
            };

            match next {
                Ok(event) => self.process(event),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(worker = %self.name, "notification worker stopped");
    }

    fn process(&self, event: TransitionEvent) {
        self.bump(|s| s.received += 1);
        match self.dispatcher.handle(&event) {
            DispatchOutcome::Sent(_) => self.bump(|s| s.sent += 1),
            DispatchOutcome::Failed { .. } => self.bump(|s| s.failed += 1),
            DispatchOutcome::Skipped(reason) => {
                debug!(
                    worker = %self.name,
                    case_id = %event.case_id,
                    state = %event.new_state,
                    reason = ?reason,
                    "event skipped"
                );
                self.bump(|s| s.skipped += 1);
            }
        }
    }

    fn bump(&self, f: impl FnOnce(&mut NotificationWorkerStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}
