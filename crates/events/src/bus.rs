//! Event publishing/subscription abstraction (mechanics only).
//!
//! Orchestrators publish a [`TransitionEvent`](crate::TransitionEvent) after a
//! case mutation has been committed; consumers (the notification pipeline)
//! subscribe and process events on their own threads, fully decoupled from the
//! request that produced them.
//!
//! ## Delivery
//!
//! - **At-least-once**: a consumer may see the same event twice and must not
//!   rely on de-duplication by the bus.
//! - **Per-publisher ordering**: events from one publisher arrive in publish
//!   order; no ordering is promised across concurrent publishers.
//! - **No persistence**: the case store and its history are the source of
//!   truth, the bus only distributes.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to an event stream.
///
/// Each subscription gets a copy of every message published after it was
/// created (broadcast semantics).
///
/// ```ignore
/// let subscription = bus.subscribe();
/// loop {
///     match subscription.recv_timeout(Duration::from_millis(250)) {
///         Ok(event) => handle(event),
///         Err(RecvTimeoutError::Timeout) => continue,     // check for shutdown
///         Err(RecvTimeoutError::Disconnected) => break,   // bus dropped
///     }
/// }
/// ```
///
/// Subscriptions are single-consumer: hand messages to a shared queue if
/// several threads must process them.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Transport-agnostic pub/sub bus.
///
/// `publish()` may fail (closed transport, poisoned lock). Callers publish
/// only after the underlying mutation is durable, so a failed publish never
/// leaves a consumer looking at state that could still be rolled back.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
