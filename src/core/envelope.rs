/// Operation envelopes and their continuations
///
/// An envelope carries one request through a connection. When the request expects
/// a reply it holds a [`ReplySlot`], which is the only way a result reaches the
/// caller. The slot accepts the first result and ignores every later one, so a
/// request raced by a reply and a connection failure is still notified once.
use crate::error::{DriverError, DriverResult};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::oneshot;

/// Boxed reply callback
pub type ReplyCallback<Rep> = Box<dyn FnOnce(DriverResult<Rep>) + Send>;

/// Where the result of an operation is delivered
pub enum Continuation<Rep> {
    /// Wakes a [`ReplyHandle`]
    Channel(oneshot::Sender<DriverResult<Rep>>),
    /// Invoked inline on the task that produced the result
    Callback(ReplyCallback<Rep>),
    /// Result is discarded
    Noop,
}

impl<Rep> Continuation<Rep> {
    fn deliver(self, result: DriverResult<Rep>) {
        match self {
            // The caller may have stopped waiting; that is not an error here.
            Continuation::Channel(tx) => {
                let _ = tx.send(result);
            }
            Continuation::Callback(callback) => callback(result),
            Continuation::Noop => {}
        }
    }
}

impl<Rep> fmt::Debug for Continuation<Rep> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Continuation::Channel(_) => write!(f, "Channel"),
            Continuation::Callback(_) => write!(f, "Callback"),
            Continuation::Noop => write!(f, "Noop"),
        }
    }
}

/// Exactly-once holder for a continuation
pub struct ReplySlot<Rep> {
    continuation: Mutex<Option<Continuation<Rep>>>,
}

impl<Rep> ReplySlot<Rep> {
    pub fn new(continuation: Continuation<Rep>) -> Self {
        Self {
            continuation: Mutex::new(Some(continuation)),
        }
    }

    /// Slot paired with a future that resolves to the result
    pub fn channel() -> (Self, ReplyHandle<Rep>) {
        let (tx, rx) = oneshot::channel();
        (Self::new(Continuation::Channel(tx)), ReplyHandle { rx })
    }

    pub fn callback<F>(callback: F) -> Self
    where
        F: FnOnce(DriverResult<Rep>) + Send + 'static,
    {
        Self::new(Continuation::Callback(Box::new(callback)))
    }

    pub fn noop() -> Self {
        Self::new(Continuation::Noop)
    }

    /// Deliver `result` if nothing has been delivered yet.
    ///
    /// Returns `false` when the slot was already completed.
    pub fn complete(&self, result: DriverResult<Rep>) -> bool {
        let continuation = self
            .continuation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match continuation {
            Some(continuation) => {
                continuation.deliver(result);
                true
            }
            None => false,
        }
    }

    /// Discard the continuation without invoking it.
    ///
    /// Used when a submit is refused synchronously and the caller already has the error.
    pub fn disarm(&self) -> bool {
        self.continuation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    pub fn is_completed(&self) -> bool {
        self.continuation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl<Rep> Drop for ReplySlot<Rep> {
    fn drop(&mut self) {
        let continuation = self
            .continuation
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(continuation) = continuation {
            continuation.deliver(Err(DriverError::connection_lost(
                "operation dropped before a reply was delivered",
            )));
        }
    }
}

impl<Rep> fmt::Debug for ReplySlot<Rep> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplySlot")
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Future side of [`Continuation::Channel`]
#[derive(Debug)]
pub struct ReplyHandle<Rep> {
    rx: oneshot::Receiver<DriverResult<Rep>>,
}

impl<Rep> Future for ReplyHandle<Rep> {
    type Output = DriverResult<Rep>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(DriverError::connection_lost(
                    "reply channel closed without a result",
                ))
            })
        })
    }
}

/// One request queued on a connection
#[derive(Debug)]
pub struct Envelope<Req, Rep> {
    pub request_id: i32,
    pub request: Req,
    /// `None` for fire-and-forget requests
    pub reply: Option<Arc<ReplySlot<Rep>>>,
    pub enqueued_at: Instant,
}

impl<Req, Rep> Envelope<Req, Rep> {
    pub fn new(request_id: i32, request: Req, reply: Option<ReplySlot<Rep>>) -> Self {
        Self {
            request_id,
            request,
            reply: reply.map(Arc::new),
            enqueued_at: Instant::now(),
        }
    }

    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Fail the envelope's continuation, if it has one.
    pub fn fail(&self, error: DriverError) -> bool {
        match &self.reply {
            Some(slot) => slot.complete(Err(error)),
            None => false,
        }
    }

    pub fn disarm(&self) {
        if let Some(slot) = &self.reply {
            slot.disarm();
        }
    }
}

/// Awaiting-reply queue entry
#[derive(Debug)]
pub struct PendingReply<Rep> {
    pub request_id: i32,
    pub slot: Arc<ReplySlot<Rep>>,
}

/// Per-connection request id source.
///
/// Ids are positive, wrap from `i32::MAX` back to 1 and never yield 0.
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicI32,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: i32) -> Self {
        Self {
            next: AtomicI32::new(first.max(1)),
        }
    }

    pub fn next_id(&self) -> i32 {
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            let following = if current == i32::MAX { 1 } else { current + 1 };
            match self.next.compare_exchange_weak(
                current,
                following,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
