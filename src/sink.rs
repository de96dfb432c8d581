//! Bounded multi-producer/single-consumer mailboxes with sealable send ends.
//!
//! Several producers (peers, the router) may feed one consumer loop, each
//! through its own [`MessageSink`] carrying a fixed sender identity. Sealing
//! one sink shuts up that producer without disturbing the others sharing the
//! underlying channel; closing the receiver drains whatever is still queued
//! so the owner can re-route it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

/// A send failure, handing the rejected message back to the caller.
pub enum SendError<T> {
    /// The sink was sealed (or the receive end is gone).
    Sealed(T),
    /// Non-blocking send hit capacity; nothing was enqueued.
    Full(T),
}

impl<T> SendError<T> {
    /// Recovers the message that could not be delivered.
    pub fn into_inner(self) -> T {
        match self {
            SendError::Sealed(m) | SendError::Full(m) => m,
        }
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Sealed(_) => write!(f, "SendError::Sealed(..)"),
            SendError::Full(_) => write!(f, "SendError::Full(..)"),
        }
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Sealed(_) => write!(f, "sink is sealed"),
            SendError::Full(_) => write!(f, "sink is full"),
        }
    }
}

impl<T> std::error::Error for SendError<T> {}

/// Creates a bounded channel and hands back the raw send end plus the
/// receiver. Producers are given [`MessageSink`]s built from clones of the
/// raw sender, each with its own identity and seal flag.
pub fn channel<S, T>(capacity: usize) -> (mpsc::Sender<(S, T)>, SinkReceiver<S, T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, SinkReceiver { rx })
}

/// A sealable sending endpoint. Cloning shares the seal flag, so sealing
/// any clone seals them all.
pub struct MessageSink<S, T> {
    identity: S,
    tx: mpsc::Sender<(S, T)>,
    sealed: Arc<AtomicBool>,
}

impl<S: Clone, T> Clone for MessageSink<S, T> {
    fn clone(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            tx: self.tx.clone(),
            sealed: self.sealed.clone(),
        }
    }
}

impl<S: Clone, T> MessageSink<S, T> {
    pub fn new(identity: S, tx: mpsc::Sender<(S, T)>) -> Self {
        Self {
            identity,
            tx,
            sealed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Enqueues a message, waiting for a slot under backpressure.
    ///
    /// A send racing with `seal` either delivers or returns `Sealed`,
    /// never both; a send started after `seal` returned always fails.
    pub async fn send(&self, message: T) -> Result<(), SendError<T>> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(SendError::Sealed(message));
        }
        self.tx
            .send((self.identity.clone(), message))
            .await
            .map_err(|e| SendError::Sealed(e.0 .1))
    }

    /// Enqueues a message without waiting; returns `Full` when the channel
    /// is at capacity, leaving state untouched.
    pub fn try_send(&self, message: T) -> Result<(), SendError<T>> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(SendError::Sealed(message));
        }
        self.tx
            .try_send((self.identity.clone(), message))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full((_, m)) => SendError::Full(m),
                mpsc::error::TrySendError::Closed((_, m)) => SendError::Sealed(m),
            })
    }

    /// Seals the sink. Idempotent. Already-enqueued messages stay
    /// receivable; only new sends are refused.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }
}

/// The single-consumer receive end.
pub struct SinkReceiver<S, T> {
    rx: mpsc::Receiver<(S, T)>,
}

impl<S, T> SinkReceiver<S, T> {
    /// Receives the next `(sender identity, payload)` pair, or `None` once
    /// every sender is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<(S, T)> {
        self.rx.recv().await
    }

    /// Closes the receive end and drains everything still queued, so the
    /// owner can re-route messages a producer managed to enqueue before the
    /// close. Sends after this fail with `Sealed`.
    pub fn close(&mut self) -> Vec<(S, T)> {
        self.rx.close();
        let mut drained = Vec::new();
        while let Ok(pair) = self.rx.try_recv() {
            drained.push(pair);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_carries_identity() {
        let (tx, mut rx) = channel::<&str, u32>(4);
        let sink = MessageSink::new("peer-a", tx);
        sink.send(7).await.unwrap();
        assert_eq!(rx.recv().await, Some(("peer-a", 7)));
    }

    #[tokio::test]
    async fn test_seal_refuses_new_sends_keeps_queued() {
        let (tx, mut rx) = channel::<&str, u32>(4);
        let sink = MessageSink::new("peer-a", tx);
        sink.send(1).await.unwrap();
        sink.seal();
        // Idempotent.
        sink.seal();
        assert!(sink.is_sealed());
        assert!(matches!(sink.send(2).await, Err(SendError::Sealed(2))));
        assert!(matches!(sink.try_send(3), Err(SendError::Sealed(3))));
        // The message enqueued before the seal is still deliverable.
        assert_eq!(rx.recv().await, Some(("peer-a", 1)));
    }

    #[tokio::test]
    async fn test_seal_is_per_sink_not_per_channel() {
        let (tx, mut rx) = channel::<&str, u32>(4);
        let a = MessageSink::new("a", tx.clone());
        let b = MessageSink::new("b", tx);
        a.seal();
        assert!(matches!(a.try_send(1), Err(SendError::Sealed(_))));
        b.try_send(2).unwrap();
        assert_eq!(rx.recv().await, Some(("b", 2)));
    }

    #[tokio::test]
    async fn test_clone_shares_seal_flag() {
        let (tx, _rx) = channel::<&str, u32>(4);
        let a = MessageSink::new("a", tx);
        let a2 = a.clone();
        a2.seal();
        assert!(a.is_sealed());
    }

    #[tokio::test]
    async fn test_try_send_full_does_not_mutate() {
        let (tx, mut rx) = channel::<&str, u32>(1);
        let sink = MessageSink::new("a", tx);
        sink.try_send(1).unwrap();
        assert!(matches!(sink.try_send(2), Err(SendError::Full(2))));
        assert_eq!(rx.recv().await, Some(("a", 1)));
        // The failed send left nothing behind.
        sink.try_send(3).unwrap();
        assert_eq!(rx.recv().await, Some(("a", 3)));
    }

    #[tokio::test]
    async fn test_close_drains_pending_and_seals_channel() {
        let (tx, mut rx) = channel::<&str, u32>(8);
        let sink = MessageSink::new("a", tx);
        sink.send(1).await.unwrap();
        sink.send(2).await.unwrap();
        let drained = rx.close();
        assert_eq!(drained, vec![("a", 1), ("a", 2)]);
        assert!(matches!(sink.try_send(3), Err(SendError::Sealed(3))));
        assert!(matches!(sink.send(4).await, Err(SendError::Sealed(4))));
    }

    #[tokio::test]
    async fn test_send_error_into_inner() {
        let (tx, _rx) = channel::<&str, String>(1);
        let sink = MessageSink::new("a", tx);
        sink.seal();
        let err = sink.try_send("hello".to_string()).unwrap_err();
        assert_eq!(err.into_inner(), "hello");
    }
}
