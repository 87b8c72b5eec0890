//! Stream reactors: one per open server-streaming RPC.
//!
//! A reactor owns the dispatcher task that drives its stream. Each message
//! is handed to the sink while the listener is active; a failed read, a
//! peer close, or a cancellation finishes the reactor. On finish the
//! reactor notifies its owning subscription through a weak back-reference
//! so the subscription drops its pointer, the only mechanism that keeps
//! subscription-to-reactor edges from dangling after server-driven
//! teardown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::service::PacketStream;

/// Process-unique identity for a reactor, used for association teardown in
/// place of pointer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ReactorId(u64);

/// Allocate an id. Shared with the wireless session, which participates in
/// the same association protocol without being a `StreamReactor`.
pub(crate) fn next_reactor_id() -> ReactorId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    ReactorId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Teardown notification capability held weakly by every reactor.
///
/// `clear_association` must drop whatever pointer the owner keeps for the
/// given reactor and report whether one was found. The reactor outlives the
/// notification it issues.
pub(crate) trait ReactorAssociation: Send + Sync {
    fn clear_association(&self, reactor: ReactorId) -> bool;
}

/// Wraps one open server-streaming RPC.
///
/// Lifecycle: spawned running, finishes on peer close, stream error, or
/// [`cancel`](Self::cancel). `cancel` returns only after the dispatcher
/// task has exited, so no sink delivery can happen after it returns.
/// Owners must not hold any core lock across `cancel().await`: remove the
/// reactor from the owning map first, then await.
pub(crate) struct StreamReactor {
    id: ReactorId,
    name: &'static str,
    listener_active: AtomicBool,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl StreamReactor {
    /// Spawn the dispatcher task for `stream`, delivering messages to
    /// `sink`. `association` is notified when the reactor finishes for any
    /// reason.
    pub(crate) fn spawn<M>(
        name: &'static str,
        stream: PacketStream<M>,
        sink: impl Fn(M) + Send + 'static,
        association: Weak<dyn ReactorAssociation>,
    ) -> Arc<StreamReactor>
    where
        M: Send + 'static,
    {
        let (done_tx, done_rx) = watch::channel(false);
        let reactor = Arc::new(StreamReactor {
            id: next_reactor_id(),
            name,
            listener_active: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            done: done_rx,
        });

        let task_reactor = Arc::clone(&reactor);
        tokio::spawn(async move {
            task_reactor.run(stream, sink, association, done_tx).await;
        });

        reactor
    }

    pub(crate) fn id(&self) -> ReactorId {
        self.id
    }

    /// Stop sink delivery and tear the stream down. Returns once the
    /// dispatcher task has finished and the association has been notified.
    pub(crate) async fn cancel(&self) {
        self.listener_active.store(false, Ordering::Release);
        self.cancel.cancel();

        let mut done = self.done.clone();
        // An Err here means the task is already gone; either way it is
        // finished.
        let _ = done.wait_for(|finished| *finished).await;
    }

    async fn run<M>(
        &self,
        mut stream: PacketStream<M>,
        sink: impl Fn(M) + Send,
        association: Weak<dyn ReactorAssociation>,
        done_tx: watch::Sender<bool>,
    ) where
        M: Send,
    {
        debug!(stream = self.name, reactor = self.id.0, "stream open");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(stream = self.name, reactor = self.id.0, "stream cancelled");
                    break;
                }
                item = stream.next() => match item {
                    Some(Ok(message)) => {
                        if self.listener_active.load(Ordering::Acquire) {
                            sink(message);
                        }
                    }
                    Some(Err(error)) => {
                        warn!(stream = self.name, reactor = self.id.0, %error, "stream failed");
                        break;
                    }
                    None => {
                        debug!(stream = self.name, reactor = self.id.0, "stream ended by peer");
                        break;
                    }
                }
            }
        }

        self.listener_active.store(false, Ordering::Release);
        if let Some(owner) = association.upgrade() {
            owner.clear_association(self.id);
        }
        let _ = done_tx.send(true);
    }
}
