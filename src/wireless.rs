//! Wireless device management over the bidirectional control stream.
//!
//! A [`WirelessManager`] is the user-facing handle. Behind it sits one bidi
//! session: outbound requests enter a FIFO and are dispatched one at a time
//! (the next request leaves only after the in-flight write completes), and
//! inbound events are translated into owned [`WirelessEvent`] values for
//! the registered callback. When the stream is not active, sends are
//! dropped with a warning; the channel monitor re-opens the session when
//! the transport recovers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::reactor::{ReactorAssociation, ReactorId};
use crate::service::WirelessStreams;
use crate::types::{WirelessEvent, WirelessRequest, WirelessRequestKind};

type WirelessEventCallback = Arc<dyn Fn(WirelessEvent) + Send + Sync>;

/// Handle for wireless pairing and power management.
///
/// Created through [`Client::create_wireless_manager`]
/// (crate::Client::create_wireless_manager); all control methods are
/// fire-and-forget; outcomes arrive as events on the registered callback.
pub struct WirelessManager {
    session: Mutex<Option<Arc<WirelessSession>>>,
    callback: RwLock<Option<WirelessEventCallback>>,
}

impl WirelessManager {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self { session: Mutex::new(None), callback: RwLock::new(None) })
    }

    /// Whether the bidi stream is currently open and accepting requests.
    pub fn is_stream_active(&self) -> bool {
        self.session.lock().as_ref().is_some_and(|s| s.is_active())
    }

    /// Register the event callback. At most one at a time; registering
    /// replaces the previous one. The callback owns each event value.
    pub fn register_wireless_event_callback(
        &self,
        callback: impl Fn(WirelessEvent) + Send + Sync + 'static,
    ) {
        *self.callback.write() = Some(Arc::new(callback));
    }

    pub fn reset_wireless_event_callback(&self) {
        *self.callback.write() = None;
    }

    pub fn enable_pairing_mode(&self) {
        self.send_request(WirelessRequest::of_kind(WirelessRequestKind::EnablePairingMode));
    }

    pub fn disable_pairing_mode(&self) {
        self.send_request(WirelessRequest::of_kind(WirelessRequestKind::DisablePairingMode));
    }

    pub fn get_pairing_approved_list(&self) {
        self.send_request(WirelessRequest::of_kind(WirelessRequestKind::GetPairingApprovedList));
    }

    pub fn approve_pairing(&self, siu_uuid: u32) {
        self.send_request(WirelessRequest::for_siu(WirelessRequestKind::ApprovePairing, siu_uuid));
    }

    pub fn deny_pairing(&self, siu_uuid: u32) {
        self.send_request(WirelessRequest::for_siu(WirelessRequestKind::DenyPairing, siu_uuid));
    }

    pub fn unpair(&self, siu_uuid: u32) {
        self.send_request(WirelessRequest::for_siu(WirelessRequestKind::Unpair, siu_uuid));
    }

    pub fn get_pairing_blocked_list(&self) {
        self.send_request(WirelessRequest::of_kind(WirelessRequestKind::GetPairingBlockedList));
    }

    pub fn block_pairing(&self, siu_uuid: u32) {
        self.send_request(WirelessRequest::for_siu(WirelessRequestKind::BlockPairing, siu_uuid));
    }

    pub fn unblock_pairing(&self, siu_uuid: u32) {
        self.send_request(WirelessRequest::for_siu(WirelessRequestKind::UnblockPairing, siu_uuid));
    }

    pub fn clear_blocked_list(&self) {
        self.send_request(WirelessRequest::of_kind(WirelessRequestKind::ClearBlockedList));
    }

    pub fn clear_approved_list(&self) {
        self.send_request(WirelessRequest::of_kind(WirelessRequestKind::ClearApprovedList));
    }

    pub fn reset_wireless_config(&self) {
        self.send_request(WirelessRequest::of_kind(WirelessRequestKind::ResetWirelessConfig));
    }

    pub fn set_interval_length(&self, interval_length: u32) {
        self.send_request(WirelessRequest {
            kind: WirelessRequestKind::SetIntervalLength,
            interval_length,
            ..Default::default()
        });
    }

    pub fn approve_interval_pairing(&self, siu_uuid: u32) {
        self.send_request(WirelessRequest::for_siu(
            WirelessRequestKind::ApproveIntervalPairing,
            siu_uuid,
        ));
    }

    pub fn sleep_device(&self, siu_uuid: u32) {
        self.send_request(WirelessRequest::for_siu(WirelessRequestKind::SleepDevice, siu_uuid));
    }

    pub fn wake_device(&self, siu_uuid: u32) {
        self.send_request(WirelessRequest::for_siu(WirelessRequestKind::WakeDevice, siu_uuid));
    }

    pub fn get_pairing_approved_interval_list(&self) {
        self.send_request(WirelessRequest::of_kind(
            WirelessRequestKind::GetPairingApprovedIntervalList,
        ));
    }

    fn send_request(&self, request: WirelessRequest) {
        let session = self.session.lock();
        match session.as_ref() {
            Some(session) if session.is_active() => session.enqueue(request),
            _ => {
                warn!(kind = ?request.kind, "dropping wireless request: stream not active");
            }
        }
    }

    fn deliver_event(&self, event: WirelessEvent) {
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    /// Open a new session over freshly opened bidi streams, replacing any
    /// previous (necessarily inactive) one.
    pub(crate) fn attach_session(self: &Arc<Self>, streams: WirelessStreams) {
        let session = WirelessSession::spawn(Arc::downgrade(self), streams);
        *self.session.lock() = Some(session);
    }

    /// Detach the session for out-of-lock cancellation.
    pub(crate) fn take_session(&self) -> Option<Arc<WirelessSession>> {
        self.session.lock().take()
    }
}

impl ReactorAssociation for WirelessManager {
    fn clear_association(&self, reactor: ReactorId) -> bool {
        let mut session = self.session.lock();
        if session.as_ref().is_some_and(|s| s.id == reactor) {
            *session = None;
            debug!("wireless session detached after finish");
            return true;
        }
        false
    }
}

/// One open bidi stream: the outbound FIFO plus the inbound event loop.
pub(crate) struct WirelessSession {
    id: ReactorId,
    active: Arc<AtomicBool>,
    queue: mpsc::UnboundedSender<WirelessRequest>,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl WirelessSession {
    fn spawn(manager: Weak<WirelessManager>, streams: WirelessStreams) -> Arc<Self> {
        let WirelessStreams { requests, events } = streams;
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let active = Arc::new(AtomicBool::new(true));

        let session = Arc::new(Self {
            id: crate::reactor::next_reactor_id(),
            active: Arc::clone(&active),
            queue: queue_tx,
            cancel: cancel.clone(),
            done: done_rx,
        });

        let id = session.id;
        tokio::spawn(async move {
            let writer = tokio::spawn(Self::write_loop(
                queue_rx,
                requests,
                cancel.clone(),
                Arc::clone(&active),
            ));

            Self::read_loop(events, manager.clone(), cancel.clone(), Arc::clone(&active)).await;

            // Stop the writer before notifying the owner so no request can
            // go out for a session the owner no longer references.
            active.store(false, Ordering::Release);
            cancel.cancel();
            let _ = writer.await;

            if let Some(owner) = manager.upgrade() {
                owner.clear_association(id);
            }
            let _ = done_tx.send(true);
        });

        session
    }

    /// Append a request to the FIFO. The write loop dispatches the head
    /// once no write is in flight.
    fn enqueue(&self, request: WirelessRequest) {
        if self.queue.send(request).is_err() {
            warn!("wireless session ended before the request was dispatched");
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Tear the session down; returns after both loops have exited.
    pub(crate) async fn cancel(&self) {
        self.active.store(false, Ordering::Release);
        self.cancel.cancel();
        let mut done = self.done.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }

    async fn write_loop(
        mut queue: mpsc::UnboundedReceiver<WirelessRequest>,
        requests: mpsc::Sender<WirelessRequest>,
        cancel: CancellationToken,
        active: Arc<AtomicBool>,
    ) {
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                request = queue.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            // The transport sender holds a single slot; this send completes
            // only once the previous write has been taken off the wire.
            let sent = tokio::select! {
                _ = cancel.cancelled() => break,
                sent = requests.send(request) => sent,
            };
            if sent.is_err() {
                warn!("failed to send a wireless management request");
                active.store(false, Ordering::Release);
                cancel.cancel();
                break;
            }
        }
    }

    async fn read_loop(
        mut events: crate::service::PacketStream<WirelessEvent>,
        manager: Weak<WirelessManager>,
        cancel: CancellationToken,
        active: Arc<AtomicBool>,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.next() => match event {
                    Some(Ok(event)) => {
                        if active.load(Ordering::Acquire) {
                            if let Some(owner) = manager.upgrade() {
                                owner.deliver_event(event);
                            }
                        }
                    }
                    Some(Err(error)) => {
                        warn!(%error, "wireless management stream failed");
                        break;
                    }
                    None => {
                        debug!("wireless management stream ended by peer");
                        break;
                    }
                }
            }
        }
    }
}
