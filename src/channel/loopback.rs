//! In-process paired transport.
//!
//! Two endpoints wired back to back. Used by the simulation binary and by
//! tests, which flip link status through the knobs below.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};

use super::transport::{ActivationState, DeviceTransport, InboundMessage, LinkState};
use crate::error::TransportError;

pub struct LoopbackTransport {
    link: watch::Sender<LinkState>,
    peer_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    activation_attempts: AtomicUsize,
    delivery_attempts: AtomicUsize,
    refuse_activation: AtomicBool,
}

impl LoopbackTransport {
    /// Returns `(phone, watch)` endpoints, both connected.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (phone_tx, phone_rx) = mpsc::unbounded_channel();
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();

        let phone = Arc::new(Self::endpoint(watch_tx, phone_rx));
        let watch = Arc::new(Self::endpoint(phone_tx, watch_rx));
        (phone, watch)
    }

    fn endpoint(
        peer_tx: mpsc::UnboundedSender<InboundMessage>,
        inbound: mpsc::UnboundedReceiver<InboundMessage>,
    ) -> Self {
        let (link, _) = watch::channel(LinkState::connected());
        Self {
            link,
            peer_tx,
            inbound: Mutex::new(Some(inbound)),
            activation_attempts: AtomicUsize::new(0),
            delivery_attempts: AtomicUsize::new(0),
            refuse_activation: AtomicBool::new(false),
        }
    }

    pub fn set_link_state(&self, state: LinkState) {
        self.link.send_replace(state);
    }

    pub fn update_link(&self, apply: impl FnOnce(&mut LinkState)) {
        self.link.send_modify(apply);
    }

    /// Simulates the OS deactivating the link (e.g. switching watches).
    pub fn deactivate(&self) {
        self.link
            .send_modify(|state| state.activation = ActivationState::Inactive);
    }

    pub fn set_refuse_activation(&self, refuse: bool) {
        self.refuse_activation.store(refuse, Ordering::SeqCst);
    }

    pub fn activation_attempts(&self) -> usize {
        self.activation_attempts.load(Ordering::SeqCst)
    }

    /// Number of sends that reached the transport, successful or not.
    pub fn delivery_attempts(&self) -> usize {
        self.delivery_attempts.load(Ordering::SeqCst)
    }

    fn ensure_deliverable(&self) -> Result<(), TransportError> {
        let state = *self.link.borrow();
        if !state.is_activated() {
            return Err(TransportError::Inactive);
        }
        if !state.is_reachable {
            return Err(TransportError::Unreachable);
        }
        Ok(())
    }
}

async fn until_inactive(mut link: watch::Receiver<LinkState>) {
    loop {
        let active = link.borrow_and_update().is_activated();
        if !active {
            return;
        }
        if link.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl DeviceTransport for LoopbackTransport {
    fn link_state(&self) -> LinkState {
        *self.link.borrow()
    }

    fn watch_link(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }

    async fn activate(&self) -> Result<(), TransportError> {
        self.activation_attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse_activation.load(Ordering::SeqCst) {
            return Err(TransportError::Inactive);
        }
        self.link
            .send_modify(|state| state.activation = ActivationState::Activated);
        Ok(())
    }

    async fn send_with_reply(&self, payload: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        self.delivery_attempts.fetch_add(1, Ordering::SeqCst);
        self.ensure_deliverable()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.peer_tx
            .send(InboundMessage::Request {
                payload,
                reply: reply_tx,
            })
            .map_err(|_| TransportError::Delivery("counterpart endpoint closed".into()))?;

        // In-flight requests fail when the link goes down underneath them.
        tokio::select! {
            reply = reply_rx => reply.map_err(|_| TransportError::NoReply),
            _ = until_inactive(self.link.subscribe()) => Err(TransportError::Inactive),
        }
    }

    async fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.delivery_attempts.fetch_add(1, Ordering::SeqCst);
        self.ensure_deliverable()?;
        self.peer_tx
            .send(InboundMessage::Message { payload })
            .map_err(|_| TransportError::Delivery("counterpart endpoint closed".into()))
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<InboundMessage>> {
        match self.inbound.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}
