//! The device-pairing transport as seen by the protocol.
//!
//! Any bidirectional low-latency link can back [`DeviceTransport`]; the
//! protocol only needs link status, activation, send-with-reply,
//! fire-and-forget send and one inbound stream.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{ChannelError, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ActivationState {
    #[default]
    NotActivated,
    Inactive,
    Activated,
}

/// Link status exposed as send preconditions.
///
/// Pairing and app installation are phone-side notions; a watch-side
/// transport reports both as `true` because its counterpart always exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkState {
    pub activation: ActivationState,
    pub is_paired: bool,
    pub is_app_installed: bool,
    pub is_reachable: bool,
}

impl Default for LinkState {
    fn default() -> Self {
        Self {
            activation: ActivationState::NotActivated,
            is_paired: false,
            is_app_installed: false,
            is_reachable: false,
        }
    }
}

impl LinkState {
    /// A fully usable link.
    pub fn connected() -> Self {
        Self {
            activation: ActivationState::Activated,
            is_paired: true,
            is_app_installed: true,
            is_reachable: true,
        }
    }

    pub fn is_activated(&self) -> bool {
        self.activation == ActivationState::Activated
    }

    /// Checks preconditions in a fixed order so the most fundamental
    /// problem is reported first.
    pub fn check(&self) -> Result<(), ChannelError> {
        if !self.is_activated() {
            return Err(ChannelError::SessionNotActivated);
        }
        if !self.is_paired {
            return Err(ChannelError::WatchNotPaired);
        }
        if !self.is_app_installed {
            return Err(ChannelError::WatchAppNotInstalled);
        }
        if !self.is_reachable {
            return Err(ChannelError::WatchNotReachable);
        }
        Ok(())
    }
}

/// One message delivered by the counterpart.
#[derive(Debug)]
pub enum InboundMessage {
    /// Fire-and-forget payload.
    Message { payload: Vec<u8> },
    /// Payload whose sender awaits exactly one reply.
    Request {
        payload: Vec<u8>,
        reply: oneshot::Sender<Vec<u8>>,
    },
}

#[async_trait]
pub trait DeviceTransport: Send + Sync + 'static {
    fn link_state(&self) -> LinkState;

    /// Stream of link status changes, starting with the current value.
    fn watch_link(&self) -> watch::Receiver<LinkState>;

    /// Requests link activation. Completes once the link is active.
    async fn activate(&self) -> Result<(), TransportError>;

    async fn send_with_reply(&self, payload: Vec<u8>) -> Result<Vec<u8>, TransportError>;

    async fn send(&self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Hands out the inbound stream. Only the first caller receives it.
    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<InboundMessage>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preconditions_report_the_first_unmet_requirement() {
        let mut state = LinkState::connected();
        assert_eq!(state.check(), Ok(()));

        state.is_reachable = false;
        assert_eq!(state.check(), Err(ChannelError::WatchNotReachable));

        state.is_app_installed = false;
        assert_eq!(state.check(), Err(ChannelError::WatchAppNotInstalled));

        state.is_paired = false;
        assert_eq!(state.check(), Err(ChannelError::WatchNotPaired));

        state.activation = ActivationState::Inactive;
        assert_eq!(state.check(), Err(ChannelError::SessionNotActivated));
    }
}
