//! Error taxonomy for the workout session protocol.
//!
//! Kinds are deliberately granular: the presentation layer picks a different
//! remedy per kind (retry, phone-only fallback, "open the watch app"), so
//! collapsing them loses behavior. `Display` text is shown to users as-is.

use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Device channel
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("Watch connectivity session is not activated")]
    SessionNotActivated,

    #[error("No Apple Watch is paired with this iPhone")]
    WatchNotPaired,

    #[error("The watch app is not installed. Open the Watch app to install it.")]
    WatchAppNotInstalled,

    #[error("Watch is not reachable. Make sure it is nearby and unlocked.")]
    WatchNotReachable,

    #[error("Watch reported an error: {0}")]
    CommandFailed(String),

    #[error("Failed to send message to watch: {0}")]
    SendFailed(String),

    #[error("Malformed message: {0}")]
    Encoding(String),
}

impl ChannelError {
    /// Link-state errors for which a phone-only workout is the offered remedy.
    pub fn is_reachability(&self) -> bool {
        matches!(
            self,
            ChannelError::SessionNotActivated
                | ChannelError::WatchNotPaired
                | ChannelError::WatchAppNotInstalled
                | ChannelError::WatchNotReachable
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("A workout is already in progress")]
    AlreadyActive,

    #[error("No active workout session")]
    NoActiveSession,

    #[error("Workout sensors failed: {0}")]
    Hardware(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Failed to save workout: {0}")]
    Persistence(String),
}

impl From<HardwareError> for SessionError {
    fn from(err: HardwareError) -> Self {
        SessionError::Hardware(err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ports
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HardwareError {
    #[error("Workout session could not be configured: {0}")]
    Configuration(String),

    #[error("Health data access not authorized")]
    NotAuthorized,

    #[error("Workout session failed: {0}")]
    SessionFailed(String),

    #[error("Failed to finalize workout: {0}")]
    Finalization(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("link is not active")]
    Inactive,

    #[error("counterpart is not reachable")]
    Unreachable,

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("counterpart dropped the reply")]
    NoReply,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SurfaceError {
    #[error("Live Activities are disabled")]
    Disabled,

    #[error("live status request failed: {0}")]
    Request(String),

    #[error("live status call timed out after {0} ms")]
    TimedOut(u64),
}
