use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use rand::Rng;
use tokio::{sync::Mutex, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;

use super::transport::{DeviceTransport, InboundMessage, LinkState};
use crate::{
    error::ChannelError,
    models::{WorkoutEnvironment, WorkoutKind},
    protocol::{self, CommandKind, CommandMessage, Envelope, MetricSnapshot, SessionSignal},
    settings::SyncSettings,
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// Receives control commands and produces exactly one reply for each.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle_command(&self, command: CommandMessage) -> CommandMessage;
}

#[async_trait]
pub trait MetricsHandler: Send + Sync + 'static {
    async fn handle_metrics(&self, snapshot: MetricSnapshot);
}

#[async_trait]
pub trait SignalHandler: Send + Sync + 'static {
    async fn handle_signal(&self, signal: SessionSignal);
}

#[derive(Default)]
struct Handlers {
    command: Option<Arc<dyn CommandHandler>>,
    metrics: Option<Arc<dyn MetricsHandler>>,
    signal: Option<Arc<dyn SignalHandler>>,
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    step: Duration,
    max: Duration,
}

/// Protocol layer over a [`DeviceTransport`].
///
/// Commands go out one at a time and resolve to the peer's single reply;
/// snapshots and signals are fire-and-forget. Inbound traffic is dispatched
/// in arrival order to whichever handlers this device registered.
#[derive(Clone)]
pub struct CommandChannel {
    transport: Arc<dyn DeviceTransport>,
    handlers: Arc<RwLock<Handlers>>,
    in_flight: Arc<Mutex<()>>,
    command_timeout: Duration,
    retry: RetryPolicy,
    cancel_token: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl CommandChannel {
    pub fn new(transport: Arc<dyn DeviceTransport>, settings: &SyncSettings) -> Self {
        Self {
            transport,
            handlers: Arc::new(RwLock::new(Handlers::default())),
            in_flight: Arc::new(Mutex::new(())),
            command_timeout: settings.command_timeout(),
            retry: RetryPolicy {
                step: Duration::from_millis(settings.activation_retry_step_ms.max(1)),
                max: Duration::from_millis(settings.activation_retry_max_ms.max(1)),
            },
            cancel_token: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Starts inbound dispatch and link supervision. Calling it again is a
    /// no-op because the inbound stream can only be taken once.
    pub async fn start(&self) {
        let Some(inbound) = self.transport.take_inbound() else {
            log_debug!("command channel already started");
            return;
        };

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(dispatch_loop(
            inbound,
            self.handlers.clone(),
            self.cancel_token.clone(),
        )));
        tasks.push(tokio::spawn(supervise_link(
            self.transport.clone(),
            self.retry,
            self.cancel_token.clone(),
        )));
        log_info!("command channel started");
    }

    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                log::error!("command channel task failed to join: {err}");
            }
        }
    }

    pub fn link_state(&self) -> LinkState {
        self.transport.link_state()
    }

    pub fn check_preconditions(&self) -> Result<(), ChannelError> {
        self.transport.link_state().check()
    }

    pub fn on_command_received(&self, handler: Arc<dyn CommandHandler>) {
        self.handlers_mut().command = Some(handler);
    }

    pub fn on_metrics_received(&self, handler: Arc<dyn MetricsHandler>) {
        self.handlers_mut().metrics = Some(handler);
    }

    pub fn on_session_signal(&self, handler: Arc<dyn SignalHandler>) {
        self.handlers_mut().signal = Some(handler);
    }

    fn handlers_mut(&self) -> std::sync::RwLockWriteGuard<'_, Handlers> {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sends a command and waits for its reply.
    ///
    /// An `error` reply resolves to [`ChannelError::CommandFailed`]; any
    /// other reply kind is success. Delivery failures and a missing reply
    /// within the configured timeout resolve to [`ChannelError::SendFailed`].
    pub async fn send_command(&self, command: CommandMessage) -> Result<CommandMessage, ChannelError> {
        let _in_flight = self.in_flight.lock().await;
        self.check_preconditions()?;

        let kind = command.kind;
        let payload = protocol::encode(&Envelope::Command(command))?;
        let reply = match time::timeout(self.command_timeout, self.transport.send_with_reply(payload)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                log_warn!("command {kind:?} was not delivered: {err}");
                return Err(ChannelError::SendFailed(err.to_string()));
            }
            Err(_) => {
                log_warn!(
                    "command {kind:?} got no reply within {} ms",
                    self.command_timeout.as_millis()
                );
                return Err(ChannelError::SendFailed(format!(
                    "no reply within {} ms",
                    self.command_timeout.as_millis()
                )));
            }
        };

        match protocol::decode(&reply)? {
            Envelope::Command(reply) if reply.kind == CommandKind::Error => {
                Err(ChannelError::CommandFailed(
                    reply
                        .error_message
                        .unwrap_or_else(|| "unknown error".to_string()),
                ))
            }
            Envelope::Command(reply) => {
                log_debug!("command {kind:?} acknowledged with {:?}", reply.kind);
                Ok(reply)
            }
            other => Err(ChannelError::Encoding(format!(
                "expected a command reply, got {other:?}"
            ))),
        }
    }

    pub async fn send_start_workout(
        &self,
        kind: WorkoutKind,
        environment: WorkoutEnvironment,
    ) -> Result<(), ChannelError> {
        self.send_command(CommandMessage::start(kind, environment))
            .await
            .map(|_| ())
    }

    pub async fn send_pause_workout(&self) -> Result<(), ChannelError> {
        self.send_command(CommandMessage::pause()).await.map(|_| ())
    }

    pub async fn send_resume_workout(&self) -> Result<(), ChannelError> {
        self.send_command(CommandMessage::resume()).await.map(|_| ())
    }

    pub async fn send_end_workout(&self) -> Result<(), ChannelError> {
        self.send_command(CommandMessage::end()).await.map(|_| ())
    }

    /// Best effort: a lost snapshot is superseded by the next one, so
    /// failures are logged and swallowed.
    pub async fn send_snapshot(&self, snapshot: MetricSnapshot) {
        if let Err(err) = self.check_preconditions() {
            log_debug!("skipping snapshot: {err}");
            return;
        }

        let payload = match protocol::encode(&Envelope::Snapshot(snapshot)) {
            Ok(payload) => payload,
            Err(err) => {
                log_warn!("failed to encode snapshot: {err}");
                return;
            }
        };

        if let Err(err) = self.transport.send(payload).await {
            log_warn!("snapshot dropped: {err}");
        }
    }

    pub async fn send_signal(&self, signal: SessionSignal) -> Result<(), ChannelError> {
        self.check_preconditions()?;
        let payload = protocol::encode(&Envelope::Signal(signal))?;
        self.transport
            .send(payload)
            .await
            .map_err(|err| ChannelError::SendFailed(err.to_string()))
    }
}

async fn dispatch_loop(
    mut inbound: tokio::sync::mpsc::UnboundedReceiver<InboundMessage>,
    handlers: Arc<RwLock<Handlers>>,
    cancel_token: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            message = inbound.recv() => message,
            _ = cancel_token.cancelled() => break,
        };
        let Some(message) = message else {
            log_info!("inbound stream closed");
            break;
        };

        match message {
            InboundMessage::Request { payload, reply } => {
                let response = handle_request(&payload, &handlers).await;
                let bytes = match protocol::encode(&Envelope::Command(response)) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        log_warn!("failed to encode reply: {err}");
                        continue;
                    }
                };
                if reply.send(bytes).is_err() {
                    log_debug!("requester went away before the reply");
                }
            }
            InboundMessage::Message { payload } => handle_message(&payload, &handlers).await,
        }
    }
}

async fn handle_request(payload: &[u8], handlers: &RwLock<Handlers>) -> CommandMessage {
    let command = match protocol::decode(payload) {
        Ok(Envelope::Command(command)) if command.kind.is_request() => command,
        Ok(other) => return CommandMessage::error(format!("unexpected request {other:?}")),
        Err(err) => return CommandMessage::error(err.to_string()),
    };

    let handler = read_handlers(handlers).command.clone();
    match handler {
        Some(handler) => handler.handle_command(command).await,
        None => CommandMessage::error("no command handler registered"),
    }
}

async fn handle_message(payload: &[u8], handlers: &RwLock<Handlers>) {
    match protocol::decode(payload) {
        Ok(Envelope::Snapshot(snapshot)) => {
            let handler = read_handlers(handlers).metrics.clone();
            match handler {
                Some(handler) => handler.handle_metrics(snapshot).await,
                None => log_debug!("snapshot received with no metrics handler"),
            }
        }
        Ok(Envelope::Signal(signal)) => {
            let handler = read_handlers(handlers).signal.clone();
            match handler {
                Some(handler) => handler.handle_signal(signal).await,
                None => log_debug!("signal received with no signal handler"),
            }
        }
        Ok(Envelope::Command(command)) => {
            log_warn!("ignoring {:?} command sent without a reply handle", command.kind);
        }
        Err(err) => log_warn!("dropping malformed message: {err}"),
    }
}

fn read_handlers(handlers: &RwLock<Handlers>) -> std::sync::RwLockReadGuard<'_, Handlers> {
    handlers
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Re-requests activation whenever the link drops out of the activated
/// state. Nothing about in-flight commands is carried across.
async fn supervise_link(
    transport: Arc<dyn DeviceTransport>,
    retry: RetryPolicy,
    cancel_token: CancellationToken,
) {
    let mut link = transport.watch_link();
    loop {
        let activated = link.borrow_and_update().is_activated();
        if !activated {
            let mut attempt: u32 = 0;
            loop {
                match transport.activate().await {
                    Ok(()) => {
                        log_info!("device link activated");
                        break;
                    }
                    Err(err) => {
                        let delay = with_jitter(activation_backoff(attempt, retry.step, retry.max), retry.step);
                        log_warn!(
                            "link activation attempt {} failed ({err}); retrying in {} ms",
                            attempt + 1,
                            delay.as_millis()
                        );
                        attempt = attempt.saturating_add(1);
                        tokio::select! {
                            _ = time::sleep(delay) => {}
                            _ = cancel_token.cancelled() => return,
                        }
                    }
                }
            }
            // activation itself changed the link; consume that update
            let _ = link.borrow_and_update();
        }

        tokio::select! {
            changed = link.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = cancel_token.cancelled() => return,
        }
    }
}

/// Exponential backoff capped at `max`.
fn activation_backoff(attempt: u32, step: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    step.saturating_mul(factor).min(max)
}

fn with_jitter(delay: Duration, step: Duration) -> Duration {
    let jitter_ms = (step.as_millis() as u64 / 2).max(1);
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
}
