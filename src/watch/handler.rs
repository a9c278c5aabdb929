use async_trait::async_trait;
use log::{info, warn};

use super::session::SensorSession;
use crate::{
    channel::CommandHandler,
    error::SessionError,
    models::WorkoutEnvironment,
    protocol::{CommandKind, CommandMessage},
};

/// Answers phone commands by driving the local sensor session.
///
/// Every request gets exactly one reply: `workoutStarted` for accepted
/// start/pause/resume, `workoutEnded` for an accepted end, `error` otherwise.
pub struct WatchCommandHandler {
    session: SensorSession,
}

impl WatchCommandHandler {
    pub fn new(session: SensorSession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl CommandHandler for WatchCommandHandler {
    async fn handle_command(&self, command: CommandMessage) -> CommandMessage {
        info!("Watch received {:?} command", command.kind);

        match command.kind {
            CommandKind::StartWorkout => {
                let Some(workout_kind) = command.workout_kind else {
                    return CommandMessage::error("start command is missing the workout kind");
                };
                let environment = command.environment.unwrap_or(WorkoutEnvironment::Outdoor);
                match self.session.start(workout_kind, environment).await {
                    Ok(()) => CommandMessage::started(),
                    Err(err) => reject(err),
                }
            }
            CommandKind::PauseWorkout | CommandKind::ResumeWorkout => {
                if !self.session.status().await.is_active() {
                    return reject(SessionError::NoActiveSession);
                }
                if command.kind == CommandKind::PauseWorkout {
                    self.session.pause().await;
                } else {
                    self.session.resume().await;
                }
                CommandMessage::started()
            }
            CommandKind::EndWorkout => match self.session.end().await {
                Ok(_) => CommandMessage::ended(),
                Err(err) => reject(err),
            },
            CommandKind::WorkoutStarted | CommandKind::WorkoutEnded | CommandKind::Error => {
                CommandMessage::error(format!("{:?} is not a request", command.kind))
            }
        }
    }
}

fn reject(err: SessionError) -> CommandMessage {
    warn!("Watch rejected command: {err}");
    CommandMessage::error(err.to_string())
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        clock::system_clock,
        models::{WorkoutKind, WorkoutStatus},
        watch::scripted::ScriptedHardware,
    };

    fn handler() -> (WatchCommandHandler, SensorSession) {
        let session = SensorSession::new(
            Arc::new(ScriptedHardware::new()),
            system_clock(),
            Duration::from_secs(1),
        );
        (WatchCommandHandler::new(session.clone()), session)
    }

    #[tokio::test]
    async fn start_then_end_is_acknowledged() {
        let (handler, session) = handler();

        let reply = handler
            .handle_command(CommandMessage::start(WorkoutKind::Running, WorkoutEnvironment::Indoor))
            .await;
        assert_eq!(reply.kind, CommandKind::WorkoutStarted);
        assert_eq!(session.status().await, WorkoutStatus::Running);

        let reply = handler.handle_command(CommandMessage::pause()).await;
        assert_eq!(reply.kind, CommandKind::WorkoutStarted);
        assert_eq!(session.status().await, WorkoutStatus::Paused);

        let reply = handler.handle_command(CommandMessage::end()).await;
        assert_eq!(reply.kind, CommandKind::WorkoutEnded);
        assert_eq!(session.status().await, WorkoutStatus::Ended);
    }

    #[tokio::test]
    async fn second_start_is_an_error_reply() {
        let (handler, _session) = handler();
        handler
            .handle_command(CommandMessage::start(WorkoutKind::Walking, WorkoutEnvironment::Outdoor))
            .await;

        let reply = handler
            .handle_command(CommandMessage::start(WorkoutKind::Running, WorkoutEnvironment::Outdoor))
            .await;
        assert_eq!(reply.kind, CommandKind::Error);
        assert_eq!(
            reply.error_message,
            Some(SessionError::AlreadyActive.to_string())
        );
    }

    #[tokio::test]
    async fn commands_without_session_are_rejected() {
        let (handler, _session) = handler();
        for command in [CommandMessage::pause(), CommandMessage::resume(), CommandMessage::end()] {
            let reply = handler.handle_command(command).await;
            assert_eq!(reply.kind, CommandKind::Error);
        }
    }
}
