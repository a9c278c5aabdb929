//! The authoritative role: owns the sensor hardware and the session.

pub mod handler;
pub mod hardware;
pub mod mirror;
pub mod scripted;
pub mod session;
pub mod state;

pub use handler::WatchCommandHandler;
pub use hardware::{FinalizedWorkout, HardwareEvent, SensorSample, WorkoutConfiguration, WorkoutHardware};
pub use mirror::SessionMirror;
pub use scripted::ScriptedHardware;
pub use session::{SensorSession, SessionEvent};
pub use state::WorkoutSessionState;
