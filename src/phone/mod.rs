//! Passive role: follows the watch's session and publishes it locally.

pub mod consumer;
pub mod daily_steps;
pub mod live_status;
pub mod shadow;

pub use consumer::{ConsumerDeps, ConsumerEvent, EndReason, MirroredSessionConsumer};
pub use daily_steps::DailyStepTracker;
pub use live_status::{
    DismissalPolicy, LiveStatusAttributes, LiveStatusContent, LiveStatusHandle,
    LiveStatusPublisher, LiveStatusSurface, LoggingLiveStatusSurface, RecordingLiveStatusSurface,
    SurfaceCall,
};
pub use shadow::MirroredShadowState;
