pub mod controller;
pub mod loopback;
pub mod transport;

pub use controller::{CommandChannel, CommandHandler, MetricsHandler, SignalHandler};
pub use loopback::LoopbackTransport;
pub use transport::{ActivationState, DeviceTransport, InboundMessage, LinkState};
