pub mod reconcile;
pub mod writer;

pub use reconcile::{reconcile, Reconciler};
pub use writer::WorkoutRecordWriter;
