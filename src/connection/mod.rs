mod attempt;
mod lifecycle;
mod registry;
mod state;

pub use attempt::AttemptSignal;
pub use lifecycle::{ConnectionLifecycle, Drain, LifecycleContext};
pub use registry::{ConnectionRegistry, StartOutcome};
pub use state::{ConnectionSnapshot, ConnectionState, StateSlot};
