pub mod local;
pub mod queue;

pub use local::{LocalScheduler, SchedulerMessage};
pub use queue::TriggerQueue;
