//! Turn engine: drives one assistant message across model round-trips.

pub mod doom_loop;
pub mod events;
pub mod processor;
pub mod retry;
pub mod runner;
pub mod types;

pub use doom_loop::ToolCallRecord;
pub use events::{AgentEvent, AgentEventSink};
pub use processor::{TurnProcessor, INTERRUPTED};
pub use retry::RetryPolicy;
pub use runner::{TurnHandle, TurnRunner};
pub use types::{TurnOutcome, TurnRequest, TurnResult, TurnSettings};
