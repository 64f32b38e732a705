//! Convenience re-exports for common use.

pub use crate::bus::EventBus;
pub use crate::config::KilnConfig;
pub use crate::error::{KilnError, Result};
pub use crate::id::IdPrefix;
pub use crate::lock::FairLock;
pub use crate::model::{ModelMessage, ModelRequest, ModelStream, StreamEvent};
pub use crate::permission::{PermissionAction, PermissionEngine, PermissionRule, Reply, Ruleset};
pub use crate::session::{AssistantMessage, Part, SessionStore, StorageSessionStore};
pub use crate::storage::Storage;
pub use crate::tools::{
    ApplyPatchTool, BatchTool, FunctionTool, Tool, ToolArguments, ToolContext, ToolOutput,
    ToolParameters, ToolRegistry,
};
pub use crate::turn::{TurnOutcome, TurnProcessor, TurnRequest, TurnResult, TurnRunner};
