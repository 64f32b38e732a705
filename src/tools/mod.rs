//! Tool contract, invocation wrapper and the built-in tools.

pub mod apply_patch;
pub mod arguments;
pub mod batch;
pub mod registry;
pub mod tool;
pub mod truncate;
pub mod types;
pub mod validation;

pub use apply_patch::ApplyPatchTool;
pub use arguments::ToolArguments;
pub use batch::{BatchTool, CallReport, MAX_BATCH};
pub use registry::ToolRegistry;
pub use tool::{FunctionTool, PermissionCheck, Tool, ToolContext};
pub use truncate::{Direction, TruncateOptions, Truncated, Truncator};
pub use types::{ParameterBuilder, ToolOutcome, ToolOutput, ToolParameters};
