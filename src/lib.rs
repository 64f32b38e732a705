//! Kiln: the turn runtime of a coding assistant.
//!
//! A turn drives one assistant message from a streamed model response through
//! tool execution, permission checks, retries and persistence. The pieces:
//!
//! - [`id`]: sortable, prefixed identifiers.
//! - [`bus`]: typed in-process publish/subscribe.
//! - [`lock`]: per-key readers/writer lock with writer priority.
//! - [`permission`]: wildcard rulesets and interactive approval.
//! - [`tools`]: the tool contract, output truncation, batch execution and patches.
//! - [`turn`]: the stream processor, retry loop and doom-loop guard.
//! - [`patch`]: parsing and applying the `*** Begin Patch` format.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use kiln::prelude::*;
//!
//! # async fn example(model: Arc<dyn ModelStream>) -> kiln::error::Result<()> {
//! let config = KilnConfig::global();
//! let bus = EventBus::new();
//! let store = Arc::new(StorageSessionStore::new(Storage::new(&config.data_dir), bus.clone()));
//! let registry = Arc::new(ToolRegistry::new(config.truncator()).with_tool(Arc::new(config.batch_tool())));
//! let permissions = Arc::new(PermissionEngine::new(bus));
//!
//! let processor = TurnProcessor::new(model, registry, permissions, store)
//!     .with_ruleset(config.ruleset())
//!     .with_settings(config.turn_settings());
//! let request = TurnRequest::new(kiln::id::ascending(IdPrefix::Session), vec![ModelMessage::user("Hello!")]);
//! let result = processor.process(request, Default::default()).await;
//! println!("{}", result.outcome);
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod id;
pub mod lock;
pub mod model;
pub mod patch;
pub mod permission;
pub mod prelude;
pub mod session;
pub mod storage;
pub mod tools;
pub mod turn;
