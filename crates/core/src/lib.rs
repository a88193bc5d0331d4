//! # Gazette Core
//!
//! A coordination engine for multi-agent editorial runs: specialist agents
//! draft memos on a topic in parallel, cross-critique each other under
//! admission control, and an editor synthesizes the final document steered
//! by a deterministic bias profile.
//!
//! ## Architecture
//!
//! - `directory` - Specialist roster and topic-driven selection
//! - `bus` - Per-run pub/sub with bounded retained history
//! - `reflection` - Critique lifecycle and admission control
//! - `bias` / `balance` - Deterministic bias scoring and the run profile
//! - `engine` - The phase machine driving draft, reflect, and synthesize
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use gazette_core::{CapabilityDirectory, Engine, EngineConfig, MemoryStore};
//!
//! let engine = Arc::new(Engine::new(
//!     EngineConfig::default(),
//!     CapabilityDirectory::newsroom(),
//!     Arc::new(MemoryStore::new()),
//! ));
//! // engine.register_agent("editor", ...).await;
//! let run_id = engine.start_run("New tariff policy").await?;
//! ```

pub mod balance;
pub mod bias;
pub mod bus;
pub mod capability;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
mod ids;
pub mod reflection;
pub mod run;
pub mod store;

pub use balance::{
    ArticleBalancer, BiasProfile, Contribution, ContributionBias, Recommendation,
    RecommendationKind,
};
pub use bias::{BiasAxis, BiasLevel, BiasLexicon, BiasReport, MarkerHit};
pub use bus::{Message, MessageBus, MessageKind, Subscription};
pub use capability::{
    AgentCapability, DraftContext, FinalDocument, MemoContent, ReflectionContent,
};
pub use config::{EngineConfig, RetryPolicy};
pub use directory::{AgentProfile, CapabilityDirectory, PerspectiveTag};
pub use engine::{Engine, RunStatusReport};
pub use error::{CapabilityError, EngineError, Result};
pub use reflection::{
    Delivery, ReflectionPriority, ReflectionRequest, ReflectionResponse, ReflectionStats,
    ReflectionTracker, RequestStatus,
};
pub use run::{Memo, Run, RunStatus};
pub use store::{MemoryStore, RunStore};
