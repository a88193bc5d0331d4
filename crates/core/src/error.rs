//! # Error Taxonomy
//!
//! Every failure mode in the engine is represented here so callers can
//! branch on classification instead of string matching.
//!
//! | Variant               | Retriable | Handling |
//! |-----------------------|-----------|----------|
//! | TransientCapability   | yes       | bounded retry with backoff |
//! | PermanentCapability   | no        | skip the agent, degrade |
//! | Validation            | no        | rejected before run creation |
//! | Timeout               | no        | forces best-effort progression |
//! | Conflict              | no        | duplicate reflection rejected as no-op |
//! | Store                 | yes       | retried; run fails if unrecoverable |

use thiserror::Error;

/// Unified error type for all engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A delegated capability call failed for a reason expected to clear on retry.
    #[error("transient capability failure [{agent_id}]: {message}")]
    TransientCapability { agent_id: String, message: String },

    /// A delegated capability call failed permanently; the agent is skipped.
    #[error("permanent capability failure [{agent_id}]: {message}")]
    PermanentCapability { agent_id: String, message: String },

    /// Input rejected before a run was created.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The run was cancelled by request.
    #[error("run cancelled")]
    Cancelled,

    /// A phase- or request-scoped deadline elapsed.
    #[error("{scope} timed out after {elapsed_ms}ms")]
    Timeout { scope: String, elapsed_ms: u64 },

    /// A non-terminal reflection request already exists for this triple.
    #[error("duplicate in-flight reflection request ({source_agent} -> {target} on memo {memo_id})")]
    Conflict {
        source_agent: String,
        target: String,
        memo_id: String,
    },

    /// The persistent store misbehaved.
    #[error("store operation failed: {0}")]
    Store(String),

    /// No run is known under this id.
    #[error("run not found: {0}")]
    RunNotFound(String),

    /// The run exists but has not completed yet.
    #[error("run {run_id} has no result yet (phase: {phase})")]
    ResultNotReady { run_id: String, phase: String },

    /// The run reached a terminal failure; the reason is human-readable.
    #[error("run failed: {0}")]
    RunFailed(String),
}

impl EngineError {
    /// Whether the engine's retry policy should attempt this again.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::TransientCapability { .. } | Self::Store(_)
        )
    }
}

/// Error surface of the `AgentCapability` seam.
///
/// Agents are external collaborators; the only thing the core needs to know
/// about a failure is whether retrying can help.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// Retry with backoff may succeed (network blip, rate limit, overload).
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying is pointless; the caller should degrade gracefully.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl CapabilityError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Lift into an [`EngineError`], naming the agent that failed.
    pub fn into_engine(self, agent_id: &str) -> EngineError {
        match self {
            Self::Transient(message) => EngineError::TransientCapability {
                agent_id: agent_id.to_string(),
                message,
            },
            Self::Permanent(message) => EngineError::PermanentCapability {
                agent_id: agent_id.to_string(),
                message,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
