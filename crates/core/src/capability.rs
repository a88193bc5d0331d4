//! # Agent Capability
//!
//! The seam between the engine and whatever actually produces text. The
//! engine only ever sees this trait; model clients, scripted stand-ins, and
//! test stubs all plug in behind it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::balance::BiasProfile;
use crate::error::CapabilityError;
use crate::reflection::{ReflectionRequest, ReflectionResponse};
use crate::run::Memo;

/// Everything a specialist needs to draft its contribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftContext {
    pub run_id: String,
    pub topic: String,
    /// Angle assigned by the directory, e.g. "historical precedent".
    pub angle: String,
}

/// A draft produced by [`AgentCapability::draft`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoContent {
    pub content: String,
}

/// A critique produced by [`AgentCapability::reflect`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionContent {
    pub content: String,
    pub focus_areas: Vec<String>,
}

/// The finished document produced by [`AgentCapability::synthesize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalDocument {
    pub content: String,
    pub word_count: usize,
}

impl FinalDocument {
    pub fn new(content: String) -> Self {
        let word_count = content.split_whitespace().count();
        Self {
            content,
            word_count,
        }
    }
}

/// A pluggable agent. Implementations must be cancel-safe: the engine drops
/// the future on timeout or run cancellation.
#[async_trait]
pub trait AgentCapability: Send + Sync {
    /// Draft a memo on the topic from this agent's angle.
    async fn draft(&self, context: &DraftContext) -> Result<MemoContent, CapabilityError>;

    /// Critique another agent's memo.
    async fn reflect(
        &self,
        request: &ReflectionRequest,
    ) -> Result<ReflectionContent, CapabilityError>;

    /// Merge memos and critiques into the final document, steered by the
    /// run-level bias profile.
    async fn synthesize(
        &self,
        memos: &[Memo],
        reflections: &[ReflectionResponse],
        profile: &BiasProfile,
    ) -> Result<FinalDocument, CapabilityError>;
}
