//! # Run State
//!
//! The run record and its phase machine. Status moves strictly forward,
//! Pending -> Drafting -> Reflecting -> Synthesizing -> Completed, and any
//! phase can drop to Failed; no transition ever leaves a terminal status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bias::BiasReport;
use crate::ids::new_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Drafting,
    Reflecting,
    Synthesizing,
    Completed,
    Failed,
}

impl RunStatus {
    /// The next phase in the forward order. Terminal statuses stay put.
    pub fn advance(&self) -> RunStatus {
        match self {
            RunStatus::Pending => RunStatus::Drafting,
            RunStatus::Drafting => RunStatus::Reflecting,
            RunStatus::Reflecting => RunStatus::Synthesizing,
            RunStatus::Synthesizing => RunStatus::Completed,
            RunStatus::Completed => RunStatus::Completed,
            RunStatus::Failed => RunStatus::Failed,
        }
    }

    /// Drop to Failed, unless already completed.
    pub fn fail(&self) -> RunStatus {
        match self {
            RunStatus::Completed => RunStatus::Completed,
            _ => RunStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Drafting => "drafting",
            RunStatus::Reflecting => "reflecting",
            RunStatus::Synthesizing => "synthesizing",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

/// One coordination run over a topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub topic: String,
    pub status: RunStatus,
    /// Ids of the agents selected for this run.
    pub agents: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Run {
    pub fn new(topic: &str, agents: Vec<String>) -> Self {
        Self {
            id: new_id("run"),
            topic: topic.to_string(),
            status: RunStatus::Pending,
            agents,
            created_at: Utc::now(),
            error: None,
        }
    }
}

/// A specialist's draft contribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memo {
    pub id: String,
    pub run_id: String,
    pub agent_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Attached once by the scoring pass, immutable afterwards.
    #[serde(default)]
    pub bias: Option<BiasReport>,
}

impl Memo {
    pub fn new(run_id: &str, agent_id: &str, content: String) -> Self {
        Self {
            id: new_id("memo"),
            run_id: run_id.to_string(),
            agent_id: agent_id.to_string(),
            content,
            created_at: Utc::now(),
            bias: None,
        }
    }

    /// Attach the bias report. The first report wins; later calls are no-ops.
    pub fn attach_bias(&mut self, report: BiasReport) {
        if self.bias.is_none() {
            self.bias = Some(report);
        }
    }
}
