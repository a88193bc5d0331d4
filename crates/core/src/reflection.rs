//! # Reflection Tracker
//!
//! Lifecycle and admission control for cross-agent critique requests. Every
//! request moves Pending -> InProgress -> terminal (Completed, Skipped, or
//! Failed); admission is priority-ordered with FIFO tie-breaking, capped by a
//! global in-flight limit, and never lets one reviewer hold two in-flight
//! requests for the same run. Timed-out requests are recycled back to Pending
//! until their attempt budget is spent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::bias::BiasReport;
use crate::error::{EngineError, Result};
use crate::ids::new_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Skipped | RequestStatus::Failed
        )
    }
}

/// A request for one agent to critique another agent's memo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionRequest {
    pub id: String,
    pub run_id: String,
    pub memo_id: String,
    pub source_agent_id: String,
    pub target_agent_id: String,
    /// Memo text under review.
    pub content: String,
    /// Framing instruction for the reviewer.
    pub prompt: String,
    pub priority: ReflectionPriority,
    pub status: RequestStatus,
    pub attempt_count: u32,
    /// Enqueue order, the FIFO tie-breaker within a priority class.
    pub seq: u64,
    #[serde(skip)]
    deadline: Option<Instant>,
}

/// A reviewer's critique of a memo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionResponse {
    pub request_id: String,
    pub run_id: String,
    pub memo_id: String,
    pub agent_id: String,
    pub content: String,
    /// Reviewer quality weight from the directory, 0.0 to 1.0.
    pub quality: f64,
    pub focus_areas: Vec<String>,
    #[serde(default)]
    pub bias: Option<BiasReport>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of delivering a response to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    /// The request already holds a response; the stored one is kept.
    DuplicateDiscarded,
    /// The request is unknown, not in progress, or from the wrong agent.
    StaleDiscarded,
}

/// Per-run lifecycle counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectionStats {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct ReflectionTracker {
    max_in_flight: usize,
    timeout: Duration,
    max_attempts: u32,
    requests: HashMap<String, ReflectionRequest>,
    responses: HashMap<String, ReflectionResponse>,
    in_flight: AtomicUsize,
    next_seq: u64,
}

impl ReflectionTracker {
    pub fn new(max_in_flight: usize, timeout: Duration, max_attempts: u32) -> Self {
        Self {
            max_in_flight: max_in_flight.max(1),
            timeout,
            max_attempts: max_attempts.max(1),
            requests: HashMap::new(),
            responses: HashMap::new(),
            in_flight: AtomicUsize::new(0),
            next_seq: 0,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Register a new request. At most one live request may exist per
    /// (run, memo, reviewer) triple; a second enqueue while the first is not
    /// terminal is a conflict.
    pub fn enqueue(
        &mut self,
        run_id: &str,
        memo_id: &str,
        source_agent_id: &str,
        target_agent_id: &str,
        content: &str,
        prompt: &str,
        priority: ReflectionPriority,
    ) -> Result<ReflectionRequest> {
        let duplicate = self.requests.values().any(|r| {
            r.run_id == run_id
                && r.memo_id == memo_id
                && r.target_agent_id == target_agent_id
                && !r.status.is_terminal()
        });
        if duplicate {
            return Err(EngineError::Conflict {
                source_agent: source_agent_id.to_string(),
                target: target_agent_id.to_string(),
                memo_id: memo_id.to_string(),
            });
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let request = ReflectionRequest {
            id: new_id("refl"),
            run_id: run_id.to_string(),
            memo_id: memo_id.to_string(),
            source_agent_id: source_agent_id.to_string(),
            target_agent_id: target_agent_id.to_string(),
            content: content.to_string(),
            prompt: prompt.to_string(),
            priority,
            status: RequestStatus::Pending,
            attempt_count: 0,
            seq,
            deadline: None,
        };
        self.requests.insert(request.id.clone(), request.clone());
        Ok(request)
    }

    /// Admit the next pending request for the run, if capacity allows.
    ///
    /// Selection is highest priority first, then enqueue order. A reviewer
    /// with a request already in progress for this run is passed over so one
    /// slow agent cannot hold two slots.
    pub fn admit_next(&mut self, run_id: &str) -> Option<ReflectionRequest> {
        if self.in_flight.load(Ordering::Relaxed) >= self.max_in_flight {
            return None;
        }

        let busy: Vec<String> = self
            .requests
            .values()
            .filter(|r| r.run_id == run_id && r.status == RequestStatus::InProgress)
            .map(|r| r.target_agent_id.clone())
            .collect();

        let next_id = self
            .requests
            .values()
            .filter(|r| {
                r.run_id == run_id
                    && r.status == RequestStatus::Pending
                    && !busy.contains(&r.target_agent_id)
            })
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(b.seq.cmp(&a.seq))
            })
            .map(|r| r.id.clone())?;

        let request = self.requests.get_mut(&next_id)?;
        request.status = RequestStatus::InProgress;
        request.attempt_count += 1;
        request.deadline = Some(Instant::now() + self.timeout);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        Some(request.clone())
    }

    /// Record a reviewer's response. Only the in-progress request from the
    /// expected reviewer, for the attempt that was actually admitted, is
    /// accepted; everything else is discarded without touching stored
    /// content. The attempt check keeps a worker from a timed-out admission
    /// from completing the attempt that superseded it.
    pub fn deliver(&mut self, response: ReflectionResponse, attempt: u32) -> Delivery {
        let Some(request) = self.requests.get_mut(&response.request_id) else {
            return Delivery::StaleDiscarded;
        };
        if request.status == RequestStatus::Completed {
            return Delivery::DuplicateDiscarded;
        }
        if request.status != RequestStatus::InProgress
            || request.target_agent_id != response.agent_id
            || request.attempt_count != attempt
        {
            return Delivery::StaleDiscarded;
        }

        request.status = RequestStatus::Completed;
        request.deadline = None;
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.responses.insert(response.request_id.clone(), response);
        Delivery::Accepted
    }

    /// Expire in-progress requests past their deadline. Each expired request
    /// goes back to Pending, or to Failed once its attempt budget is spent.
    /// Returns the affected requests.
    pub fn sweep(&mut self, run_id: &str) -> Vec<ReflectionRequest> {
        let now = Instant::now();
        let mut expired = Vec::new();
        for request in self.requests.values_mut() {
            if request.run_id != run_id || request.status != RequestStatus::InProgress {
                continue;
            }
            let Some(deadline) = request.deadline else {
                continue;
            };
            if now < deadline {
                continue;
            }

            request.deadline = None;
            if request.attempt_count >= self.max_attempts {
                request.status = RequestStatus::Failed;
                tracing::warn!(
                    "Reflection {} for memo {} failed after {} attempts",
                    request.id,
                    request.memo_id,
                    request.attempt_count
                );
            } else {
                request.status = RequestStatus::Pending;
            }
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
            expired.push(request.clone());
        }
        expired
    }

    /// Return an in-progress request after a reviewer call error. Transient
    /// errors recycle the request to Pending while attempts remain; permanent
    /// errors (or a spent budget) fail it. Outcomes from a superseded attempt
    /// (the sweep already recycled and re-admitted the request) are ignored
    /// so they cannot free a slot the live attempt still holds. Returns the
    /// current status.
    pub fn release(
        &mut self,
        request_id: &str,
        attempt: u32,
        transient: bool,
    ) -> Option<RequestStatus> {
        let request = self.requests.get_mut(request_id)?;
        if request.status != RequestStatus::InProgress || request.attempt_count != attempt {
            return Some(request.status);
        }
        request.deadline = None;
        request.status = if transient && request.attempt_count < self.max_attempts {
            RequestStatus::Pending
        } else {
            RequestStatus::Failed
        };
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        Some(request.status)
    }

    /// Skip every pending request for the run, typically at the phase
    /// deadline. In-progress requests are left to finish or time out.
    pub fn skip_pending(&mut self, run_id: &str) -> Vec<ReflectionRequest> {
        let mut skipped = Vec::new();
        for request in self.requests.values_mut() {
            if request.run_id == run_id && request.status == RequestStatus::Pending {
                request.status = RequestStatus::Skipped;
                skipped.push(request.clone());
            }
        }
        skipped
    }

    /// Skip in-progress requests whose workers were detached, freeing their
    /// admission slots. A detached call may still finish; its outcome then
    /// targets a request that is no longer in progress and is discarded.
    pub fn abandon_in_progress(&mut self, run_id: &str) -> Vec<ReflectionRequest> {
        let mut abandoned = Vec::new();
        for request in self.requests.values_mut() {
            if request.run_id == run_id && request.status == RequestStatus::InProgress {
                request.status = RequestStatus::Skipped;
                request.deadline = None;
                self.in_flight.fetch_sub(1, Ordering::Relaxed);
                abandoned.push(request.clone());
            }
        }
        abandoned
    }

    pub fn stats(&self, run_id: &str) -> ReflectionStats {
        let mut stats = ReflectionStats::default();
        for request in self.requests.values() {
            if request.run_id != run_id {
                continue;
            }
            stats.total += 1;
            match request.status {
                RequestStatus::Pending => stats.pending += 1,
                RequestStatus::InProgress => stats.in_progress += 1,
                RequestStatus::Completed => stats.completed += 1,
                RequestStatus::Skipped => stats.skipped += 1,
                RequestStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// True once every request for the run has reached a terminal status.
    pub fn all_terminal(&self, run_id: &str) -> bool {
        self.requests
            .values()
            .filter(|r| r.run_id == run_id)
            .all(|r| r.status.is_terminal())
    }

    /// Accepted responses for the run, in request enqueue order.
    pub fn responses_for_run(&self, run_id: &str) -> Vec<ReflectionResponse> {
        let mut pairs: Vec<(u64, ReflectionResponse)> = self
            .responses
            .values()
            .filter(|resp| resp.run_id == run_id)
            .map(|resp| {
                let seq = self
                    .requests
                    .get(&resp.request_id)
                    .map(|r| r.seq)
                    .unwrap_or(u64::MAX);
                (seq, resp.clone())
            })
            .collect();
        pairs.sort_by_key(|(seq, _)| *seq);
        pairs.into_iter().map(|(_, resp)| resp).collect()
    }

    /// Drop all state for a run.
    pub fn clear_run(&mut self, run_id: &str) {
        let ids: Vec<String> = self
            .requests
            .values()
            .filter(|r| r.run_id == run_id)
            .map(|r| r.id.clone())
            .collect();
        for id in &ids {
            if let Some(request) = self.requests.get(id) {
                if request.status == RequestStatus::InProgress {
                    self.in_flight.fetch_sub(1, Ordering::Relaxed);
                }
            }
            self.requests.remove(id);
            self.responses.remove(id);
        }
    }
}
