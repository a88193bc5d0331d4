//! # Coordination Engine
//!
//! The orchestrator that drives a run through its phases. Drafting fans out
//! to every selected specialist in parallel, reflection cross-critiques the
//! memos under the tracker's admission control, and synthesis hands
//! everything to the editor with the run-level bias profile attached. One
//! owner task per run mutates run state; everyone else observes through
//! status snapshots and the message bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{error, info, instrument, warn};

use crate::balance::{ArticleBalancer, BiasProfile, Contribution};
use crate::bias::BiasLexicon;
use crate::bus::{Message, MessageBus, MessageKind, Subscription};
use crate::capability::{AgentCapability, DraftContext, FinalDocument, ReflectionContent};
use crate::config::EngineConfig;
use crate::directory::{AgentProfile, CapabilityDirectory, PerspectiveTag};
use crate::error::{CapabilityError, EngineError, Result};
use crate::reflection::{
    Delivery, ReflectionPriority, ReflectionRequest, ReflectionResponse, ReflectionStats,
    ReflectionTracker, RequestStatus,
};
use crate::run::{Memo, Run, RunStatus};
use crate::store::{self, RunStore};

/// How often the reflection dispatch loop wakes to sweep and admit.
const DISPATCH_TICK: Duration = Duration::from_millis(50);

/// Snapshot of a run for status queries.
#[derive(Debug, Clone)]
pub struct RunStatusReport {
    pub run_id: String,
    pub topic: String,
    pub status: RunStatus,
    pub agents: Vec<String>,
    pub memo_count: usize,
    pub skipped_agents: Vec<String>,
    pub reflections: ReflectionStats,
    pub last_message: Option<String>,
    pub error: Option<String>,
}

struct RunHandle {
    run: Run,
    memo_count: usize,
    skipped_agents: Vec<String>,
    last_message: Option<String>,
    result: Option<FinalDocument>,
    cancelled: Arc<AtomicBool>,
    created: Instant,
}

pub struct Engine {
    config: EngineConfig,
    directory: CapabilityDirectory,
    agents: RwLock<HashMap<String, Arc<dyn AgentCapability>>>,
    lexicon: BiasLexicon,
    balancer: ArticleBalancer,
    bus: Arc<MessageBus>,
    store: Arc<dyn RunStore>,
    tracker: Mutex<ReflectionTracker>,
    runs: RwLock<HashMap<String, RunHandle>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        directory: CapabilityDirectory,
        store: Arc<dyn RunStore>,
    ) -> Self {
        let bus = Arc::new(MessageBus::new(config.history_capacity));
        let tracker = Mutex::new(ReflectionTracker::new(
            config.max_reflection_concurrency,
            config.reflection_timeout,
            config.max_reflection_attempts,
        ));
        Self {
            config,
            directory,
            agents: RwLock::new(HashMap::new()),
            lexicon: BiasLexicon::builtin(),
            balancer: ArticleBalancer::default(),
            bus,
            store,
            tracker,
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Attach a capability behind a directory profile id.
    pub async fn register_agent(&self, agent_id: &str, capability: Arc<dyn AgentCapability>) {
        self.agents
            .write()
            .await
            .insert(agent_id.to_string(), capability);
    }

    /// Validate the topic, pick the roster, and spawn the run's owner task.
    /// Returns immediately with the run id; progress flows over the bus.
    #[instrument(skip(self), fields(topic = %topic))]
    pub async fn start_run(self: &Arc<Self>, topic: &str) -> Result<String> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(EngineError::Validation("topic is empty".to_string()));
        }
        if topic.len() > self.config.max_topic_len {
            return Err(EngineError::Validation(format!(
                "topic exceeds {} characters",
                self.config.max_topic_len
            )));
        }

        let mut roster = Vec::new();
        {
            let agents = self.agents.read().await;
            for profile in self.directory.select_for_topic(topic) {
                if agents.contains_key(&profile.id) {
                    roster.push(profile);
                } else if profile.mandatory {
                    return Err(EngineError::Validation(format!(
                        "no capability registered for core role '{}'",
                        profile.id
                    )));
                } else {
                    warn!("No capability for '{}', leaving it out", profile.id);
                }
            }
        }

        let run = Run::new(topic, roster.iter().map(|p| p.id.clone()).collect());
        let run_id = run.id.clone();
        info!("Starting run {} with {} agents", run_id, roster.len());

        // The handle goes in first: its creation instant anchors the one
        // absolute expiry every record of this run shares.
        {
            let mut runs = self.runs.write().await;
            runs.insert(
                run_id.clone(),
                RunHandle {
                    run: run.clone(),
                    memo_count: 0,
                    skipped_agents: Vec::new(),
                    last_message: None,
                    result: None,
                    cancelled: Arc::new(AtomicBool::new(false)),
                    created: Instant::now(),
                },
            );
        }
        if let Err(err) = self.persist_run(&run).await {
            self.runs.write().await.remove(&run_id);
            return Err(err);
        }

        self.emit(
            Message::new(MessageKind::RunStarted, &run_id, "orchestrator")
                .with_payload(json!({ "topic": topic, "agents": run.agents })),
        )
        .await;

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = engine.run_pipeline(run, roster).await {
                error!("Run pipeline error: {err}");
            }
        });

        Ok(run_id)
    }

    pub async fn get_run_status(&self, run_id: &str) -> Result<RunStatusReport> {
        let runs = self.runs.read().await;
        let handle = runs
            .get(run_id)
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        let reflections = self.tracker.lock().expect("tracker lock poisoned").stats(run_id);
        Ok(RunStatusReport {
            run_id: handle.run.id.clone(),
            topic: handle.run.topic.clone(),
            status: handle.run.status,
            agents: handle.run.agents.clone(),
            memo_count: handle.memo_count,
            skipped_agents: handle.skipped_agents.clone(),
            reflections,
            last_message: handle.last_message.clone(),
            error: handle.run.error.clone(),
        })
    }

    /// Catch-up history plus the live message tail for a run.
    pub async fn subscribe_progress(&self, run_id: &str) -> Result<Subscription> {
        let runs = self.runs.read().await;
        if !runs.contains_key(run_id) {
            return Err(EngineError::RunNotFound(run_id.to_string()));
        }
        Ok(self.bus.subscribe_with_history(run_id))
    }

    /// The finished document, once the run completes.
    pub async fn get_result(&self, run_id: &str) -> Result<FinalDocument> {
        let runs = self.runs.read().await;
        let handle = runs
            .get(run_id)
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        match handle.run.status {
            RunStatus::Completed => handle
                .result
                .clone()
                .ok_or_else(|| EngineError::Store("completed run has no stored result".to_string())),
            RunStatus::Failed => Err(EngineError::RunFailed(
                handle
                    .run
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string()),
            )),
            status => Err(EngineError::ResultNotReady {
                run_id: run_id.to_string(),
                phase: status.as_str().to_string(),
            }),
        }
    }

    /// Request cooperative cancellation. The owner task notices at the next
    /// phase boundary or dispatch tick; a terminal run is left untouched.
    pub async fn cancel_run(&self, run_id: &str) -> Result<()> {
        let runs = self.runs.read().await;
        let handle = runs
            .get(run_id)
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        if !handle.run.status.is_terminal() {
            handle.cancelled.store(true, Ordering::Relaxed);
            info!("Cancellation requested for run {run_id}");
        }
        Ok(())
    }

    /// Remove every trace of a run: cancel it, drop its bus channel and
    /// tracker state, and clear its keys from the store.
    pub async fn delete_run(&self, run_id: &str) -> Result<()> {
        self.cancel_run(run_id).await?;
        self.bus.clear_history(run_id);
        self.tracker
            .lock()
            .expect("tracker lock poisoned")
            .clear_run(run_id);
        self.store.delete_prefix(&store::run_prefix(run_id)).await?;
        self.runs.write().await.remove(run_id);
        Ok(())
    }

    /// Drop terminal runs that outlived the retention window.
    pub async fn purge_expired(&self) -> Result<usize> {
        let expired: Vec<String> = {
            let runs = self.runs.read().await;
            let now = Instant::now();
            runs.values()
                .filter(|h| {
                    h.run.status.is_terminal()
                        && now.duration_since(h.created) >= self.config.run_ttl
                })
                .map(|h| h.run.id.clone())
                .collect()
        };
        for run_id in &expired {
            self.delete_run(run_id).await?;
        }
        Ok(expired.len())
    }

    #[instrument(skip_all, fields(run_id = %run.id))]
    async fn run_pipeline(self: Arc<Self>, run: Run, roster: Vec<AgentProfile>) -> Result<()> {
        let run_id = run.id.clone();

        let memos = match self.draft_phase(&run, &roster).await {
            Ok(memos) => memos,
            Err(err) => return self.fail_run(&run_id, &err.to_string()).await,
        };
        if self.is_cancelled(&run_id).await {
            return self.fail_run(&run_id, "run cancelled").await;
        }

        let reflections = match self.reflect_phase(&run, &roster, &memos).await {
            Ok(reflections) => reflections,
            Err(err) => return self.fail_run(&run_id, &err.to_string()).await,
        };
        if self.is_cancelled(&run_id).await {
            return self.fail_run(&run_id, "run cancelled").await;
        }

        match self.synthesize_phase(&run, &memos, &reflections).await {
            Ok(document) => {
                {
                    let mut runs = self.runs.write().await;
                    if let Some(handle) = runs.get_mut(&run_id) {
                        handle.run.status = RunStatus::Completed;
                        handle.result = Some(document.clone());
                    }
                }
                if let Err(err) = self.persist_status(&run_id).await {
                    error!("Could not persist completed status for {run_id}: {err}");
                }
                self.emit(
                    Message::new(MessageKind::RunCompleted, &run_id, "orchestrator")
                        .with_payload(json!({ "word_count": document.word_count })),
                )
                .await;
                info!("Run {run_id} completed ({} words)", document.word_count);
                Ok(())
            }
            Err(err) => self.fail_run(&run_id, &err.to_string()).await,
        }
    }

    /// Fan drafting out to the whole roster. A specialist that fails after
    /// retries is skipped; the phase fails only when nobody produced a memo.
    async fn draft_phase(&self, run: &Run, roster: &[AgentProfile]) -> Result<Vec<Memo>> {
        self.advance_phase(&run.id, RunStatus::Drafting).await?;

        let mut set = JoinSet::new();
        for profile in roster {
            let capability = self.capability_for(&profile.id).await?;
            let context = DraftContext {
                run_id: run.id.clone(),
                topic: run.topic.clone(),
                angle: profile.angle.clone(),
            };
            let agent_id = profile.id.clone();
            let retry = self.config.retry.clone();
            let draft_timeout = self.config.draft_timeout;
            set.spawn(async move {
                let op_name = format!("draft:{agent_id}");
                let result = retry
                    .run(&op_name, || async {
                        match timeout(draft_timeout, capability.draft(&context)).await {
                            Ok(inner) => inner,
                            Err(_) => Err(CapabilityError::Transient(format!(
                                "draft timed out after {draft_timeout:?}"
                            ))),
                        }
                    })
                    .await;
                (agent_id, result)
            });
        }

        let cancelled = self.cancellation_flag(&run.id).await;
        let mut memos = Vec::new();
        loop {
            let joined = tokio::select! {
                joined = set.join_next() => joined,
                _ = tokio::time::sleep(DISPATCH_TICK) => {
                    if cancelled.load(Ordering::Relaxed) {
                        // Drafts already in flight finish detached; their
                        // results are discarded with the set.
                        set.detach_all();
                        return Err(EngineError::Cancelled);
                    }
                    continue;
                }
            };
            let Some(joined) = joined else { break };
            let Ok((agent_id, result)) = joined else {
                continue;
            };
            match result {
                Ok(content) => {
                    let mut memo = Memo::new(&run.id, &agent_id, content.content);
                    memo.attach_bias(self.lexicon.detect(&memo.content));
                    self.persist_memo(&memo).await?;
                    let report = memo.bias.as_ref().map(|b| {
                        json!({
                            "direction": b.direction,
                            "level": b.level.as_str(),
                            "summary": b.summary(),
                        })
                    });
                    self.emit(
                        Message::new(MessageKind::MemoAdded, &run.id, &agent_id).with_payload(
                            json!({ "memo_id": memo.id, "bias": report }),
                        ),
                    )
                    .await;
                    memos.push(memo);
                    let mut runs = self.runs.write().await;
                    if let Some(handle) = runs.get_mut(&run.id) {
                        handle.memo_count = memos.len();
                    }
                }
                Err(err) => {
                    warn!("Skipping '{agent_id}' after draft failure: {err}");
                    self.emit(
                        Message::new(MessageKind::AgentSkipped, &run.id, &agent_id)
                            .with_payload(json!({ "reason": err.to_string() })),
                    )
                    .await;
                    let mut runs = self.runs.write().await;
                    if let Some(handle) = runs.get_mut(&run.id) {
                        handle.skipped_agents.push(agent_id);
                    }
                }
            }
        }

        if memos.is_empty() {
            return Err(EngineError::RunFailed(
                "every specialist failed to draft".to_string(),
            ));
        }
        // Stable ordering for everything downstream.
        memos.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(memos)
    }

    /// Plan one critique per memo, then dispatch under the tracker's
    /// admission control until everything is terminal or the phase deadline
    /// lands.
    async fn reflect_phase(
        &self,
        run: &Run,
        roster: &[AgentProfile],
        memos: &[Memo],
    ) -> Result<Vec<ReflectionResponse>> {
        self.advance_phase(&run.id, RunStatus::Reflecting).await?;

        let mut planned = Vec::new();
        {
            let mut tracker = self.tracker.lock().expect("tracker lock poisoned");
            for memo in memos {
                let author = self.directory.get(&memo.agent_id);
                let directional = author
                    .map(|p| p.perspective != PerspectiveTag::Neutral)
                    .unwrap_or(false);
                let (reviewer, priority) = if directional {
                    (
                        self.directory.opposing_reviewer(&memo.agent_id, roster),
                        ReflectionPriority::High,
                    )
                } else {
                    (
                        self.directory.neutral_reviewer(&memo.agent_id, roster),
                        ReflectionPriority::Medium,
                    )
                };
                let Some(reviewer) = reviewer else {
                    continue;
                };
                let prompt = format!(
                    "Critique this memo on '{}' from your {} angle. Name weak claims and missing context.",
                    run.topic, reviewer.angle
                );
                match tracker.enqueue(
                    &run.id,
                    &memo.id,
                    &memo.agent_id,
                    &reviewer.id,
                    &memo.content,
                    &prompt,
                    priority,
                ) {
                    Ok(request) => planned.push(request),
                    Err(err) => warn!("Could not enqueue reflection: {err}"),
                }
            }
        }
        for request in &planned {
            self.emit(
                Message::new(MessageKind::ReflectionRequested, &run.id, &request.source_agent_id)
                    .with_payload(json!({
                        "request_id": request.id,
                        "memo_id": request.memo_id,
                        "reviewer": request.target_agent_id,
                    })),
            )
            .await;
        }

        let deadline = Instant::now() + self.config.reflection_deadline;
        let cancelled = self.cancellation_flag(&run.id).await;
        struct ReflectOutcome {
            request_id: String,
            agent_id: String,
            memo_id: String,
            attempt: u32,
            result: std::result::Result<ReflectionContent, CapabilityError>,
        }
        let mut set: JoinSet<ReflectOutcome> = JoinSet::new();

        loop {
            if cancelled.load(Ordering::Relaxed) {
                // Every live request must reach a terminal state so its
                // admission slot is released; in-flight reviewer calls run to
                // completion detached and their results are discarded.
                self.abandon_reflections(&run.id);
                set.detach_all();
                return Err(EngineError::Cancelled);
            }

            // Recycle or fail anything that blew its per-request deadline.
            let expired = {
                let mut tracker = self.tracker.lock().expect("tracker lock poisoned");
                tracker.sweep(&run.id)
            };
            for request in expired {
                if request.status == RequestStatus::Failed {
                    self.emit(
                        Message::new(MessageKind::ReflectionFailed, &run.id, &request.target_agent_id)
                            .with_payload(json!({
                                "request_id": request.id,
                                "memo_id": request.memo_id,
                                "reason": "timed out",
                            })),
                    )
                    .await;
                }
            }

            if Instant::now() >= deadline {
                let abandoned = self.abandon_reflections(&run.id);
                set.detach_all();
                warn!(
                    "Reflection deadline hit for run {}, skipping {} requests",
                    run.id,
                    abandoned.len()
                );
                for request in abandoned {
                    self.emit(
                        Message::new(MessageKind::ReflectionFailed, &run.id, &request.target_agent_id)
                            .with_payload(json!({
                                "request_id": request.id,
                                "memo_id": request.memo_id,
                                "reason": "phase deadline",
                            })),
                    )
                    .await;
                }
                break;
            }

            // Admit as much as capacity allows.
            loop {
                let admitted = {
                    let mut tracker = self.tracker.lock().expect("tracker lock poisoned");
                    tracker.admit_next(&run.id)
                };
                let Some(request) = admitted else { break };
                let capability = match self.capability_for(&request.target_agent_id).await {
                    Ok(capability) => capability,
                    Err(err) => {
                        self.abandon_reflections(&run.id);
                        set.detach_all();
                        return Err(err);
                    }
                };
                let reflection_timeout = self.config.reflection_timeout;
                set.spawn(async move {
                    let result =
                        match timeout(reflection_timeout, capability.reflect(&request)).await {
                            Ok(inner) => inner,
                            Err(_) => Err(CapabilityError::Transient(format!(
                                "reflection timed out after {reflection_timeout:?}"
                            ))),
                        };
                    ReflectOutcome {
                        request_id: request.id.clone(),
                        agent_id: request.target_agent_id.clone(),
                        memo_id: request.memo_id.clone(),
                        attempt: request.attempt_count,
                        result,
                    }
                });
            }

            let done = {
                let tracker = self.tracker.lock().expect("tracker lock poisoned");
                tracker.all_terminal(&run.id)
            };
            if done && set.is_empty() {
                break;
            }

            let joined = tokio::select! {
                joined = set.join_next(), if !set.is_empty() => joined,
                _ = tokio::time::sleep(DISPATCH_TICK) => continue,
            };
            let Some(Ok(outcome)) = joined else {
                continue;
            };

            match outcome.result {
                Ok(content) => {
                    let quality = self
                        .directory
                        .get(&outcome.agent_id)
                        .map(|p| p.reflection_quality)
                        .unwrap_or(0.5);
                    let bias = self.lexicon.detect(&content.content);
                    let response = ReflectionResponse {
                        request_id: outcome.request_id.clone(),
                        run_id: run.id.clone(),
                        memo_id: outcome.memo_id.clone(),
                        agent_id: outcome.agent_id.clone(),
                        content: content.content,
                        quality,
                        focus_areas: content.focus_areas,
                        bias: Some(bias),
                        created_at: chrono::Utc::now(),
                    };
                    let delivery = {
                        let mut tracker = self.tracker.lock().expect("tracker lock poisoned");
                        tracker.deliver(response, outcome.attempt)
                    };
                    if delivery == Delivery::Accepted {
                        self.emit(
                            Message::new(
                                MessageKind::ReflectionCompleted,
                                &run.id,
                                &outcome.agent_id,
                            )
                            .with_payload(json!({
                                "request_id": outcome.request_id,
                                "memo_id": outcome.memo_id,
                            })),
                        )
                        .await;
                    }
                }
                Err(err) => {
                    let status = {
                        let mut tracker = self.tracker.lock().expect("tracker lock poisoned");
                        tracker.release(&outcome.request_id, outcome.attempt, err.is_retriable())
                    };
                    if status == Some(RequestStatus::Failed) {
                        self.emit(
                            Message::new(MessageKind::ReflectionFailed, &run.id, &outcome.agent_id)
                                .with_payload(json!({
                                    "request_id": outcome.request_id,
                                    "reason": err.to_string(),
                                })),
                        )
                        .await;
                    }
                }
            }
        }

        let responses = {
            let tracker = self.tracker.lock().expect("tracker lock poisoned");
            tracker.responses_for_run(&run.id)
        };
        for response in &responses {
            self.persist_reflection(response).await?;
        }
        Ok(responses)
    }

    /// Score the whole run, surface the profile, and hand off to the editor.
    async fn synthesize_phase(
        &self,
        run: &Run,
        memos: &[Memo],
        reflections: &[ReflectionResponse],
    ) -> Result<FinalDocument> {
        self.advance_phase(&run.id, RunStatus::Synthesizing).await?;

        let mut contributions: Vec<Contribution> = memos
            .iter()
            .filter_map(|memo| {
                memo.bias.as_ref().map(|report| Contribution {
                    id: memo.id.clone(),
                    agent_id: memo.agent_id.clone(),
                    chars: memo.content.chars().count(),
                    report: report.clone(),
                })
            })
            .collect();
        contributions.extend(reflections.iter().filter_map(|response| {
            response.bias.as_ref().map(|report| Contribution {
                id: response.request_id.clone(),
                agent_id: response.agent_id.clone(),
                chars: response.content.chars().count(),
                report: report.clone(),
            })
        }));
        let profile = self.balancer.profile(&contributions);

        if profile.overall_direction.abs() >= self.balancer.moderate_threshold {
            self.emit(
                Message::new(MessageKind::BiasAlert, &run.id, "orchestrator").with_payload(
                    json!({
                        "direction": profile.overall_direction,
                        "level": profile.overall_level.as_str(),
                        "summary": profile.summary,
                    }),
                ),
            )
            .await;
        }

        let editor = self.capability_for(&self.config.synthesis_agent).await?;
        let synthesis_timeout = self.config.synthesis_timeout;
        let document = self
            .config
            .retry
            .run("synthesize", || {
                let editor = Arc::clone(&editor);
                let profile = profile.clone();
                async move {
                    match timeout(
                        synthesis_timeout,
                        editor.synthesize(memos, reflections, &profile),
                    )
                    .await
                    {
                        Ok(inner) => inner,
                        Err(_) => Err(CapabilityError::Transient(format!(
                            "synthesis timed out after {synthesis_timeout:?}"
                        ))),
                    }
                }
            })
            .await
            .map_err(|err| err.into_engine(&self.config.synthesis_agent))?;

        self.store_put(
            &run.id,
            &store::result_key(&run.id),
            serde_json::to_value(&document).map_err(|e| EngineError::Store(e.to_string()))?,
        )
        .await?;
        self.persist_profile(&run.id, &profile).await?;
        Ok(document)
    }

    /// Drive every live reflection request for a run to a terminal state so
    /// its admission slots are released.
    fn abandon_reflections(&self, run_id: &str) -> Vec<ReflectionRequest> {
        let mut tracker = self.tracker.lock().expect("tracker lock poisoned");
        let mut dropped = tracker.skip_pending(run_id);
        dropped.extend(tracker.abandon_in_progress(run_id));
        dropped
    }

    async fn capability_for(&self, agent_id: &str) -> Result<Arc<dyn AgentCapability>> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| EngineError::Validation(format!("unknown agent '{agent_id}'")))
    }

    async fn cancellation_flag(&self, run_id: &str) -> Arc<AtomicBool> {
        let runs = self.runs.read().await;
        runs.get(run_id)
            .map(|h| Arc::clone(&h.cancelled))
            .unwrap_or_else(|| Arc::new(AtomicBool::new(false)))
    }

    async fn is_cancelled(&self, run_id: &str) -> bool {
        self.cancellation_flag(run_id).await.load(Ordering::Relaxed)
    }

    async fn advance_phase(&self, run_id: &str, status: RunStatus) -> Result<()> {
        {
            let mut runs = self.runs.write().await;
            if let Some(handle) = runs.get_mut(run_id) {
                handle.run.status = handle.run.status.advance();
                debug_assert_eq!(handle.run.status, status);
            }
        }
        self.persist_status(run_id).await?;
        self.emit(
            Message::new(MessageKind::PhaseChanged, run_id, "orchestrator")
                .with_payload(json!({ "phase": status.as_str() })),
        )
        .await;
        Ok(())
    }

    async fn fail_run(&self, run_id: &str, reason: &str) -> Result<()> {
        warn!("Run {run_id} failed: {reason}");
        {
            let mut runs = self.runs.write().await;
            if let Some(handle) = runs.get_mut(run_id) {
                handle.run.status = handle.run.status.fail();
                handle.run.error = Some(reason.to_string());
            }
        }
        // Terminal transitions stay best effort; the in-memory handle is the
        // source of truth once the run is over.
        if let Err(err) = self.persist_status(run_id).await {
            error!("Could not persist failed status for {run_id}: {err}");
        }
        self.emit(
            Message::new(MessageKind::RunFailed, run_id, "orchestrator")
                .with_payload(json!({ "reason": reason })),
        )
        .await;
        Ok(())
    }

    /// Publish and remember the latest message kind for status queries.
    async fn emit(&self, message: Message) {
        {
            let mut runs = self.runs.write().await;
            if let Some(handle) = runs.get_mut(&message.run_id) {
                handle.last_message = Some(message.kind.as_str().to_string());
            }
        }
        if let Err(err) = self.bus.publish(message) {
            error!("Bus publish failed: {err}");
        }
    }

    /// Remaining retention for a run's records, anchored to the single
    /// absolute expiry fixed at run creation so every record lapses together.
    async fn ttl_for(&self, run_id: &str) -> Duration {
        let runs = self.runs.read().await;
        runs.get(run_id)
            .map(|h| (h.created + self.config.run_ttl).saturating_duration_since(Instant::now()))
            .unwrap_or(self.config.run_ttl)
    }

    /// All run records go through here: writes ride the retry policy, and a
    /// write that is still broken once retries are spent surfaces as a store
    /// error for the caller to fail the run with.
    async fn store_put(&self, run_id: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let ttl = self.ttl_for(run_id).await;
        self.config
            .retry
            .run(&format!("store:{key}"), || {
                let value = value.clone();
                async move {
                    self.store
                        .put(key, value, Some(ttl))
                        .await
                        .map_err(|e| CapabilityError::Transient(e.to_string()))
                }
            })
            .await
            .map_err(|err| EngineError::Store(err.to_string()))
    }

    async fn persist_run(&self, run: &Run) -> Result<()> {
        let value =
            serde_json::to_value(run).map_err(|e| EngineError::Store(e.to_string()))?;
        self.store_put(&run.id, &store::run_key(&run.id), value).await
    }

    async fn persist_status(&self, run_id: &str) -> Result<()> {
        let run = {
            let runs = self.runs.read().await;
            runs.get(run_id).map(|h| h.run.clone())
        };
        match run {
            Some(run) => self.persist_run(&run).await,
            None => Ok(()),
        }
    }

    async fn persist_memo(&self, memo: &Memo) -> Result<()> {
        let value =
            serde_json::to_value(memo).map_err(|e| EngineError::Store(e.to_string()))?;
        self.store_put(&memo.run_id, &store::memo_key(&memo.run_id, &memo.id), value)
            .await
    }

    async fn persist_reflection(&self, response: &ReflectionResponse) -> Result<()> {
        let value =
            serde_json::to_value(response).map_err(|e| EngineError::Store(e.to_string()))?;
        self.store_put(
            &response.run_id,
            &store::reflection_key(&response.run_id, &response.request_id),
            value,
        )
        .await
    }

    async fn persist_profile(&self, run_id: &str, profile: &BiasProfile) -> Result<()> {
        let value =
            serde_json::to_value(profile).map_err(|e| EngineError::Store(e.to_string()))?;
        self.store_put(run_id, &format!("{}:profile", store::run_prefix(run_id)), value)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::MemoContent;
    use crate::store::MemoryStore;

    #[derive(Clone)]
    enum Behavior {
        Respond,
        Slow(Duration),
        Never,
        Fail,
    }

    struct StubAgent {
        text: String,
        draft: Behavior,
        reflect: Behavior,
    }

    impl StubAgent {
        fn new(text: &str) -> Self {
            Self {
                text: text.to_string(),
                draft: Behavior::Respond,
                reflect: Behavior::Respond,
            }
        }

        fn with_draft(mut self, behavior: Behavior) -> Self {
            self.draft = behavior;
            self
        }

        fn with_reflect(mut self, behavior: Behavior) -> Self {
            self.reflect = behavior;
            self
        }

        async fn act(behavior: &Behavior) -> std::result::Result<(), CapabilityError> {
            match behavior {
                Behavior::Respond => Ok(()),
                Behavior::Slow(delay) => {
                    tokio::time::sleep(*delay).await;
                    Ok(())
                }
                Behavior::Never => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                Behavior::Fail => Err(CapabilityError::Permanent("stub refused".to_string())),
            }
        }
    }

    #[async_trait::async_trait]
    impl AgentCapability for StubAgent {
        async fn draft(
            &self,
            context: &DraftContext,
        ) -> std::result::Result<MemoContent, CapabilityError> {
            Self::act(&self.draft).await?;
            Ok(MemoContent {
                content: format!("{} On '{}'.", self.text, context.topic),
            })
        }

        async fn reflect(
            &self,
            request: &crate::reflection::ReflectionRequest,
        ) -> std::result::Result<ReflectionContent, CapabilityError> {
            Self::act(&self.reflect).await?;
            Ok(ReflectionContent {
                content: format!("Counterpoint to memo {}.", request.memo_id),
                focus_areas: vec!["framing".to_string()],
            })
        }

        async fn synthesize(
            &self,
            memos: &[Memo],
            reflections: &[ReflectionResponse],
            profile: &BiasProfile,
        ) -> std::result::Result<FinalDocument, CapabilityError> {
            let mut body: Vec<String> = memos.iter().map(|m| m.content.clone()).collect();
            body.push(format!(
                "Weighed {} critiques. {}",
                reflections.len(),
                profile.summary
            ));
            Ok(FinalDocument::new(body.join("\n\n")))
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            draft_timeout: Duration::from_secs(5),
            synthesis_timeout: Duration::from_secs(5),
            reflection_deadline: Duration::from_secs(120),
            reflection_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        }
    }

    async fn newsroom_engine_with(
        config: EngineConfig,
        store: Arc<dyn RunStore>,
        overrides: Vec<(&str, StubAgent)>,
    ) -> Arc<Engine> {
        let engine = Arc::new(Engine::new(config, CapabilityDirectory::newsroom(), store));
        let mut stubs: HashMap<&str, StubAgent> = overrides.into_iter().collect();
        for id in [
            "editor",
            "researcher",
            "writer",
            "historian",
            "geopolitics",
            "politics_left",
            "politics_right",
        ] {
            let stub = stubs
                .remove(id)
                .unwrap_or_else(|| StubAgent::new("Facts and context."));
            engine.register_agent(id, Arc::new(stub)).await;
        }
        engine
    }

    async fn newsroom_engine(overrides: Vec<(&str, StubAgent)>) -> Arc<Engine> {
        newsroom_engine_with(test_config(), Arc::new(MemoryStore::new()), overrides).await
    }

    enum PutPlan {
        FailFirst(u32),
        FailAfter(u32),
    }

    /// Store whose writes fail according to a plan; reads pass through.
    struct FlakyStore {
        inner: MemoryStore,
        plan: Mutex<PutPlan>,
    }

    impl FlakyStore {
        fn failing_first(failures: u32) -> Self {
            Self {
                inner: MemoryStore::new(),
                plan: Mutex::new(PutPlan::FailFirst(failures)),
            }
        }

        fn failing_after(successes: u32) -> Self {
            Self {
                inner: MemoryStore::new(),
                plan: Mutex::new(PutPlan::FailAfter(successes)),
            }
        }
    }

    #[async_trait::async_trait]
    impl RunStore for FlakyStore {
        async fn put(
            &self,
            key: &str,
            value: serde_json::Value,
            ttl: Option<Duration>,
        ) -> Result<()> {
            let reject = {
                let mut plan = self.plan.lock().unwrap();
                match &mut *plan {
                    PutPlan::FailFirst(left) => {
                        if *left > 0 {
                            *left -= 1;
                            true
                        } else {
                            false
                        }
                    }
                    PutPlan::FailAfter(left) => {
                        if *left > 0 {
                            *left -= 1;
                            false
                        } else {
                            true
                        }
                    }
                }
            };
            if reject {
                return Err(EngineError::Store("backend offline".to_string()));
            }
            self.inner.put(key, value, ttl).await
        }

        async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }

        async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
            self.inner.delete_prefix(prefix).await
        }
    }

    async fn drain_to_terminal(sub: &mut Subscription) -> Vec<MessageKind> {
        let mut kinds: Vec<MessageKind> = sub.replay.iter().map(|m| m.kind).collect();
        while let Some(message) = sub.live.recv().await {
            kinds.push(message.kind);
        }
        kinds
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_completes_with_balanced_coverage() {
        let engine = newsroom_engine(vec![
            (
                "politics_left",
                StubAgent::new("Workers need a living wage and union support."),
            ),
            (
                "politics_right",
                StubAgent::new("Tax cuts and the free market lift the private sector."),
            ),
        ])
        .await;

        let run_id = engine
            .start_run("New tariff policy reshapes international trade")
            .await
            .unwrap();
        let mut sub = engine.subscribe_progress(&run_id).await.unwrap();
        let kinds = drain_to_terminal(&mut sub).await;

        assert_eq!(*kinds.last().unwrap(), MessageKind::RunCompleted);
        assert_eq!(kinds[0], MessageKind::RunStarted);
        assert_eq!(
            kinds.iter().filter(|k| **k == MessageKind::MemoAdded).count(),
            6
        );

        let status = engine.get_run_status(&run_id).await.unwrap();
        assert_eq!(status.status, RunStatus::Completed);
        assert_eq!(status.memo_count, 6);
        assert!(status.skipped_agents.is_empty());
        assert_eq!(status.reflections.completed, status.reflections.total);
        assert_eq!(status.reflections.failed, 0);

        let document = engine.get_result(&run_id).await.unwrap();
        assert!(document.word_count > 0);
        assert!(document.content.contains("critiques"));

        // Every memo announcement carries the readable bias summary.
        let history = engine.bus().get_history(&run_id);
        let summaries: Vec<&str> = history
            .iter()
            .filter(|m| m.kind == MessageKind::MemoAdded)
            .filter_map(|m| m.payload.as_ref())
            .filter_map(|p| p["bias"]["summary"].as_str())
            .collect();
        assert_eq!(summaries.len(), 6);
        assert!(summaries.iter().all(|s| s.contains("bias")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_specialist_is_skipped_not_fatal() {
        let engine = newsroom_engine(vec![(
            "geopolitics",
            StubAgent::new("unused").with_draft(Behavior::Fail),
        )])
        .await;

        let run_id = engine
            .start_run("Global trade winners and losers")
            .await
            .unwrap();
        let mut sub = engine.subscribe_progress(&run_id).await.unwrap();
        let kinds = drain_to_terminal(&mut sub).await;

        assert!(kinds.contains(&MessageKind::AgentSkipped));
        assert_eq!(*kinds.last().unwrap(), MessageKind::RunCompleted);

        let status = engine.get_run_status(&run_id).await.unwrap();
        assert_eq!(status.skipped_agents, vec!["geopolitics".to_string()]);
        assert_eq!(status.memo_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_reflector_fails_request_not_run() {
        let engine = newsroom_engine(vec![(
            "politics_right",
            StubAgent::new("Deregulation spurs growth.").with_reflect(Behavior::Never),
        )])
        .await;

        let run_id = engine
            .start_run("Election year tax policy fight")
            .await
            .unwrap();
        let mut sub = engine.subscribe_progress(&run_id).await.unwrap();
        let kinds = drain_to_terminal(&mut sub).await;

        // The stuck critique burns its attempts and fails; the run still
        // reaches synthesis on what it has.
        assert!(kinds.contains(&MessageKind::ReflectionFailed));
        assert_eq!(*kinds.last().unwrap(), MessageKind::RunCompleted);

        let status = engine.get_run_status(&run_id).await.unwrap();
        assert!(status.reflections.failed >= 1);
        assert!(status.reflections.completed >= 1);
        engine.get_result(&run_id).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_fails_the_run() {
        let slow = || StubAgent::new("slow").with_draft(Behavior::Slow(Duration::from_secs(3600)));
        let engine = newsroom_engine(vec![
            ("editor", slow()),
            ("researcher", slow()),
            ("writer", slow()),
        ])
        .await;

        let run_id = engine.start_run("Quiet local news day").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.cancel_run(&run_id).await.unwrap();

        let mut status = engine.get_run_status(&run_id).await.unwrap();
        for _ in 0..200 {
            if status.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            status = engine.get_run_status(&run_id).await.unwrap();
        }
        assert_eq!(status.status, RunStatus::Failed);
        assert!(status.error.unwrap().contains("cancelled"));
        assert!(matches!(
            engine.get_result(&run_id).await,
            Err(EngineError::RunFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_topic_validation() {
        let engine = newsroom_engine(vec![]).await;
        assert!(matches!(
            engine.start_run("   ").await,
            Err(EngineError::Validation(_))
        ));
        let oversize = "t".repeat(EngineConfig::default().max_topic_len + 1);
        assert!(matches!(
            engine.start_run(&oversize).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_not_ready_and_unknown_run() {
        let engine = newsroom_engine(vec![(
            "writer",
            StubAgent::new("slow").with_draft(Behavior::Slow(Duration::from_secs(2))),
        )])
        .await;

        let run_id = engine.start_run("Anything at all").await.unwrap();
        assert!(matches!(
            engine.get_result(&run_id).await,
            Err(EngineError::ResultNotReady { .. })
        ));
        assert!(matches!(
            engine.get_run_status("missing").await,
            Err(EngineError::RunNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_run_removes_all_traces() {
        let engine = newsroom_engine(vec![]).await;
        let run_id = engine.start_run("Short lived story").await.unwrap();
        let mut sub = engine.subscribe_progress(&run_id).await.unwrap();
        drain_to_terminal(&mut sub).await;

        engine.delete_run(&run_id).await.unwrap();
        assert!(matches!(
            engine.get_run_status(&run_id).await,
            Err(EngineError::RunNotFound(_))
        ));
        assert!(engine.bus().get_history(&run_id).is_empty());
        assert!(engine
            .store
            .get(&store::run_key(&run_id))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_reflection_releases_admission_slots() {
        let config = EngineConfig {
            max_reflection_concurrency: 1,
            ..test_config()
        };
        let engine = newsroom_engine_with(
            config,
            Arc::new(MemoryStore::new()),
            vec![(
                "researcher",
                StubAgent::new("Numbers first.").with_reflect(Behavior::Never),
            )],
        )
        .await;

        let run_id = engine.start_run("City budget audit").await.unwrap();
        let mut status = engine.get_run_status(&run_id).await.unwrap();
        for _ in 0..400 {
            if status.status == RunStatus::Reflecting && status.reflections.in_progress > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = engine.get_run_status(&run_id).await.unwrap();
        }
        assert!(status.reflections.in_progress > 0);

        engine.cancel_run(&run_id).await.unwrap();
        for _ in 0..400 {
            if status.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = engine.get_run_status(&run_id).await.unwrap();
        }
        assert_eq!(status.status, RunStatus::Failed);
        // Cancellation drives every request terminal; nothing keeps holding
        // the shared concurrency cap.
        assert_eq!(status.reflections.in_progress, 0);
        assert_eq!(status.reflections.pending, 0);

        // A later run on the same engine still gets critiques through the
        // single slot.
        let run2 = engine.start_run("Harbor dredging contract").await.unwrap();
        let mut sub = engine.subscribe_progress(&run2).await.unwrap();
        let kinds = drain_to_terminal(&mut sub).await;
        assert_eq!(*kinds.last().unwrap(), MessageKind::RunCompleted);
        let status2 = engine.get_run_status(&run2).await.unwrap();
        assert!(status2.reflections.completed >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_store_outage_is_retried() {
        let engine = newsroom_engine_with(
            test_config(),
            Arc::new(FlakyStore::failing_first(2)),
            vec![],
        )
        .await;

        let run_id = engine.start_run("Bridge repair bids").await.unwrap();
        let mut sub = engine.subscribe_progress(&run_id).await.unwrap();
        let kinds = drain_to_terminal(&mut sub).await;

        assert_eq!(*kinds.last().unwrap(), MessageKind::RunCompleted);
        assert!(engine
            .store
            .get(&store::run_key(&run_id))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecoverable_store_outage_fails_the_run() {
        // A store that never accepts a write rejects the run up front, and
        // nothing is left registered for it.
        let engine = newsroom_engine_with(
            test_config(),
            Arc::new(FlakyStore::failing_first(u32::MAX)),
            vec![],
        )
        .await;
        assert!(matches!(
            engine.start_run("Anything at all").await,
            Err(EngineError::Store(_))
        ));
        assert!(engine.runs.read().await.is_empty());

        // A store that dies after the run record lands fails the run itself.
        let engine = newsroom_engine_with(
            test_config(),
            Arc::new(FlakyStore::failing_after(1)),
            vec![],
        )
        .await;
        let run_id = engine.start_run("Library funding vote").await.unwrap();
        let mut sub = engine.subscribe_progress(&run_id).await.unwrap();
        let kinds = drain_to_terminal(&mut sub).await;

        assert_eq!(*kinds.last().unwrap(), MessageKind::RunFailed);
        let status = engine.get_run_status(&run_id).await.unwrap();
        assert_eq!(status.status, RunStatus::Failed);
        assert!(status.error.unwrap().contains("store operation failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_records_expire_together() {
        let config = EngineConfig {
            run_ttl: Duration::from_secs(60),
            draft_timeout: Duration::from_secs(30),
            ..test_config()
        };
        let store = Arc::new(MemoryStore::new());
        let engine = newsroom_engine_with(
            config,
            store.clone(),
            vec![(
                "writer",
                StubAgent::new("Deadline copy.")
                    .with_draft(Behavior::Slow(Duration::from_secs(10))),
            )],
        )
        .await;

        let started = Instant::now();
        let run_id = engine.start_run("School board recall").await.unwrap();
        let mut sub = engine.subscribe_progress(&run_id).await.unwrap();
        drain_to_terminal(&mut sub).await;

        let memo_id = engine
            .bus()
            .get_history(&run_id)
            .iter()
            .find(|m| m.kind == MessageKind::MemoAdded && m.agent_id == "writer")
            .and_then(|m| m.payload.as_ref())
            .and_then(|p| p["memo_id"].as_str().map(str::to_string))
            .unwrap();

        // The writer's memo landed ten virtual seconds into the run, yet it
        // lapses at the same absolute instant as the run record.
        tokio::time::advance(Duration::from_secs(55).saturating_sub(started.elapsed())).await;
        assert!(store.get(&store::run_key(&run_id)).await.unwrap().is_some());
        assert!(store
            .get(&store::memo_key(&run_id, &memo_id))
            .await
            .unwrap()
            .is_some());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(store.get(&store::run_key(&run_id)).await.unwrap().is_none());
        assert!(store
            .get(&store::memo_key(&run_id, &memo_id))
            .await
            .unwrap()
            .is_none());
    }
}
