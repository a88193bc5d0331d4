//! # Message Bus
//!
//! Per-run publish/subscribe with a bounded, ordered retained history.
//! Publishing appends to the run's history (oldest evicted past capacity) and
//! fans out to current subscribers at-least-once, in publish order per run.
//! Reconnecting consumers catch up with [`MessageBus::subscribe_with_history`]:
//! the replay and the live tail are taken under one lock, so the combined
//! sequence has no gaps and no duplicates.
//!
//! The message schema is a closed tagged enum; arbitrary payloads ride in the
//! optional `payload` field, never as new message kinds.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{EngineError, Result};
use crate::ids::new_id;

/// Kind of bus message. Closed set, checked at publish time by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    RunStarted,
    PhaseChanged,
    /// A draft memo was added and scored.
    MemoAdded,
    /// An agent failed permanently and was skipped.
    AgentSkipped,
    ReflectionRequested,
    ReflectionCompleted,
    ReflectionFailed,
    /// The run-level bias profile crossed a reporting threshold.
    BiasAlert,
    RunCompleted,
    RunFailed,
}

impl MessageKind {
    /// Terminal kinds end every progress subscription for the run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageKind::RunCompleted | MessageKind::RunFailed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::RunStarted => "run_started",
            MessageKind::PhaseChanged => "phase_changed",
            MessageKind::MemoAdded => "memo_added",
            MessageKind::AgentSkipped => "agent_skipped",
            MessageKind::ReflectionRequested => "reflection_requested",
            MessageKind::ReflectionCompleted => "reflection_completed",
            MessageKind::ReflectionFailed => "reflection_failed",
            MessageKind::BiasAlert => "bias_alert",
            MessageKind::RunCompleted => "run_completed",
            MessageKind::RunFailed => "run_failed",
        }
    }
}

/// A message on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub kind: MessageKind,
    pub run_id: String,
    /// Agent that produced the message; "orchestrator" for engine-level ones.
    pub agent_id: String,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(kind: MessageKind, run_id: &str, agent_id: &str) -> Self {
        Self {
            id: new_id("msg"),
            kind,
            run_id: run_id.to_string(),
            agent_id: agent_id.to_string(),
            payload: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// A live subscription: replayed history plus the live tail.
///
/// The receiver closes after the run's terminal message, making the sequence
/// finite; subscribing to an already-terminal run yields the full history and
/// an immediately-closed receiver.
pub struct Subscription {
    pub subscriber_id: String,
    pub replay: Vec<Message>,
    pub live: mpsc::UnboundedReceiver<Message>,
}

struct RunChannel {
    history: VecDeque<Message>,
    subscribers: HashMap<String, mpsc::UnboundedSender<Message>>,
    /// Set once a terminal message has been published; no live tail after.
    closed: bool,
}

impl RunChannel {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            subscribers: HashMap::new(),
            closed: false,
        }
    }
}

/// Per-run pub/sub with bounded retained history.
pub struct MessageBus {
    capacity: usize,
    runs: Mutex<HashMap<String, RunChannel>>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Append to the run's history and fan out to current subscribers.
    ///
    /// Ordering is preserved per run; there is no cross-run guarantee.
    pub fn publish(&self, message: Message) -> Result<()> {
        if message.run_id.is_empty() {
            return Err(EngineError::Validation(
                "message has no run id".to_string(),
            ));
        }

        let mut runs = self.runs.lock().expect("bus lock poisoned");
        let channel = runs
            .entry(message.run_id.clone())
            .or_insert_with(RunChannel::new);

        if channel.closed {
            // Late publishes after the terminal message are dropped as no-ops.
            tracing::debug!(
                "Discarding {} for closed run {}",
                message.kind.as_str(),
                message.run_id
            );
            return Ok(());
        }

        channel.history.push_back(message.clone());
        while channel.history.len() > self.capacity {
            channel.history.pop_front();
        }

        channel
            .subscribers
            .retain(|_, tx| tx.send(message.clone()).is_ok());

        if message.kind.is_terminal() {
            channel.closed = true;
            // Dropping the senders closes every live tail.
            channel.subscribers.clear();
        }

        Ok(())
    }

    /// Subscribe to the live tail only. Idempotent per subscriber id.
    pub fn subscribe(&self, run_id: &str) -> Subscription {
        let mut sub = self.subscribe_with_history(run_id);
        sub.replay.clear();
        sub
    }

    /// Atomically fetch the retained history and attach a live tail.
    pub fn subscribe_with_history(&self, run_id: &str) -> Subscription {
        let mut runs = self.runs.lock().expect("bus lock poisoned");
        let channel = runs
            .entry(run_id.to_string())
            .or_insert_with(RunChannel::new);

        let subscriber_id = new_id("sub");
        let (tx, rx) = mpsc::unbounded_channel();
        let replay: Vec<Message> = channel.history.iter().cloned().collect();

        if !channel.closed {
            channel.subscribers.insert(subscriber_id.clone(), tx);
        }
        // For a closed run the sender is dropped here and the receiver yields
        // nothing after the replay.

        Subscription {
            subscriber_id,
            replay,
            live: rx,
        }
    }

    /// Remove a subscriber. Idempotent: unknown ids are a no-op.
    pub fn unsubscribe(&self, run_id: &str, subscriber_id: &str) {
        let mut runs = self.runs.lock().expect("bus lock poisoned");
        if let Some(channel) = runs.get_mut(run_id) {
            channel.subscribers.remove(subscriber_id);
        }
    }

    /// The retained sequence for catch-up by reconnecting consumers.
    pub fn get_history(&self, run_id: &str) -> Vec<Message> {
        let runs = self.runs.lock().expect("bus lock poisoned");
        runs.get(run_id)
            .map(|c| c.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop the run's channel entirely. Required before run deletion.
    pub fn clear_history(&self, run_id: &str) {
        let mut runs = self.runs.lock().expect("bus lock poisoned");
        runs.remove(run_id);
    }
}
