//! # Capability Directory
//!
//! The roster of specialist profiles and the topic-driven selection rules.
//! Core roles always run; keyword-gated specialists join when the topic
//! mentions their beat, and the two political desks only ever run as a pair
//! so the roster never tilts by construction.

use serde::{Deserialize, Serialize};

/// Editorial perspective a specialist writes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerspectiveTag {
    Progressive,
    Conservative,
    Neutral,
}

impl PerspectiveTag {
    /// The perspective best placed to push back on this one.
    pub fn opposing(&self) -> PerspectiveTag {
        match self {
            PerspectiveTag::Progressive => PerspectiveTag::Conservative,
            PerspectiveTag::Conservative => PerspectiveTag::Progressive,
            PerspectiveTag::Neutral => PerspectiveTag::Neutral,
        }
    }
}

/// A registered specialist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    /// Topic keywords that pull this specialist into a run.
    pub keywords: Vec<String>,
    pub perspective: PerspectiveTag,
    /// Reviewer quality weight, 0.0 to 1.0, attached to critiques.
    pub reflection_quality: f64,
    /// Angle the specialist drafts from.
    pub angle: String,
    /// Core roles join every run regardless of keywords.
    pub mandatory: bool,
}

/// Registration order is preserved and drives every tie-break, so selection
/// is deterministic for a given roster and topic.
pub struct CapabilityDirectory {
    profiles: Vec<AgentProfile>,
}

impl CapabilityDirectory {
    pub fn new(profiles: Vec<AgentProfile>) -> Self {
        Self { profiles }
    }

    /// The built-in newsroom roster.
    pub fn newsroom() -> Self {
        let core = |id: &str, angle: &str| AgentProfile {
            id: id.to_string(),
            keywords: Vec::new(),
            perspective: PerspectiveTag::Neutral,
            reflection_quality: 0.9,
            angle: angle.to_string(),
            mandatory: true,
        };
        let beat = |id: &str, keywords: &[&str], angle: &str| AgentProfile {
            id: id.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            perspective: PerspectiveTag::Neutral,
            reflection_quality: 0.8,
            angle: angle.to_string(),
            mandatory: false,
        };

        Self::new(vec![
            core("editor", "editorial oversight and final synthesis"),
            core("researcher", "verified facts and background"),
            core("writer", "narrative drafting"),
            beat(
                "historian",
                &["history", "historical", "war", "revolution", "precedent"],
                "historical precedent",
            ),
            beat(
                "geopolitics",
                &["international", "foreign", "global", "trade", "treaty", "diplomacy"],
                "international ramifications",
            ),
            AgentProfile {
                id: "politics_left".to_string(),
                keywords: vec![
                    "politics".to_string(),
                    "policy".to_string(),
                    "election".to_string(),
                    "tariff".to_string(),
                    "tax".to_string(),
                    "regulation".to_string(),
                ],
                perspective: PerspectiveTag::Progressive,
                reflection_quality: 0.7,
                angle: "progressive policy analysis".to_string(),
                mandatory: false,
            },
            AgentProfile {
                id: "politics_right".to_string(),
                keywords: vec![
                    "politics".to_string(),
                    "policy".to_string(),
                    "election".to_string(),
                    "tariff".to_string(),
                    "tax".to_string(),
                    "regulation".to_string(),
                ],
                perspective: PerspectiveTag::Conservative,
                reflection_quality: 0.7,
                angle: "conservative policy analysis".to_string(),
                mandatory: false,
            },
        ])
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentProfile> {
        self.profiles.iter().find(|p| p.id == agent_id)
    }

    pub fn profiles(&self) -> &[AgentProfile] {
        &self.profiles
    }

    /// Pick the roster for a topic: every mandatory role, plus any specialist
    /// whose keywords appear in the topic (case-insensitive substring match).
    /// If either political desk matches, both run.
    pub fn select_for_topic(&self, topic: &str) -> Vec<AgentProfile> {
        let lowered = topic.to_lowercase();
        let mut selected: Vec<AgentProfile> = self
            .profiles
            .iter()
            .filter(|p| {
                p.mandatory || p.keywords.iter().any(|k| lowered.contains(k.as_str()))
            })
            .cloned()
            .collect();

        // Keep the political pair balanced: one in means both in.
        let has_directional = selected
            .iter()
            .any(|p| p.perspective != PerspectiveTag::Neutral);
        if has_directional {
            for profile in &self.profiles {
                if profile.perspective != PerspectiveTag::Neutral
                    && !selected.iter().any(|p| p.id == profile.id)
                {
                    selected.push(profile.clone());
                }
            }
            // Restore registration order after the top-up.
            selected.sort_by_key(|p| {
                self.profiles
                    .iter()
                    .position(|r| r.id == p.id)
                    .unwrap_or(usize::MAX)
            });
        }

        selected
    }

    /// Among the given candidates, the reviewer holding the opposing
    /// perspective to the author's. None when the author is neutral or no
    /// opposing candidate is present.
    pub fn opposing_reviewer<'a>(
        &self,
        author_id: &str,
        candidates: &'a [AgentProfile],
    ) -> Option<&'a AgentProfile> {
        let author = self.get(author_id)?;
        if author.perspective == PerspectiveTag::Neutral {
            return None;
        }
        let wanted = author.perspective.opposing();
        candidates
            .iter()
            .find(|p| p.perspective == wanted && p.id != author_id)
    }

    /// The first neutral candidate that is not the author, in registration
    /// order.
    pub fn neutral_reviewer<'a>(
        &self,
        author_id: &str,
        candidates: &'a [AgentProfile],
    ) -> Option<&'a AgentProfile> {
        candidates
            .iter()
            .find(|p| p.perspective == PerspectiveTag::Neutral && p.id != author_id)
    }
}
