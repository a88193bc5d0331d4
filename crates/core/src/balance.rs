//! # Article Balancer
//!
//! Aggregates per-contribution bias scores into a run-level profile with
//! rule-based balancing recommendations. The profile is advisory only: it is
//! recomputed wholesale from the current contribution set and never mutates a
//! memo; synthesis decides how to apply it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bias::{BiasAxis, BiasLevel, BiasReport};

/// One scored contribution: a memo or a reflection response.
#[derive(Debug, Clone)]
pub struct Contribution {
    /// Memo or response id; profiles key on this.
    pub id: String,
    pub agent_id: String,
    /// Content length in chars, used as the weight for the overall mean.
    pub chars: usize,
    pub report: BiasReport,
}

/// Direction and level of one contribution, as recorded in the profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContributionBias {
    pub direction: f64,
    pub level: BiasLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    /// The run leans one way; amplify the underrepresented direction.
    AmplifyOpposing,
    /// Attach an editorial balance note to the final document.
    EditorialNote,
    /// Specific contributions on one axis need further reflection.
    AxisReflection,
}

/// One ordered, rule-based balancing recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub detail: String,
    /// Contributions this applies to, in id order. Empty for run-wide advice.
    #[serde(default)]
    pub memo_ids: Vec<String>,
}

/// Run-level bias snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasProfile {
    /// Length-weighted mean of contribution directions, in [-1, 1].
    pub overall_direction: f64,
    pub overall_level: BiasLevel,
    /// Mean per axis over contributions that touch that axis.
    pub axis_scores: BTreeMap<BiasAxis, f64>,
    pub contribution_scores: BTreeMap<String, ContributionBias>,
    pub recommendations: Vec<Recommendation>,
    pub summary: String,
}

impl BiasProfile {
    fn empty() -> Self {
        Self {
            overall_direction: 0.0,
            overall_level: BiasLevel::None,
            axis_scores: BTreeMap::new(),
            contribution_scores: BTreeMap::new(),
            recommendations: Vec::new(),
            summary: "No contributions to analyze.".to_string(),
        }
    }
}

/// Computes a [`BiasProfile`] from a contribution set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleBalancer {
    /// |overall_direction| at or above this triggers directional advice.
    pub moderate_threshold: f64,
    /// max-min per axis above this counts as a wide spread.
    pub spread_threshold: f64,
    /// |axis mean| at or below this counts as a compensating near-zero mean.
    pub near_zero: f64,
    /// Contributions at or above this magnitude on a flagged axis are named.
    pub flag_magnitude: f64,
    /// Mean sensationalist score above this draws an editorial note.
    pub sensational_threshold: f64,
}

impl Default for ArticleBalancer {
    fn default() -> Self {
        Self {
            moderate_threshold: 0.2,
            spread_threshold: 0.8,
            near_zero: 0.1,
            flag_magnitude: 0.4,
            sensational_threshold: 0.5,
        }
    }
}

impl ArticleBalancer {
    /// Build the profile. Deterministic for a fixed contribution set
    /// regardless of arrival order: contributions are sorted by id before
    /// any accumulation.
    pub fn profile(&self, contributions: &[Contribution]) -> BiasProfile {
        if contributions.is_empty() {
            return BiasProfile::empty();
        }

        let mut ordered: Vec<&Contribution> = contributions.iter().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));

        // Length-weighted overall direction.
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for c in &ordered {
            let weight = c.chars.max(1) as f64;
            weighted += c.report.direction * weight;
            total_weight += weight;
        }
        let overall_direction = (weighted / total_weight).clamp(-1.0, 1.0);
        let overall_level = BiasLevel::from_direction(overall_direction);

        // Per-axis mean over touching contributions only.
        let mut axis_scores = BTreeMap::new();
        for axis in BiasAxis::ALL {
            let touching: Vec<f64> = ordered
                .iter()
                .filter_map(|c| c.report.axis_scores.get(&axis).copied())
                .collect();
            if !touching.is_empty() {
                axis_scores.insert(axis, touching.iter().sum::<f64>() / touching.len() as f64);
            }
        }

        let contribution_scores: BTreeMap<String, ContributionBias> = ordered
            .iter()
            .map(|c| {
                (
                    c.id.clone(),
                    ContributionBias {
                        direction: c.report.direction,
                        level: c.report.level,
                    },
                )
            })
            .collect();

        let recommendations = self.recommend(overall_direction, &axis_scores, &ordered);
        let summary = render_summary(overall_direction, overall_level, &recommendations);

        BiasProfile {
            overall_direction,
            overall_level,
            axis_scores,
            contribution_scores,
            recommendations,
            summary,
        }
    }

    fn recommend(
        &self,
        overall_direction: f64,
        axis_scores: &BTreeMap<BiasAxis, f64>,
        ordered: &[&Contribution],
    ) -> Vec<Recommendation> {
        let mut out = Vec::new();

        if overall_direction.abs() >= self.moderate_threshold {
            let (lean, opposite) = if overall_direction > 0.0 {
                ("progressive", "conservative")
            } else {
                ("conservative", "progressive")
            };
            out.push(Recommendation {
                kind: RecommendationKind::AmplifyOpposing,
                detail: format!(
                    "Contributions lean {lean} overall ({overall_direction:+.2}); \
                     amplify {opposite} perspectives before synthesis."
                ),
                memo_ids: Vec::new(),
            });
            out.push(Recommendation {
                kind: RecommendationKind::EditorialNote,
                detail: format!(
                    "Attach an editorial balance note acknowledging the {lean} slant."
                ),
                memo_ids: Vec::new(),
            });
        }

        // One-sided axis spread: wide range with no compensating near-zero mean.
        for axis in BiasAxis::ALL.iter().filter(|a| a.is_directional()) {
            let per_contribution: Vec<(&str, f64)> = ordered
                .iter()
                .filter_map(|c| {
                    c.report
                        .axis_scores
                        .get(axis)
                        .map(|score| (c.id.as_str(), *score))
                })
                .collect();
            if per_contribution.len() < 2 {
                continue;
            }

            let min = per_contribution
                .iter()
                .map(|(_, s)| *s)
                .fold(f64::INFINITY, f64::min);
            let max = per_contribution
                .iter()
                .map(|(_, s)| *s)
                .fold(f64::NEG_INFINITY, f64::max);
            let mean = per_contribution.iter().map(|(_, s)| *s).sum::<f64>()
                / per_contribution.len() as f64;

            if max - min > self.spread_threshold && mean.abs() > self.near_zero {
                let mut flagged: Vec<String> = per_contribution
                    .iter()
                    .filter(|(_, score)| {
                        score.signum() == mean.signum() && score.abs() >= self.flag_magnitude
                    })
                    .map(|(id, _)| (*id).to_string())
                    .collect();
                flagged.sort();
                if !flagged.is_empty() {
                    out.push(Recommendation {
                        kind: RecommendationKind::AxisReflection,
                        detail: format!(
                            "One-sided spread on the {} axis (mean {:+.2}); \
                             the flagged contributions need further reflection.",
                            axis.as_str(),
                            mean
                        ),
                        memo_ids: flagged,
                    });
                }
            }
        }

        if let Some(sensational) = axis_scores.get(&BiasAxis::Sensationalist) {
            if *sensational > self.sensational_threshold {
                out.push(Recommendation {
                    kind: RecommendationKind::EditorialNote,
                    detail: format!(
                        "Sensationalist framing is high ({sensational:.2}); \
                         tone down emotionally charged language."
                    ),
                    memo_ids: Vec::new(),
                });
            }
        }

        out
    }
}

fn render_summary(
    direction: f64,
    level: BiasLevel,
    recommendations: &[Recommendation],
) -> String {
    let orientation = if direction >= 0.2 {
        "a progressive orientation"
    } else if direction <= -0.2 {
        "a conservative orientation"
    } else {
        "a balanced orientation"
    };
    if recommendations.is_empty() {
        format!(
            "The contribution set shows {} bias with {orientation}; no balancing needed.",
            level.as_str()
        )
    } else {
        format!(
            "The contribution set shows {} bias with {orientation}; {} recommendation(s).",
            level.as_str(),
            recommendations.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bias::BiasLexicon;

    fn contribution(id: &str, agent: &str, text: &str) -> Contribution {
        let lexicon = BiasLexicon::builtin();
        Contribution {
            id: id.to_string(),
            agent_id: agent.to_string(),
            chars: text.len(),
            report: lexicon.detect(text),
        }
    }

    fn scored(id: &str, direction: f64, axis: BiasAxis, chars: usize) -> Contribution {
        let mut axis_scores = BTreeMap::new();
        axis_scores.insert(axis, direction);
        Contribution {
            id: id.to_string(),
            agent_id: format!("agent-{id}"),
            chars,
            report: BiasReport {
                direction,
                level: BiasLevel::from_direction(direction),
                axis_scores,
                markers: Vec::new(),
                lexicon_version: "builtin-v1".to_string(),
            },
        }
    }

    #[test]
    fn test_empty_set() {
        let profile = ArticleBalancer::default().profile(&[]);
        assert_eq!(profile.overall_level, BiasLevel::None);
        assert!(profile.recommendations.is_empty());
    }

    #[test]
    fn test_opposing_pair_balances_out() {
        // Tariffs scenario: two opposing agents at -0.6 and +0.6, equal length.
        let left = scored("memo-a", 0.6, BiasAxis::Economic, 400);
        let right = scored("memo-b", -0.6, BiasAxis::Economic, 400);
        let profile = ArticleBalancer::default().profile(&[left, right]);

        assert!(profile.overall_direction.abs() < 1e-9);
        assert!(profile.overall_level <= BiasLevel::Mild);
        // Spread is 1.2 but the mean is zero: compensated, nothing flagged.
        assert!(profile
            .recommendations
            .iter()
            .all(|r| r.kind != RecommendationKind::AxisReflection));
        assert!(profile.recommendations.is_empty());
    }

    #[test]
    fn test_order_independence() {
        let a = scored("memo-a", 0.5, BiasAxis::Political, 300);
        let b = scored("memo-b", -0.1, BiasAxis::Economic, 500);
        let c = scored("memo-c", 0.3, BiasAxis::Political, 100);
        let balancer = ArticleBalancer::default();

        let forward = balancer.profile(&[a.clone(), b.clone(), c.clone()]);
        let reversed = balancer.profile(&[c, b, a]);
        assert_eq!(forward, reversed);
    }

    #[test]
    fn test_directional_lean_recommends_opposite() {
        let a = scored("memo-a", 0.6, BiasAxis::Political, 400);
        let b = scored("memo-b", 0.4, BiasAxis::Political, 400);
        let profile = ArticleBalancer::default().profile(&[a, b]);

        assert!(profile.overall_direction > 0.2);
        assert_eq!(
            profile.recommendations[0].kind,
            RecommendationKind::AmplifyOpposing
        );
        assert!(profile.recommendations[0].detail.contains("conservative"));
        assert_eq!(
            profile.recommendations[1].kind,
            RecommendationKind::EditorialNote
        );
    }

    #[test]
    fn test_one_sided_spread_flags_contributions() {
        // Wide spread, mean well off zero: the strong outlier gets flagged.
        let a = scored("memo-a", 0.9, BiasAxis::Environmental, 400);
        let b = scored("memo-b", 0.7, BiasAxis::Environmental, 400);
        let c = scored("memo-c", -0.2, BiasAxis::Environmental, 400);
        let profile = ArticleBalancer::default().profile(&[a, b, c]);

        let flag = profile
            .recommendations
            .iter()
            .find(|r| r.kind == RecommendationKind::AxisReflection)
            .expect("expected an axis flag");
        assert_eq!(flag.memo_ids, vec!["memo-a", "memo-b"]);
        assert!(flag.detail.contains("environmental"));
    }

    #[test]
    fn test_axis_mean_ignores_non_touching() {
        let econ = scored("memo-a", 0.5, BiasAxis::Economic, 100);
        let political = scored("memo-b", -0.3, BiasAxis::Political, 100);
        let profile = ArticleBalancer::default().profile(&[econ, political]);

        // Each axis averages only over contributions that touch it.
        assert!((profile.axis_scores[&BiasAxis::Economic] - 0.5).abs() < 1e-9);
        assert!((profile.axis_scores[&BiasAxis::Political] + 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_lexical_contributions_end_to_end() {
        let left = contribution(
            "memo-a",
            "economist",
            "Raising the minimum wage to a living wage narrows income inequality.",
        );
        let right = contribution(
            "memo-b",
            "markets",
            "Tax cuts and a free market reward the private sector.",
        );
        let profile = ArticleBalancer::default().profile(&[left, right]);
        // Opposite signs, similar magnitudes: close to balanced.
        assert!(profile.overall_direction.abs() < 0.2);
    }
}
