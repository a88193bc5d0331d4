//! # Bias Detector
//!
//! Pure scoring function over text: weighted lexical matching per axis plus
//! explicit inline markers. Deterministic given the text and lexicon version;
//! no hidden state.
//!
//! Direction convention: positive is progressive, negative is conservative.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A named dimension of directional slant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum BiasAxis {
    Political,
    Economic,
    Social,
    Environmental,
    /// Emotionally charged framing. Contributes level only, never direction.
    Sensationalist,
}

impl BiasAxis {
    pub const ALL: [BiasAxis; 5] = [
        BiasAxis::Political,
        BiasAxis::Economic,
        BiasAxis::Social,
        BiasAxis::Environmental,
        BiasAxis::Sensationalist,
    ];

    /// Whether this axis carries a left/right sign.
    pub fn is_directional(&self) -> bool {
        !matches!(self, BiasAxis::Sensationalist)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BiasAxis::Political => "political",
            BiasAxis::Economic => "economic",
            BiasAxis::Social => "social",
            BiasAxis::Environmental => "environmental",
            BiasAxis::Sensationalist => "sensationalist",
        }
    }
}

/// Severity bucket derived from |direction|.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum BiasLevel {
    #[default]
    None,
    Mild,
    Moderate,
    Strong,
    Extreme,
}

impl BiasLevel {
    /// Boundaries at 0.05 / 0.2 / 0.4 / 0.7 on the magnitude.
    pub fn from_direction(direction: f64) -> Self {
        let magnitude = direction.abs();
        if magnitude < 0.05 {
            BiasLevel::None
        } else if magnitude < 0.2 {
            BiasLevel::Mild
        } else if magnitude < 0.4 {
            BiasLevel::Moderate
        } else if magnitude < 0.7 {
            BiasLevel::Strong
        } else {
            BiasLevel::Extreme
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BiasLevel::None => "none",
            BiasLevel::Mild => "mild",
            BiasLevel::Moderate => "moderate",
            BiasLevel::Strong => "strong",
            BiasLevel::Extreme => "extreme",
        }
    }
}

/// An explicit author-declared marker found in the text, e.g. `[ECON-L]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerHit {
    /// The marker token as written, without brackets.
    pub token: String,
    pub axis: BiasAxis,
    /// +1.0 for the progressive pole, -1.0 for the conservative pole.
    pub direction: f64,
}

/// Result of scoring one piece of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasReport {
    /// Overall slant in [-1, 1]; mean of the touched directional axes.
    pub direction: f64,
    /// Bucketed |direction|.
    pub level: BiasLevel,
    /// Signed score per touched axis. Axes with no signal are absent.
    pub axis_scores: BTreeMap<BiasAxis, f64>,
    /// Explicit markers found, in text order.
    pub markers: Vec<MarkerHit>,
    /// Lexicon the scores were computed against.
    pub lexicon_version: String,
}

impl BiasReport {
    /// A report with no signal at all, for empty input.
    fn neutral(version: &str) -> Self {
        Self {
            direction: 0.0,
            level: BiasLevel::None,
            axis_scores: BTreeMap::new(),
            markers: Vec::new(),
            lexicon_version: version.to_string(),
        }
    }

    /// One-line human-readable description of the result.
    pub fn summary(&self) -> String {
        let lean = if self.direction >= 0.05 {
            "progressive"
        } else if self.direction <= -0.05 {
            "conservative"
        } else {
            "neutral"
        };
        format!(
            "{} bias, {} orientation (direction {:+.2}, {} markers)",
            self.level.as_str(),
            lean,
            self.direction,
            self.markers.len()
        )
    }
}

/// Weighted keyword poles for one directional axis.
struct AxisKeywords {
    axis: BiasAxis,
    progressive: &'static [(&'static str, f64)],
    conservative: &'static [(&'static str, f64)],
}

/// The built-in lexicon and its marker pattern.
///
/// Versioned so a report can state what it was scored against; a report is
/// reproducible from (text, lexicon version) alone.
pub struct BiasLexicon {
    version: String,
    axes: Vec<AxisKeywords>,
    sensational: &'static [(&'static str, f64)],
    marker_re: Regex,
}

/// Marker tokens map to (axis, pole). Brackets of any kind are accepted:
/// `[BIAS-L]`, `{BIAS-L}`, `(BIAS-L)`, `<BIAS-L>`.
const MARKER_TOKENS: [(&str, BiasAxis, f64); 8] = [
    ("BIAS-L", BiasAxis::Political, 1.0),
    ("BIAS-R", BiasAxis::Political, -1.0),
    ("ECON-L", BiasAxis::Economic, 1.0),
    ("ECON-R", BiasAxis::Economic, -1.0),
    ("SOCIAL-L", BiasAxis::Social, 1.0),
    ("SOCIAL-R", BiasAxis::Social, -1.0),
    ("ENV-L", BiasAxis::Environmental, 1.0),
    ("ENV-R", BiasAxis::Environmental, -1.0),
];

impl Default for BiasLexicon {
    fn default() -> Self {
        Self::builtin()
    }
}

impl BiasLexicon {
    /// The v1 built-in lexicon.
    pub fn builtin() -> Self {
        let axes = vec![
            AxisKeywords {
                axis: BiasAxis::Political,
                progressive: &[
                    ("progressive", 1.0),
                    ("left-wing", 1.0),
                    ("social justice", 1.0),
                    ("universal healthcare", 1.0),
                    ("welfare state", 1.0),
                    ("workers rights", 1.0),
                    ("big government", 0.5),
                ],
                conservative: &[
                    ("conservative", 1.0),
                    ("right-wing", 1.0),
                    ("traditional values", 1.0),
                    ("small government", 1.0),
                    ("individual liberty", 1.0),
                    ("constitutional rights", 1.0),
                    ("patriot", 0.5),
                ],
            },
            AxisKeywords {
                axis: BiasAxis::Economic,
                progressive: &[
                    ("wealth tax", 1.0),
                    ("income inequality", 1.0),
                    ("living wage", 1.0),
                    ("minimum wage", 1.0),
                    ("universal basic income", 1.0),
                    ("corporate tax", 1.0),
                    ("labor unions", 1.0),
                    ("progressive taxation", 1.0),
                ],
                conservative: &[
                    ("tax cuts", 1.0),
                    ("free market", 1.0),
                    ("deregulation", 1.0),
                    ("fiscal responsibility", 1.0),
                    ("job creators", 1.0),
                    ("supply side", 1.0),
                    ("private sector", 1.0),
                    ("free enterprise", 1.0),
                ],
            },
            AxisKeywords {
                axis: BiasAxis::Social,
                progressive: &[
                    ("reproductive rights", 1.0),
                    ("racial justice", 1.0),
                    ("criminal justice reform", 1.0),
                    ("police reform", 1.0),
                    ("immigration reform", 1.0),
                    ("civil liberties", 1.0),
                ],
                conservative: &[
                    ("family values", 1.0),
                    ("religious freedom", 1.0),
                    ("law and order", 1.0),
                    ("border security", 1.0),
                    ("tough on crime", 1.0),
                    ("school choice", 1.0),
                ],
            },
            AxisKeywords {
                axis: BiasAxis::Environmental,
                progressive: &[
                    ("climate change", 1.0),
                    ("global warming", 1.0),
                    ("renewable energy", 1.0),
                    ("clean energy", 1.0),
                    ("carbon emissions", 1.0),
                    ("sustainability", 1.0),
                    ("environmental protection", 1.0),
                ],
                conservative: &[
                    ("energy independence", 1.0),
                    ("natural gas", 1.0),
                    ("energy jobs", 1.0),
                    ("regulatory burden", 1.0),
                    ("climate alarmism", 1.0),
                    ("coal", 0.5),
                ],
            },
        ];

        let sensational: &[(&str, f64)] = &[
            ("catastrophic", 1.0),
            ("devastating", 1.0),
            ("unprecedented", 1.0),
            ("shocking", 1.0),
            ("bombshell", 1.0),
            ("explosive", 1.0),
            ("outrageous", 1.0),
            ("chaos", 0.75),
            ("collapse", 0.75),
            ("crisis", 0.5),
        ];

        // Any of [] {} () <> around a known token.
        let marker_re = Regex::new(r"[\[\{\(<]([A-Z]+-[LR])[\]\}\)>]")
            .expect("marker pattern is valid");

        Self {
            version: "builtin-v1".to_string(),
            axes,
            sensational,
            marker_re,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Score text against the lexicon. Pure and deterministic.
    ///
    /// Explicit markers are authoritative: when an axis carries markers, the
    /// lexical signal for that axis is discarded and the score is the mean of
    /// the marker poles.
    pub fn detect(&self, text: &str) -> BiasReport {
        if text.trim().is_empty() {
            return BiasReport::neutral(&self.version);
        }

        let lowered = text.to_lowercase();
        let markers = self.extract_markers(text);

        let mut axis_scores = BTreeMap::new();

        for keywords in &self.axes {
            let marker_signs: Vec<f64> = markers
                .iter()
                .filter(|m| m.axis == keywords.axis)
                .map(|m| m.direction)
                .collect();

            if !marker_signs.is_empty() {
                let mean = marker_signs.iter().sum::<f64>() / marker_signs.len() as f64;
                axis_scores.insert(keywords.axis, mean);
                continue;
            }

            let left = weighted_matches(&lowered, keywords.progressive);
            let right = weighted_matches(&lowered, keywords.conservative);
            let total = left + right;
            if total > 0.0 {
                // Signed ratio damped so isolated matches do not saturate.
                let score = ((left - right) / total) * (total / (total + 2.0));
                axis_scores.insert(keywords.axis, score);
            }
        }

        let sensational = weighted_matches(&lowered, self.sensational);
        if sensational > 0.0 {
            axis_scores.insert(
                BiasAxis::Sensationalist,
                sensational / (sensational + 2.0),
            );
        }

        let directional: Vec<f64> = axis_scores
            .iter()
            .filter(|(axis, _)| axis.is_directional())
            .map(|(_, score)| *score)
            .collect();
        let direction = if directional.is_empty() {
            0.0
        } else {
            (directional.iter().sum::<f64>() / directional.len() as f64).clamp(-1.0, 1.0)
        };

        BiasReport {
            direction,
            level: BiasLevel::from_direction(direction),
            axis_scores,
            markers,
            lexicon_version: self.version.clone(),
        }
    }

    /// Scan for explicit inline markers, in text order.
    fn extract_markers(&self, text: &str) -> Vec<MarkerHit> {
        self.marker_re
            .captures_iter(text)
            .filter_map(|caps| {
                let token = caps.get(1)?.as_str();
                MARKER_TOKENS
                    .iter()
                    .find(|(known, _, _)| *known == token)
                    .map(|(known, axis, direction)| MarkerHit {
                        token: (*known).to_string(),
                        axis: *axis,
                        direction: *direction,
                    })
            })
            .collect()
    }
}

/// Sum of weights over non-overlapping occurrences of each keyword.
fn weighted_matches(lowered: &str, keywords: &[(&str, f64)]) -> f64 {
    keywords
        .iter()
        .map(|(keyword, weight)| lowered.matches(keyword).count() as f64 * weight)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_thresholds() {
        assert_eq!(BiasLevel::from_direction(0.0), BiasLevel::None);
        assert_eq!(BiasLevel::from_direction(-0.04), BiasLevel::None);
        assert_eq!(BiasLevel::from_direction(0.1), BiasLevel::Mild);
        assert_eq!(BiasLevel::from_direction(-0.3), BiasLevel::Moderate);
        assert_eq!(BiasLevel::from_direction(0.6), BiasLevel::Strong);
        assert_eq!(BiasLevel::from_direction(-0.9), BiasLevel::Extreme);
    }

    #[test]
    fn test_detector_is_pure() {
        let lexicon = BiasLexicon::builtin();
        let text = "A wealth tax would address income inequality, say labor unions.";
        let first = lexicon.detect(text);
        let second = lexicon.detect(text);
        assert_eq!(first, second);
        assert_eq!(first.lexicon_version, "builtin-v1");
    }

    #[test]
    fn test_one_sided_economic_text_scores_progressive() {
        let lexicon = BiasLexicon::builtin();
        let report = lexicon.detect(
            "Raising the minimum wage to a living wage narrows income inequality.",
        );
        // Three one-sided matches: ratio 1.0 damped by 3/5.
        let econ = report.axis_scores[&BiasAxis::Economic];
        assert!((econ - 0.6).abs() < 1e-9);
        assert!((report.direction - 0.6).abs() < 1e-9);
        assert_eq!(report.level, BiasLevel::Strong);
    }

    #[test]
    fn test_opposing_keywords_cancel() {
        let lexicon = BiasLexicon::builtin();
        let report = lexicon.detect(
            "Supporters cite tax cuts and the free market; critics want a wealth tax \
             and point to income inequality.",
        );
        let econ = report.axis_scores[&BiasAxis::Economic];
        assert!(econ.abs() < 1e-9);
    }

    #[test]
    fn test_markers_override_lexical_signal() {
        let lexicon = BiasLexicon::builtin();
        // Lexically conservative text, explicitly marked progressive.
        let report =
            lexicon.detect("[ECON-L] Tax cuts and deregulation have run their course.");
        assert_eq!(report.markers.len(), 1);
        assert_eq!(report.markers[0].token, "ECON-L");
        assert!((report.axis_scores[&BiasAxis::Economic] - 1.0).abs() < 1e-9);
        assert!(report.direction > 0.9);
    }

    #[test]
    fn test_marker_bracket_variants() {
        let lexicon = BiasLexicon::builtin();
        let report = lexicon.detect("(BIAS-R) then {BIAS-L} then <BIAS-R>");
        assert_eq!(report.markers.len(), 3);
        let political = report.axis_scores[&BiasAxis::Political];
        assert!((political - (-1.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn test_sensationalist_axis_has_no_direction() {
        let lexicon = BiasLexicon::builtin();
        let report =
            lexicon.detect("A shocking, devastating, unprecedented bombshell of a story.");
        assert!(report.axis_scores.contains_key(&BiasAxis::Sensationalist));
        assert_eq!(report.direction, 0.0);
        assert_eq!(report.level, BiasLevel::None);
    }

    #[test]
    fn test_summary_names_level_and_lean() {
        let lexicon = BiasLexicon::builtin();
        let progressive = lexicon
            .detect("Raising the minimum wage to a living wage narrows income inequality.")
            .summary();
        assert!(progressive.contains("strong"));
        assert!(progressive.contains("progressive"));
        let neutral = lexicon.detect("The council met on Tuesday.").summary();
        assert!(neutral.contains("neutral"));
    }

    #[test]
    fn test_empty_text_is_neutral() {
        let lexicon = BiasLexicon::builtin();
        let report = lexicon.detect("   ");
        assert!(report.axis_scores.is_empty());
        assert_eq!(report.level, BiasLevel::None);
    }
}
