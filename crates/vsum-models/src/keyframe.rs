//! Keyframe candidates and interval validation.

use std::cmp::Ordering;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Why a moment was picked as a keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeyframeCategory {
    /// Visual scene change
    SceneChange,
    /// Slide or on-screen text
    Slide,
    /// Speaker or face in focus
    Speaker,
    /// Demonstration or on-screen action
    Demonstration,
    /// Key point called out in the narration
    KeyPoint,
    #[default]
    #[serde(other)]
    Other,
}

/// Candidate keyframe proposed by analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct KeyframeCandidate {
    /// Seconds from the start of the video
    pub timestamp: f64,
    pub reason: String,
    /// Model confidence (0.0-1.0)
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub category: KeyframeCategory,
}

impl KeyframeCandidate {
    pub fn new(timestamp: f64, reason: impl Into<String>) -> Self {
        Self {
            timestamp,
            reason: reason.into(),
            confidence: 0.0,
            category: KeyframeCategory::Other,
        }
    }
}

/// Filter candidates to in-range, time-ordered, gap-enforced keyframes.
///
/// Candidates with `timestamp < 0` or `timestamp >= video_duration` are
/// discarded (as are non-finite timestamps). The rest are sorted ascending and
/// scanned left to right: the first is always kept, each later one only if it
/// sits at least `min_gap_secs` after the last kept candidate. Violators are
/// dropped, never merged.
pub fn validate_keyframe_intervals<I>(
    candidates: I,
    video_duration: f64,
    min_gap_secs: f64,
) -> Vec<KeyframeCandidate>
where
    I: IntoIterator<Item = KeyframeCandidate>,
{
    let mut in_range: Vec<KeyframeCandidate> = candidates
        .into_iter()
        .filter(|c| c.timestamp.is_finite() && c.timestamp >= 0.0 && c.timestamp < video_duration)
        .collect();

    in_range.sort_by(|a, b| a.timestamp.partial_cmp(&b.timestamp).unwrap_or(Ordering::Equal));

    let mut kept: Vec<KeyframeCandidate> = Vec::with_capacity(in_range.len());
    for candidate in in_range {
        match kept.last() {
            Some(last) if candidate.timestamp - last.timestamp < min_gap_secs => continue,
            _ => kept.push(candidate),
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(timestamps: &[f64]) -> Vec<KeyframeCandidate> {
        timestamps
            .iter()
            .map(|t| KeyframeCandidate::new(*t, format!("at {}", t)))
            .collect()
    }

    fn timestamps(kept: &[KeyframeCandidate]) -> Vec<f64> {
        kept.iter().map(|c| c.timestamp).collect()
    }

    #[test]
    fn test_reference_case() {
        let kept = validate_keyframe_intervals(
            candidates(&[-5.0, 0.0, 30.0, 50.0, 120.0, 300.0]),
            250.0,
            30.0,
        );
        assert_eq!(timestamps(&kept), vec![0.0, 30.0, 120.0]);
    }

    #[test]
    fn test_unsorted_input_is_sorted() {
        let kept = validate_keyframe_intervals(candidates(&[90.0, 10.0, 45.0]), 100.0, 20.0);
        assert_eq!(timestamps(&kept), vec![10.0, 45.0, 90.0]);
    }

    #[test]
    fn test_gap_violators_are_dropped_not_merged() {
        let kept = validate_keyframe_intervals(candidates(&[10.0, 15.0, 25.0, 31.0]), 100.0, 20.0);
        // 15 and 25 are within 20s of 10; 31 is 21s after 10
        assert_eq!(timestamps(&kept), vec![10.0, 31.0]);
        assert_eq!(kept[1].reason, "at 31");
    }

    #[test]
    fn test_duration_bound_is_exclusive() {
        let kept = validate_keyframe_intervals(candidates(&[0.0, 100.0]), 100.0, 10.0);
        assert_eq!(timestamps(&kept), vec![0.0]);
    }

    #[test]
    fn test_non_finite_timestamps_are_discarded() {
        let kept = validate_keyframe_intervals(candidates(&[f64::NAN, 5.0, f64::INFINITY]), 100.0, 10.0);
        assert_eq!(timestamps(&kept), vec![5.0]);
    }

    #[test]
    fn test_empty_input() {
        assert!(validate_keyframe_intervals(Vec::new(), 100.0, 10.0).is_empty());
    }

    #[test]
    fn test_unknown_category_deserializes_as_other() {
        let c: KeyframeCandidate =
            serde_json::from_str(r#"{"timestamp":1.5,"reason":"x","confidence":0.9,"category":"chart"}"#)
                .unwrap();
        assert_eq!(c.category, KeyframeCategory::Other);
    }
}
