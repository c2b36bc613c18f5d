//! Skip segments (opening, ending, recap) and lookup helpers

use crate::types::SkipAffordance;
use serde::{Deserialize, Serialize};

/// Kind of a skippable interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentKind {
    #[serde(rename = "op")]
    Opening,
    #[serde(rename = "ed")]
    Ending,
    #[serde(rename = "recap")]
    Recap,
    #[serde(rename = "mixed-op")]
    MixedOpening,
    #[serde(rename = "mixed-ed")]
    MixedEnding,
}

impl SegmentKind {
    pub fn is_opening_class(&self) -> bool {
        matches!(self, SegmentKind::Opening | SegmentKind::MixedOpening)
    }

    pub fn is_ending_class(&self) -> bool {
        matches!(self, SegmentKind::Ending | SegmentKind::MixedEnding)
    }

    /// Opening, ending and recap each form one class
    pub fn same_class(&self, other: SegmentKind) -> bool {
        (self.is_opening_class() && other.is_opening_class())
            || (self.is_ending_class() && other.is_ending_class())
            || (*self == SegmentKind::Recap && other == SegmentKind::Recap)
    }

    /// Affordance shown while inside a segment of this kind
    pub fn affordance(&self) -> SkipAffordance {
        if self.is_opening_class() {
            SkipAffordance::Opening
        } else if self.is_ending_class() {
            SkipAffordance::Ending
        } else {
            SkipAffordance::None
        }
    }
}

impl std::fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentKind::Opening => write!(f, "opening"),
            SegmentKind::Ending => write!(f, "ending"),
            SegmentKind::Recap => write!(f, "recap"),
            SegmentKind::MixedOpening => write!(f, "mixed opening"),
            SegmentKind::MixedEnding => write!(f, "mixed ending"),
        }
    }
}

/// A labeled time interval within an episode. `start_seconds < end_seconds` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub kind: SegmentKind,
    pub start_seconds: f64,
    pub end_seconds: f64,
}

impl Segment {
    /// Build a segment, rejecting empty, negative or non-finite intervals
    pub fn new(kind: SegmentKind, start_seconds: f64, end_seconds: f64) -> Option<Self> {
        let valid = start_seconds.is_finite()
            && end_seconds.is_finite()
            && start_seconds >= 0.0
            && start_seconds < end_seconds;
        valid.then_some(Self {
            kind,
            start_seconds,
            end_seconds,
        })
    }

    /// Check if a playback position falls inside this segment
    pub fn contains(&self, time: f64) -> bool {
        time >= self.start_seconds && time < self.end_seconds
    }

    /// Seconds left until the segment ends
    pub fn remaining(&self, time: f64) -> f64 {
        (self.end_seconds - time).max(0.0)
    }

    pub fn duration(&self) -> f64 {
        self.end_seconds - self.start_seconds
    }

    /// Clip the segment to `[0, duration]`; None when nothing is left
    pub fn clamp_to(&self, duration: f64) -> Option<Self> {
        Segment::new(self.kind, self.start_seconds, self.end_seconds.min(duration))
    }
}

/// First opening-class segment
pub fn opening(segments: &[Segment]) -> Option<&Segment> {
    segments.iter().find(|s| s.kind.is_opening_class())
}

/// First ending-class segment
pub fn ending(segments: &[Segment]) -> Option<&Segment> {
    segments.iter().find(|s| s.kind.is_ending_class())
}

/// Segment whose skip affordance applies at `time`. Openings are checked before
/// endings, and only the first segment of each class is considered.
pub fn active_at(segments: &[Segment], time: f64) -> Option<&Segment> {
    opening(segments)
        .filter(|s| s.contains(time))
        .or_else(|| ending(segments).filter(|s| s.contains(time)))
}
