//! Temporal fusion of liveness scores.
//!
//! Streaming mode is a threshold over the latest score per identity.
//! Session mode averages per-class classifier outputs over a fixed wall-clock
//! window and reports the winning class once the window closes.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{StageError, StageResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Classification {
    Real,
    Fake,
    /// No liveness score has arrived yet.
    Pending,
}

impl Classification {
    /// `score > threshold` is `Real`, anything else `Fake`.
    pub fn from_score(score: Option<f32>, threshold: f32) -> Self {
        match score {
            Some(score) if score > threshold => Classification::Real,
            Some(_) => Classification::Fake,
            None => Classification::Pending,
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Classification::Real => "Real",
            Classification::Fake => "Fake",
            Classification::Pending => "Pending",
        };
        f.write_str(text)
    }
}

/// Index and value of the highest score. Ties go to the later class.
pub fn classify_scores(scores: &[f32]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &score) in scores.iter().enumerate() {
        match best {
            Some((_, value)) if score < value => {}
            _ => best = Some((index, score)),
        }
    }
    best
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Verdict {
    pub class_index: usize,
    pub label: String,
    /// Mean score of the winning class.
    pub confidence: f32,
    pub frames: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum SessionOutcome {
    Verdict(Verdict),
    NoFramesAnalyzed,
}

impl SessionOutcome {
    pub fn verdict(&self) -> Option<&Verdict> {
        match self {
            SessionOutcome::Verdict(verdict) => Some(verdict),
            SessionOutcome::NoFramesAnalyzed => None,
        }
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Verdict(v) => write!(
                f,
                "{} ({:.1}% over {} frames)",
                v.label,
                v.confidence * 100.0,
                v.frames
            ),
            SessionOutcome::NoFramesAnalyzed => f.write_str("No frames analyzed"),
        }
    }
}

/// Build a verdict for a single classifier output.
pub(crate) fn single_verdict(scores: &[f32], labels: &[String]) -> StageResult<SessionOutcome> {
    if scores.len() != labels.len() {
        return Err(StageError::DimensionMismatch {
            left: labels.len(),
            right: scores.len(),
        });
    }
    Ok(match classify_scores(scores) {
        Some((class_index, confidence)) => SessionOutcome::Verdict(Verdict {
            class_index,
            label: labels[class_index].clone(),
            confidence,
            frames: 1,
        }),
        None => SessionOutcome::NoFramesAnalyzed,
    })
}

/// Fixed-duration accumulation of per-class scores.
#[derive(Debug)]
pub struct InferenceSession {
    started: Instant,
    duration: Duration,
    labels: Vec<String>,
    sums: Vec<f32>,
    frames: u32,
    finished: bool,
}

impl InferenceSession {
    pub fn new(duration: Duration, labels: Vec<String>) -> Self {
        Self::starting_at(Instant::now(), duration, labels)
    }

    pub fn starting_at(started: Instant, duration: Duration, labels: Vec<String>) -> Self {
        let sums = vec![0.0; labels.len()];
        Self {
            started,
            duration,
            labels,
            sums,
            frames: 0,
            finished: false,
        }
    }

    pub fn frames(&self) -> u32 {
        self.frames
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) >= self.duration
    }

    /// Add one frame's class scores. The score count must match the labels.
    /// Scores arriving after `finalize` are ignored.
    pub fn accumulate(&mut self, scores: &[f32]) -> StageResult<()> {
        if scores.len() != self.sums.len() {
            return Err(StageError::DimensionMismatch {
                left: self.sums.len(),
                right: scores.len(),
            });
        }
        if self.finished {
            return Ok(());
        }
        for (sum, score) in self.sums.iter_mut().zip(scores) {
            *sum += score;
        }
        self.frames += 1;
        Ok(())
    }

    /// Close the session: argmax over per-class means.
    pub fn finalize(&mut self) -> SessionOutcome {
        self.finished = true;
        if self.frames == 0 {
            return SessionOutcome::NoFramesAnalyzed;
        }
        let frames = self.frames as f32;
        let means: Vec<f32> = self.sums.iter().map(|sum| sum / frames).collect();
        match classify_scores(&means) {
            Some((class_index, confidence)) => SessionOutcome::Verdict(Verdict {
                class_index,
                label: self.labels[class_index].clone(),
                confidence,
                frames: self.frames,
            }),
            None => SessionOutcome::NoFramesAnalyzed,
        }
    }
}
