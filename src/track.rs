//! Identity tracker.
//!
//! Associates detections with identities across frames by IoU, ages identities
//! that go unmatched, and evicts them once they exceed `max_lost_frames`.
//! Per-identity lifecycle: `New -> Tracked -> Lost -> evicted`.
//!
//! The tracker is the single writer of the identity registry. Detection
//! results (`update`) and liveness results (`apply_liveness`) both merge here;
//! the pipeline wraps it in a mutex shared by the detection worker and the
//! liveness pool.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::detect::{BoundingBox, Detection};
use crate::liveness::fusion::Classification;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TrackState {
    /// Created by the most recent detection pass.
    New,
    /// Matched by the most recent detection pass.
    Tracked,
    /// Missed at least one cycle; still eligible for matching.
    Lost,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackedIdentity {
    pub id: u64,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub liveness_score: Option<f32>,
    pub lost_frames: u32,
    /// Number of detection passes that matched this identity.
    pub hits: u32,
    /// Detection cycle that last refreshed the box.
    pub cycle: u64,
    #[serde(skip)]
    score_cycle: Option<u64>,
}

impl TrackedIdentity {
    pub fn state(&self) -> TrackState {
        if self.lost_frames > 0 {
            TrackState::Lost
        } else if self.hits <= 1 {
            TrackState::New
        } else {
            TrackState::Tracked
        }
    }

    pub fn classification(&self, threshold: f32) -> Classification {
        Classification::from_score(self.liveness_score, threshold)
    }

    /// Overlay text, e.g. `Real: 0.87`. Unscored identities read `Pending`.
    pub fn label(&self, threshold: f32) -> String {
        match self.liveness_score {
            Some(score) => format!("{}: {:.2}", self.classification(threshold), score),
            None => Classification::Pending.to_string(),
        }
    }
}

/// Liveness score computed for one identity during detection cycle `cycle`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LivenessResult {
    pub id: u64,
    pub cycle: u64,
    pub score: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackerConfig {
    /// Minimum IoU (exclusive) for a detection to match an identity.
    pub iou_threshold: f32,
    /// Identities whose `lost_frames` exceeds this are evicted.
    pub max_lost_frames: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            max_lost_frames: 50,
        }
    }
}

/// Outcome of one detection pass.
#[derive(Clone, Debug, Default)]
pub struct TrackUpdate {
    pub cycle: u64,
    /// Identities whose box was refreshed this cycle (matched or created).
    pub fresh: Vec<TrackedIdentity>,
    pub created: Vec<u64>,
    pub evicted: Vec<u64>,
}

#[derive(Debug)]
pub struct IdentityTracker {
    config: TrackerConfig,
    identities: BTreeMap<u64, TrackedIdentity>,
    next_id: u64,
    cycle: u64,
    closed: bool,
}

impl IdentityTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            identities: BTreeMap::new(),
            next_id: 1,
            cycle: 0,
            closed: false,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Number of completed detection passes.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&TrackedIdentity> {
        self.identities.get(&id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Merge one detection pass.
    ///
    /// Matching is greedy over all `(detection, identity)` pairs with IoU above
    /// the threshold, highest IoU first, ties broken by lowest identity id and
    /// then by detection order. Unmatched detections become new identities;
    /// unmatched identities age and may be evicted.
    pub fn update(&mut self, detections: &[Detection]) -> TrackUpdate {
        if self.closed {
            return TrackUpdate::default();
        }
        self.cycle += 1;
        let cycle = self.cycle;

        let mut pairs: Vec<(f32, u64, usize)> = Vec::new();
        for (index, detection) in detections.iter().enumerate() {
            for (id, identity) in &self.identities {
                let overlap = identity.bbox.iou(&detection.bbox);
                if overlap > self.config.iou_threshold {
                    pairs.push((overlap, *id, index));
                }
            }
        }
        pairs.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });

        let mut matched_ids = Vec::new();
        let mut detection_used = vec![false; detections.len()];
        for (_, id, index) in pairs {
            if detection_used[index] || matched_ids.contains(&id) {
                continue;
            }
            detection_used[index] = true;
            matched_ids.push(id);
            if let Some(identity) = self.identities.get_mut(&id) {
                identity.bbox = detections[index].bbox;
                identity.confidence = detections[index].confidence;
                identity.lost_frames = 0;
                identity.hits += 1;
                identity.cycle = cycle;
            }
        }

        let mut update = TrackUpdate {
            cycle,
            ..TrackUpdate::default()
        };

        let unmatched: Vec<u64> = self
            .identities
            .keys()
            .copied()
            .filter(|id| !matched_ids.contains(id))
            .collect();
        update.evicted = self.age_ids(&unmatched);

        for (index, detection) in detections.iter().enumerate() {
            if detection_used[index] {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            self.identities.insert(
                id,
                TrackedIdentity {
                    id,
                    bbox: detection.bbox,
                    confidence: detection.confidence,
                    liveness_score: None,
                    lost_frames: 0,
                    hits: 1,
                    cycle,
                    score_cycle: None,
                },
            );
            update.created.push(id);
        }

        update.fresh = self
            .identities
            .values()
            .filter(|identity| identity.cycle == cycle)
            .cloned()
            .collect();

        if !update.created.is_empty() || !update.evicted.is_empty() {
            log::debug!(
                "tracker cycle {}: created {:?}, evicted {:?}",
                cycle,
                update.created,
                update.evicted
            );
        }
        update
    }

    /// Age every identity by one frame without a detection pass (reused
    /// frames and failed detections). Returns evicted ids.
    pub fn age(&mut self) -> Vec<u64> {
        if self.closed {
            return Vec::new();
        }
        let ids: Vec<u64> = self.identities.keys().copied().collect();
        self.age_ids(&ids)
    }

    fn age_ids(&mut self, ids: &[u64]) -> Vec<u64> {
        let mut evicted = Vec::new();
        for id in ids {
            let Some(identity) = self.identities.get_mut(id) else {
                continue;
            };
            identity.lost_frames = identity.lost_frames.saturating_add(1);
            if identity.lost_frames > self.config.max_lost_frames {
                self.identities.remove(id);
                evicted.push(*id);
            }
        }
        evicted
    }

    /// Merge a liveness score. Results for evicted identities, or older than
    /// the score already applied, are ignored; re-applying the same result is
    /// a no-op. Returns whether the registry was changed or confirmed.
    pub fn apply_liveness(&mut self, result: &LivenessResult) -> bool {
        if self.closed {
            return false;
        }
        let Some(identity) = self.identities.get_mut(&result.id) else {
            return false;
        };
        if identity.score_cycle.is_some_and(|applied| result.cycle < applied) {
            return false;
        }
        identity.liveness_score = Some(result.score);
        identity.score_cycle = Some(result.cycle);
        true
    }

    /// Copy of identities with `lost_frames <= max_staleness`, ordered by id.
    pub fn snapshot(&self, max_staleness: u32) -> Vec<TrackedIdentity> {
        self.identities
            .values()
            .filter(|identity| identity.lost_frames <= max_staleness)
            .cloned()
            .collect()
    }

    /// Release the registry. Later updates and liveness results are ignored.
    pub fn close(&mut self) {
        self.closed = true;
        self.identities.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection {
            bbox: BoundingBox::new(x1, y1, x2, y2).unwrap(),
            confidence: 0.9,
        }
    }

    fn tracker(max_lost: u32) -> IdentityTracker {
        IdentityTracker::new(TrackerConfig {
            iou_threshold: 0.3,
            max_lost_frames: max_lost,
        })
    }

    #[test]
    fn unmatched_detections_get_fresh_ids() {
        let mut t = tracker(5);
        let update = t.update(&[det(0.1, 0.1, 0.2, 0.2), det(0.6, 0.6, 0.8, 0.8)]);
        assert_eq!(update.created, vec![1, 2]);
        assert_eq!(update.fresh.len(), 2);
        assert_eq!(t.get(1).unwrap().state(), TrackState::New);
    }

    #[test]
    fn overlapping_detection_keeps_identity() {
        let mut t = tracker(5);
        t.update(&[det(0.1, 0.1, 0.3, 0.3)]);
        let update = t.update(&[det(0.12, 0.1, 0.32, 0.3)]);
        assert!(update.created.is_empty());
        let identity = t.get(1).unwrap();
        assert_eq!(identity.state(), TrackState::Tracked);
        assert!((identity.bbox.x1() - 0.12).abs() < 1e-6);
    }

    #[test]
    fn ties_prefer_lowest_existing_id() {
        let mut t = tracker(5);
        // Two identical identities, one detection matching both equally.
        t.update(&[det(0.1, 0.1, 0.3, 0.3)]);
        t.update(&[det(0.1, 0.1, 0.3, 0.3), det(0.1, 0.1, 0.3, 0.3)]);
        assert_eq!(t.len(), 2);
        let update = t.update(&[det(0.1, 0.1, 0.3, 0.3)]);
        assert_eq!(update.fresh.len(), 1);
        assert_eq!(update.fresh[0].id, 1);
        assert_eq!(t.get(2).unwrap().lost_frames, 1);
    }

    #[test]
    fn highest_overlap_wins_contention() {
        let mut t = tracker(5);
        t.update(&[det(0.1, 0.1, 0.3, 0.3)]);
        // Second detection overlaps identity 1 more than the first one does.
        let update = t.update(&[det(0.15, 0.1, 0.35, 0.3), det(0.11, 0.1, 0.31, 0.3)]);
        assert_eq!(update.created, vec![2]);
        assert!((t.get(1).unwrap().bbox.x1() - 0.11).abs() < 1e-6);
    }

    #[test]
    fn identity_is_evicted_after_max_lost_frames() {
        let mut t = tracker(2);
        t.update(&[det(0.1, 0.1, 0.3, 0.3)]);
        assert!(t.age().is_empty());
        assert!(t.age().is_empty());
        assert_eq!(t.get(1).unwrap().state(), TrackState::Lost);
        assert_eq!(t.age(), vec![1]);
        assert!(t.is_empty());
    }

    #[test]
    fn evicted_ids_are_never_reused() {
        let mut t = tracker(0);
        t.update(&[det(0.1, 0.1, 0.3, 0.3)]);
        let update = t.update(&[]);
        assert_eq!(update.evicted, vec![1]);
        let update = t.update(&[det(0.1, 0.1, 0.3, 0.3)]);
        assert_eq!(update.created, vec![2]);
    }

    #[test]
    fn lost_identity_can_be_reacquired() {
        let mut t = tracker(10);
        t.update(&[det(0.1, 0.1, 0.3, 0.3)]);
        t.age();
        t.age();
        let update = t.update(&[det(0.1, 0.1, 0.3, 0.3)]);
        assert!(update.created.is_empty());
        assert_eq!(t.get(1).unwrap().lost_frames, 0);
    }

    #[test]
    fn liveness_is_idempotent_and_ignores_stale_results() {
        let mut t = tracker(5);
        t.update(&[det(0.1, 0.1, 0.3, 0.3)]);
        t.update(&[det(0.1, 0.1, 0.3, 0.3)]);

        let newer = LivenessResult {
            id: 1,
            cycle: 2,
            score: 0.8,
        };
        assert!(t.apply_liveness(&newer));
        let once = t.get(1).unwrap().clone();
        assert!(t.apply_liveness(&newer));
        assert_eq!(t.get(1).unwrap(), &once);

        let older = LivenessResult {
            id: 1,
            cycle: 1,
            score: 0.1,
        };
        assert!(!t.apply_liveness(&older));
        assert_eq!(t.get(1).unwrap().liveness_score, Some(0.8));
    }

    #[test]
    fn liveness_for_unknown_identity_is_ignored() {
        let mut t = tracker(5);
        assert!(!t.apply_liveness(&LivenessResult {
            id: 42,
            cycle: 1,
            score: 0.5,
        }));
    }

    #[test]
    fn snapshot_filters_by_staleness() {
        let mut t = tracker(10);
        t.update(&[det(0.1, 0.1, 0.3, 0.3)]);
        t.update(&[det(0.1, 0.1, 0.3, 0.3), det(0.6, 0.6, 0.8, 0.8)]);
        t.update(&[det(0.6, 0.6, 0.8, 0.8)]);
        assert_eq!(t.snapshot(0).iter().map(|i| i.id).collect::<Vec<_>>(), vec![2]);
        assert_eq!(t.snapshot(1).len(), 2);
    }

    #[test]
    fn closed_tracker_ignores_mutation() {
        let mut t = tracker(5);
        t.update(&[det(0.1, 0.1, 0.3, 0.3)]);
        t.close();
        assert!(t.update(&[det(0.1, 0.1, 0.3, 0.3)]).fresh.is_empty());
        assert!(!t.apply_liveness(&LivenessResult {
            id: 1,
            cycle: 1,
            score: 0.5,
        }));
        assert!(t.is_empty());
    }

    #[test]
    fn label_formats_classification() {
        let mut t = tracker(5);
        t.update(&[det(0.1, 0.1, 0.3, 0.3)]);
        t.apply_liveness(&LivenessResult {
            id: 1,
            cycle: 1,
            score: 0.873,
        });
        assert_eq!(t.get(1).unwrap().label(0.5), "Real: 0.87");
        t.update(&[det(0.1, 0.1, 0.3, 0.3), det(0.6, 0.6, 0.8, 0.8)]);
        assert_eq!(t.get(2).unwrap().label(0.5), "Pending");
    }
}
