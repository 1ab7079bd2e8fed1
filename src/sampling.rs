//! Detection sampling gate.
//!
//! Detection is the most expensive stage, so it runs on every `interval`-th
//! frame by sequence number; the frames in between reuse tracked state. The
//! gate keys off sequence numbers rather than a local counter so that frames
//! dropped by the keep-latest mailbox still count towards the interval.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateDecision {
    RunDetection,
    ReuseTracked,
}

#[derive(Debug)]
pub struct SamplingGate {
    interval: u64,
    last_run: Option<u64>,
    last_seen: Option<u64>,
}

impl SamplingGate {
    /// `interval` is clamped to at least 1 (detect every frame).
    pub fn new(interval: u32) -> Self {
        Self {
            interval: interval.max(1) as u64,
            last_run: None,
            last_seen: None,
        }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Decide for the frame with sequence number `sequence`.
    ///
    /// The first frame always runs detection. A sequence number that goes
    /// backwards means the source restarted; the gate resets and runs.
    pub fn decide(&mut self, sequence: u64) -> GateDecision {
        let restarted = self.last_seen.is_some_and(|seen| sequence < seen);
        self.last_seen = Some(sequence);

        let due = match self.last_run {
            None => true,
            Some(_) if restarted => true,
            Some(last) => sequence - last >= self.interval,
        };
        if due {
            self.last_run = Some(sequence);
            GateDecision::RunDetection
        } else {
            GateDecision::ReuseTracked
        }
    }

    pub fn reset(&mut self) {
        self.last_run = None;
        self.last_seen = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runs(gate: &mut SamplingGate, seqs: impl IntoIterator<Item = u64>) -> Vec<u64> {
        seqs.into_iter()
            .filter(|&s| gate.decide(s) == GateDecision::RunDetection)
            .collect()
    }

    #[test]
    fn runs_every_nth_frame() {
        let mut gate = SamplingGate::new(5);
        assert_eq!(runs(&mut gate, 0..16), vec![0, 5, 10, 15]);
    }

    #[test]
    fn interval_of_one_runs_every_frame() {
        let mut gate = SamplingGate::new(1);
        assert_eq!(runs(&mut gate, 3..7), vec![3, 4, 5, 6]);
    }

    #[test]
    fn zero_interval_behaves_as_one() {
        let gate = SamplingGate::new(0);
        assert_eq!(gate.interval(), 1);
    }

    #[test]
    fn dropped_frames_still_count() {
        let mut gate = SamplingGate::new(4);
        // 1..3 and 5..7 were dropped upstream.
        assert_eq!(runs(&mut gate, [0, 3, 4, 7, 8, 9]), vec![0, 4, 8]);
    }

    #[test]
    fn sequence_restart_runs_detection() {
        let mut gate = SamplingGate::new(10);
        assert_eq!(gate.decide(100), GateDecision::RunDetection);
        assert_eq!(gate.decide(101), GateDecision::ReuseTracked);
        assert_eq!(gate.decide(0), GateDecision::RunDetection);
        assert_eq!(gate.decide(1), GateDecision::ReuseTracked);
    }
}
