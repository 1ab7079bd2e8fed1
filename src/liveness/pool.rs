//! Bounded liveness worker pool.
//!
//! Jobs go through a bounded channel. `submit` never blocks: when every
//! worker is busy and the queue is full the job is dropped and counted.
//! Each worker owns its own scorer, resolved from the provider chain at
//! startup, and merges results into the tracker under its mutex.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use super::{LivenessScorer, WARM_UP_RUNS};
use crate::config::LivenessConfig;
use crate::detect::{LivenessModel, ProviderChain};
use crate::frame::PixelBuffer;
use crate::stats::PipelineStats;
use crate::track::{IdentityTracker, LivenessResult};

/// A face crop to score for identity `id`, cut during detection cycle `cycle`.
pub struct LivenessJob {
    pub id: u64,
    pub cycle: u64,
    pub crop: PixelBuffer,
}

pub struct LivenessPool {
    sender: Option<Sender<LivenessJob>>,
    workers: Vec<JoinHandle<()>>,
    cancelled: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    provider: String,
}

impl LivenessPool {
    /// Resolve and warm up one scorer per worker, then spawn the workers.
    ///
    /// Fails if any worker cannot obtain a working model; the caller treats
    /// that as the liveness stage being unavailable.
    pub fn start(
        chain: &ProviderChain<Box<dyn LivenessModel>>,
        config: &LivenessConfig,
        tracker: Arc<Mutex<IdentityTracker>>,
        stats: Arc<PipelineStats>,
    ) -> Result<Self> {
        let mut scorers = Vec::with_capacity(config.workers);
        let mut providers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let (provider, model) = chain
                .resolve()
                .with_context(|| format!("liveness worker {}", index))?;
            let mut scorer = LivenessScorer::new(model, config.input_width, config.input_height)
                .map_err(|e| anyhow!("liveness worker {}: {}", index, e))?;
            scorer
                .warm_up(WARM_UP_RUNS)
                .map_err(|e| anyhow!("liveness worker {} warm-up via '{}': {}", index, provider, e))?;
            scorers.push(scorer);
            providers.push(provider);
        }

        let (sender, receiver) = bounded::<LivenessJob>(config.queue_capacity);
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(scorers.len());
        for (index, scorer) in scorers.into_iter().enumerate() {
            let receiver = receiver.clone();
            let tracker = Arc::clone(&tracker);
            let stats = Arc::clone(&stats);
            let cancelled = Arc::clone(&cancelled);
            let handle = thread::Builder::new()
                .name(format!("liveness-{}", index))
                .spawn(move || worker_loop(scorer, receiver, tracker, stats, cancelled))
                .context("failed to spawn liveness worker")?;
            workers.push(handle);
        }

        log::info!(
            "liveness pool started: {} workers, queue capacity {}",
            workers.len(),
            config.queue_capacity
        );
        providers.dedup();
        Ok(Self {
            sender: Some(sender),
            workers,
            cancelled,
            stats,
            provider: providers.join(","),
        })
    }

    /// Provider used by each worker, comma separated.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Queue a job without blocking. Returns false if it was dropped.
    pub fn submit(&self, job: LivenessJob) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        match sender.try_send(job) {
            Ok(()) => {
                self.stats.liveness_submitted();
                true
            }
            Err(TrySendError::Full(job)) => {
                self.stats.liveness_dropped();
                log::debug!("liveness queue full, dropping identity {}", job.id);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Stop accepting jobs, discard queued ones and join the workers. A job
    /// already being scored finishes first.
    pub fn shutdown(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("liveness worker panicked");
            }
        }
    }
}

impl Drop for LivenessPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    mut scorer: LivenessScorer,
    receiver: Receiver<LivenessJob>,
    tracker: Arc<Mutex<IdentityTracker>>,
    stats: Arc<PipelineStats>,
    cancelled: Arc<AtomicBool>,
) {
    for job in receiver.iter() {
        if cancelled.load(Ordering::SeqCst) {
            break;
        }
        let score = match scorer.score(&job.crop) {
            Ok(score) => score,
            Err(err) => {
                stats.liveness_failed();
                log::warn!("liveness scoring failed for identity {}: {}", job.id, err);
                continue;
            }
        };
        let result = LivenessResult {
            id: job.id,
            cycle: job.cycle,
            score,
        };
        match tracker.lock() {
            Ok(mut tracker) => {
                tracker.apply_liveness(&result);
            }
            Err(_) => {
                log::error!("tracker lock poisoned; liveness worker exiting");
                break;
            }
        }
        stats.liveness_completed();
    }
    log::debug!("liveness worker '{}' stopped", scorer.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use crate::detect::{BoundingBox, Detection, StubLivenessModel};
    use crate::error::StageResult;
    use crate::tensor::{QuantParams, Tensor};
    use crate::track::TrackerConfig;

    fn config(workers: usize, queue_capacity: usize) -> LivenessConfig {
        LivenessConfig {
            workers,
            queue_capacity,
            input_width: 16,
            input_height: 16,
            ..LivenessConfig::default()
        }
    }

    fn stub_chain() -> ProviderChain<Box<dyn LivenessModel>> {
        ProviderChain::single("stub", || {
            Ok(Box::new(StubLivenessModel::new()) as Box<dyn LivenessModel>)
        })
    }

    fn tracker_with_identity() -> Arc<Mutex<IdentityTracker>> {
        let mut tracker = IdentityTracker::new(TrackerConfig::default());
        tracker.update(&[Detection {
            bbox: BoundingBox::new(0.1, 0.1, 0.4, 0.4).unwrap(),
            confidence: 0.9,
        }]);
        Arc::new(Mutex::new(tracker))
    }

    fn wait_for(stats: &PipelineStats, done: impl Fn(&crate::stats::StatsSnapshot) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done(&stats.snapshot()) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    /// Blocks on bright crops until released; gray warm-up frames pass.
    struct Gated {
        started: Sender<()>,
        release: Receiver<()>,
    }

    impl LivenessModel for Gated {
        fn name(&self) -> &'static str {
            "gated"
        }

        fn input_quant(&self) -> QuantParams {
            QuantParams::new(1.0 / 255.0, 0)
        }

        fn output_quant(&self) -> QuantParams {
            QuantParams::new(1.0 / 255.0, 0)
        }

        fn score(&mut self, input: &Tensor) -> StageResult<u8> {
            let first = input.as_u8().and_then(|v| v.first().copied()).unwrap_or(0);
            if first > 200 {
                let _ = self.started.send(());
                let _ = self.release.recv();
            }
            Ok(first)
        }
    }

    #[test]
    fn scored_job_updates_tracker() -> Result<()> {
        let tracker = tracker_with_identity();
        let stats = Arc::new(PipelineStats::default());
        let mut pool = LivenessPool::start(&stub_chain(), &config(2, 4), tracker.clone(), stats.clone())?;
        assert!(pool.submit(LivenessJob {
            id: 1,
            cycle: 1,
            crop: PixelBuffer::filled(8, 8, [240, 240, 240])?,
        }));
        assert!(wait_for(&stats, |s| s.liveness_completed == 1));
        pool.shutdown();

        let guard = tracker.lock().unwrap();
        assert!(guard.get(1).unwrap().liveness_score.unwrap() > 0.9);
        Ok(())
    }

    #[test]
    fn full_queue_drops_new_jobs() -> Result<()> {
        let (started_tx, started_rx) = bounded(4);
        let (release_tx, release_rx) = bounded::<()>(4);
        let chain: ProviderChain<Box<dyn LivenessModel>> = ProviderChain::single("gated", move || {
            Ok(Box::new(Gated {
                started: started_tx.clone(),
                release: release_rx.clone(),
            }) as Box<dyn LivenessModel>)
        });
        let stats = Arc::new(PipelineStats::default());
        let mut pool = LivenessPool::start(&chain, &config(1, 1), tracker_with_identity(), stats.clone())?;
        let job = || -> Result<LivenessJob> {
            Ok(LivenessJob {
                id: 1,
                cycle: 1,
                crop: PixelBuffer::filled(8, 8, [250, 250, 250])?,
            })
        };

        assert!(pool.submit(job()?));
        started_rx.recv_timeout(Duration::from_secs(5))?;
        // Worker is busy: one job fits in the queue, the next is dropped.
        assert!(pool.submit(job()?));
        assert!(!pool.submit(job()?));
        assert_eq!(stats.snapshot().liveness_dropped, 1);

        release_tx.send(())?;
        release_tx.send(())?;
        assert!(wait_for(&stats, |s| s.liveness_completed == 2));
        pool.shutdown();
        Ok(())
    }

    #[test]
    fn startup_fails_without_a_working_provider() {
        let chain: ProviderChain<Box<dyn LivenessModel>> =
            ProviderChain::single("missing", || Err(anyhow!("model file not found")));
        let result = LivenessPool::start(
            &chain,
            &config(2, 4),
            tracker_with_identity(),
            Arc::new(PipelineStats::default()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn submit_after_shutdown_is_rejected() -> Result<()> {
        let stats = Arc::new(PipelineStats::default());
        let mut pool = LivenessPool::start(&stub_chain(), &config(1, 1), tracker_with_identity(), stats)?;
        pool.shutdown();
        assert!(!pool.submit(LivenessJob {
            id: 1,
            cycle: 1,
            crop: PixelBuffer::filled(4, 4, [0, 0, 0])?,
        }));
        Ok(())
    }
}
