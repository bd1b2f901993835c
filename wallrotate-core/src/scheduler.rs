//! The exclusive rotation slot.
//!
//! At most one rotation runs at a time. Requests that arrive while the slot
//! is busy are folded into a single pending request that runs once the
//! current rotation finishes. Retries of specific targets wait for the slot
//! instead of being merged, since they must not widen into a full rotation.

use log::{debug, error, info};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard, OwnedMutexGuard};

use crate::error::{Result, RotatorError};
use crate::model::{ScreenTarget, Trigger};
use crate::orchestrator::{RotationReport, Rotator};
use crate::services::{ConfigStore, ImageSource, WallpaperSink};

/// Work handed to the rotator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotJob {
    Trigger(Trigger),
    /// Rotate only these targets, skipping the unlock setting check.
    Targets(Vec<ScreenTarget>),
}

impl SlotJob {
    fn run<S: ConfigStore, I: ImageSource, W: WallpaperSink>(
        &self,
        rotator: &mut Rotator<S, I, W>,
    ) -> Result<Option<RotationReport>> {
        match self {
            SlotJob::Trigger(trigger) => rotator.handle_trigger(*trigger),
            SlotJob::Targets(targets) => rotator.run_rotation_targets(targets).map(Some),
        }
    }
}

/// One rotation executed by the slot.
#[derive(Debug)]
pub struct SlotRun {
    pub job: SlotJob,
    /// `Ok(None)` when the trigger was ignored (unlock with the setting off).
    pub result: Result<Option<RotationReport>>,
}

#[derive(Debug)]
pub enum SubmitOutcome {
    /// The caller ran the slot; includes follow-up runs it drained.
    Ran(Vec<SlotRun>),
    /// Another rotation was running; the request was merged into its queue.
    Coalesced,
}

/// Higher wins when two requests are merged.
fn precedence(trigger: Trigger) -> u8 {
    match trigger {
        Trigger::LockScreenOnly => 0,
        Trigger::Unlock => 1,
        Trigger::Scheduled | Trigger::Boot | Trigger::Manual => 2,
    }
}

fn merge(pending: Option<Trigger>, incoming: Trigger) -> Trigger {
    match pending {
        Some(current) if precedence(current) >= precedence(incoming) => current,
        _ => incoming,
    }
}

pub struct RotationSlot<S, I, W> {
    rotator: Arc<AsyncMutex<Rotator<S, I, W>>>,
    pending: Arc<Mutex<Option<Trigger>>>,
}

impl<S, I, W> Clone for RotationSlot<S, I, W> {
    fn clone(&self) -> Self {
        Self {
            rotator: Arc::clone(&self.rotator),
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<S, I, W> RotationSlot<S, I, W>
where
    S: ConfigStore + Send + 'static,
    I: ImageSource + Send + 'static,
    W: WallpaperSink + Send + 'static,
{
    pub fn new(rotator: Rotator<S, I, W>) -> Self {
        Self {
            rotator: Arc::new(AsyncMutex::new(rotator)),
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Wait for the slot and borrow the rotator, e.g. to edit settings.
    pub async fn lock(&self) -> MutexGuard<'_, Rotator<S, I, W>> {
        self.rotator.lock().await
    }

    pub fn is_busy(&self) -> bool {
        self.rotator.try_lock().is_err()
    }

    pub fn pending(&self) -> Option<Trigger> {
        *self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enqueue(&self, trigger: Trigger) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        *pending = Some(merge(*pending, trigger));
    }

    fn take_pending(&self) -> Option<Trigger> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Request a rotation.
    ///
    /// The request is queued first and then drained by whoever holds the
    /// slot, so a request landing while a rotation finishes is never lost.
    pub async fn submit(&self, trigger: Trigger) -> SubmitOutcome {
        self.enqueue(trigger);
        let mut runs = Vec::new();
        self.drain(&mut runs).await;

        if runs.is_empty() {
            debug!("Rotation already running, {:?} request coalesced", trigger);
            SubmitOutcome::Coalesced
        } else {
            SubmitOutcome::Ran(runs)
        }
    }

    /// Wait for the slot and run `job`, then any request queued meanwhile.
    pub async fn run_now(&self, job: SlotJob) -> Vec<SlotRun> {
        let guard = Arc::clone(&self.rotator).lock_owned().await;
        let mut runs = vec![Self::execute(guard, job).await];
        self.drain(&mut runs).await;
        runs
    }

    async fn drain(&self, runs: &mut Vec<SlotRun>) {
        loop {
            let guard = match Arc::clone(&self.rotator).try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => break,
            };
            let next = match self.take_pending() {
                Some(next) => next,
                None => {
                    drop(guard);
                    if self.pending().is_none() {
                        break;
                    }
                    continue;
                }
            };

            if !runs.is_empty() {
                info!("Running coalesced {:?} rotation", next);
            }
            runs.push(Self::execute(guard, SlotJob::Trigger(next)).await);
        }
    }

    async fn execute(guard: OwnedMutexGuard<Rotator<S, I, W>>, job: SlotJob) -> SlotRun {
        let task_job = job.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut rotator = guard;
            task_job.run(&mut *rotator)
        })
        .await
        .unwrap_or_else(|e| {
            error!("Rotation task failed: {}", e);
            Err(RotatorError::Interrupted(e.to_string()))
        });
        SlotRun { job, result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::RetryPolicy;
    use crate::model::{CropRect, DisplayMetrics, WallpaperConfig};
    use crate::storage::{MemoryStore, Settings};
    use crate::testing::{png_bytes, MemoryImageSource, RecordingSink};

    type TestRotator = Rotator<MemoryStore, MemoryImageSource, Arc<RecordingSink>>;

    fn rotator(sink: Arc<RecordingSink>) -> TestRotator {
        let mut settings = Settings::new(MemoryStore::new());
        settings
            .save_configs(&[
                WallpaperConfig::new("a.png", CropRect::FULL, 0.0)
                    .with_id(1)
                    .with_targets(true, true),
            ])
            .unwrap();
        let source = MemoryImageSource::new().with_image("a.png", png_bytes(32, 32));
        Rotator::new(settings.into_inner(), source, sink)
            .with_display(DisplayMetrics::new(16, 16).unwrap())
            .with_retry(RetryPolicy::none())
    }

    #[test]
    fn full_rotation_dominates_lock_only() {
        assert_eq!(merge(None, Trigger::LockScreenOnly), Trigger::LockScreenOnly);
        assert_eq!(merge(Some(Trigger::LockScreenOnly), Trigger::Scheduled), Trigger::Scheduled);
        assert_eq!(merge(Some(Trigger::Manual), Trigger::LockScreenOnly), Trigger::Manual);
        assert_eq!(merge(Some(Trigger::Unlock), Trigger::Manual), Trigger::Manual);
    }

    #[tokio::test]
    async fn free_slot_runs_immediately() {
        let sink = Arc::new(RecordingSink::new());
        let slot = RotationSlot::new(rotator(Arc::clone(&sink)));

        match slot.submit(Trigger::Manual).await {
            SubmitOutcome::Ran(runs) => {
                assert_eq!(runs.len(), 1);
                assert!(runs[0].result.as_ref().unwrap().as_ref().unwrap().is_success());
            }
            SubmitOutcome::Coalesced => panic!("slot was free"),
        }
        assert_eq!(sink.calls().len(), 2);
        assert!(!slot.is_busy());
    }

    #[tokio::test]
    async fn busy_slot_coalesces_into_one_follow_up() {
        let sink = Arc::new(RecordingSink::new());
        let slot = RotationSlot::new(rotator(Arc::clone(&sink)));

        let held = slot.lock().await;
        assert!(matches!(slot.submit(Trigger::LockScreenOnly).await, SubmitOutcome::Coalesced));
        assert!(matches!(slot.submit(Trigger::Scheduled).await, SubmitOutcome::Coalesced));
        assert!(matches!(slot.submit(Trigger::LockScreenOnly).await, SubmitOutcome::Coalesced));
        assert_eq!(slot.pending(), Some(Trigger::Scheduled));
        drop(held);

        match slot.submit(Trigger::LockScreenOnly).await {
            SubmitOutcome::Ran(runs) => {
                assert_eq!(runs.len(), 1);
                assert_eq!(runs[0].job, SlotJob::Trigger(Trigger::Scheduled));
            }
            SubmitOutcome::Coalesced => panic!("slot was released"),
        }
        assert_eq!(slot.pending(), None);
        assert_eq!(sink.calls().len(), 2);
    }

    #[tokio::test]
    async fn ignored_unlock_reports_none() {
        let sink = Arc::new(RecordingSink::new());
        let slot = RotationSlot::new(rotator(Arc::clone(&sink)));

        match slot.submit(Trigger::Unlock).await {
            SubmitOutcome::Ran(runs) => assert!(runs[0].result.as_ref().unwrap().is_none()),
            SubmitOutcome::Coalesced => panic!("slot was free"),
        }
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn target_job_waits_for_the_slot_then_drains_the_queue() {
        let sink = Arc::new(RecordingSink::new());
        let slot = RotationSlot::new(rotator(Arc::clone(&sink)));

        let held = slot.lock().await;
        assert!(matches!(slot.submit(Trigger::LockScreenOnly).await, SubmitOutcome::Coalesced));
        let waiting = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.run_now(SlotJob::Targets(vec![ScreenTarget::Lock])).await })
        };
        tokio::task::yield_now().await;
        assert!(sink.calls().is_empty());
        drop(held);

        let runs = waiting.await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].job, SlotJob::Targets(vec![ScreenTarget::Lock]));
        assert_eq!(runs[1].job, SlotJob::Trigger(Trigger::LockScreenOnly));
        assert!(sink.calls().iter().all(|c| c.target == ScreenTarget::Lock));
        assert_eq!(sink.calls().len(), 2);
        assert_eq!(slot.pending(), None);
    }
}
