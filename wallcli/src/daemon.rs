use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use wallrotate_core::{
    DesktopWallpaperSink, JobResult, JsonFileStore, LocalImageSource, RotationSlot, Scheduler, SlotJob, SlotRun,
    SubmitOutcome, Trigger,
};

use crate::app::CliRotator;

type CliSlot = RotationSlot<JsonFileStore, LocalImageSource, DesktopWallpaperSink>;

/// Wait before re-running a job that asked for a retry.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Tokio-backed host scheduler: one periodic task plus delayed one-off triggers,
/// all delivered over a single channel.
#[derive(Clone)]
pub struct IntervalScheduler {
    tx: UnboundedSender<Trigger>,
    periodic: Arc<Mutex<Option<JoinHandle<()>>>>,
    once: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl IntervalScheduler {
    pub fn new() -> (Self, UnboundedReceiver<Trigger>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            tx,
            periodic: Arc::new(Mutex::new(None)),
            once: Arc::new(Mutex::new(Vec::new())),
        };
        (scheduler, rx)
    }
}

impl Scheduler for IntervalScheduler {
    fn schedule_periodic(&self, interval: Duration) -> Result<()> {
        let handle = Handle::try_current().context("Periodic rotation needs a tokio runtime")?;
        let tx = self.tx.clone();
        let task = handle.spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(Trigger::Scheduled).is_err() {
                    break;
                }
            }
        });

        let mut periodic = self.periodic.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = periodic.replace(task) {
            previous.abort();
        }
        info!("Periodic rotation every {} minute(s)", interval.as_secs() / 60);
        Ok(())
    }

    fn schedule_once(&self, trigger: Trigger, delay: Duration) -> Result<()> {
        if delay.is_zero() {
            return self.tx.send(trigger).context("Trigger channel closed");
        }
        let handle = Handle::try_current().context("Delayed rotation needs a tokio runtime")?;
        let tx = self.tx.clone();
        let task = handle.spawn(async move {
            sleep(delay).await;
            let _ = tx.send(trigger);
        });
        let mut once = self.once.lock().unwrap_or_else(|e| e.into_inner());
        once.retain(|t| !t.is_finished());
        once.push(task);
        Ok(())
    }

    fn cancel(&self) -> Result<()> {
        if let Some(task) = self.periodic.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        for task in self.once.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonCommand {
    Fire(Trigger),
    Stop,
}

/// Parse one line typed on the daemon's stdin.
pub fn parse_command(line: &str) -> Option<DaemonCommand> {
    match line.trim().to_lowercase().as_str() {
        "rotate" | "next" => Some(DaemonCommand::Fire(Trigger::Manual)),
        "lock" => Some(DaemonCommand::Fire(Trigger::LockScreenOnly)),
        "unlock" => Some(DaemonCommand::Fire(Trigger::Unlock)),
        "stop" | "quit" | "exit" => Some(DaemonCommand::Stop),
        _ => None,
    }
}

/// Run rotations until `stop` or end of input.
pub async fn run_daemon(rotator: CliRotator) -> Result<()> {
    let interval_minutes = rotator.settings().rotation_interval()?;
    let has_configs = !rotator.settings().configs()?.is_empty();

    let slot = RotationSlot::new(rotator);
    let (scheduler, mut triggers) = IntervalScheduler::new();

    if has_configs {
        scheduler.schedule_periodic(Duration::from_secs(u64::from(interval_minutes) * 60))?;
        scheduler.schedule_once(Trigger::Boot, Duration::ZERO)?;
    } else {
        warn!("No wallpaper configurations found, periodic rotation not scheduled");
    }

    println!("wallcli daemon running. Commands: rotate, lock, unlock, stop");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            Some(trigger) = triggers.recv() => {
                tokio::spawn(run_job(slot.clone(), trigger));
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("Input closed, stopping daemon");
                    break;
                };
                match parse_command(&line) {
                    Some(DaemonCommand::Fire(trigger)) => scheduler.schedule_once(trigger, Duration::ZERO)?,
                    Some(DaemonCommand::Stop) => break,
                    None if line.trim().is_empty() => {}
                    None => println!("Unknown command '{}'. Commands: rotate, lock, unlock, stop", line.trim()),
                }
            }
        }
    }

    scheduler.cancel()?;
    // Let a rotation in progress finish before the runtime shuts down.
    drop(slot.lock().await);
    println!("Exiting wallcli daemon...");
    Ok(())
}

async fn run_job(slot: CliSlot, trigger: Trigger) {
    if let SubmitOutcome::Ran(runs) = slot.submit(trigger).await {
        handle_runs(&slot, runs, 0);
    }
}

async fn retry_later(slot: CliSlot, job: SlotJob, attempt: u32) {
    sleep(RETRY_BACKOFF).await;
    let runs = slot.run_now(job).await;
    handle_runs(&slot, runs, attempt);
}

/// `first_attempt` applies to the first run only; drained follow-ups are fresh.
fn handle_runs(slot: &CliSlot, runs: Vec<SlotRun>, first_attempt: u32) {
    for (i, run) in runs.iter().enumerate() {
        let attempt = if i == 0 { first_attempt } else { 0 };
        if let Some(job) = retry_job(run, attempt) {
            info!(
                "Retrying {:?} in {}s (attempt {})",
                job,
                RETRY_BACKOFF.as_secs(),
                attempt + 2
            );
            tokio::spawn(retry_later(slot.clone(), job, attempt + 1));
        }
    }
}

/// What to run again after `run`, if anything.
///
/// A partly failed rotation is retried for its failed targets only, so a
/// target that already applied does not advance again. A run that failed
/// before touching any target is retried as it was.
pub fn retry_job(run: &SlotRun, attempt: u32) -> Option<SlotJob> {
    let (verdict, job) = match &run.result {
        Ok(Some(report)) => (
            JobResult::from_report(report, attempt),
            SlotJob::Targets(report.failed_targets()),
        ),
        Ok(None) => return None,
        Err(e) => (JobResult::from_error(e, attempt), run.job.clone()),
    };
    match verdict {
        JobResult::Success => None,
        JobResult::Retry => Some(job),
        JobResult::Failure => {
            error!("Rotation for {:?} failed, waiting for the next trigger", run.job);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wallrotate_core::orchestrator::TargetOutcome;
    use wallrotate_core::{RotationReport, RotatorError, ScreenTarget, SinkError, TargetStatus};

    fn run_with(statuses: Vec<(ScreenTarget, TargetStatus)>) -> SlotRun {
        let report = RotationReport {
            started_at: Utc::now(),
            lock_only: false,
            outcomes: statuses
                .into_iter()
                .map(|(target, status)| TargetOutcome { target, status })
                .collect(),
        };
        SlotRun {
            job: SlotJob::Trigger(Trigger::Scheduled),
            result: Ok(Some(report)),
        }
    }

    fn busy() -> TargetStatus {
        TargetStatus::Failed(RotatorError::Apply {
            attempts: 3,
            source: SinkError::Io("busy".into()),
        })
    }

    #[test]
    fn partial_failure_retries_only_the_failed_target() {
        let run = run_with(vec![
            (
                ScreenTarget::Home,
                TargetStatus::Applied {
                    config_id: 1,
                    index: 0,
                    persisted_index: Some(0),
                },
            ),
            (ScreenTarget::Lock, busy()),
        ]);
        assert_eq!(retry_job(&run, 0), Some(SlotJob::Targets(vec![ScreenTarget::Lock])));
        assert_eq!(retry_job(&run, 2), None);
    }

    #[test]
    fn settings_failure_retries_the_whole_job() {
        let run = SlotRun {
            job: SlotJob::Trigger(Trigger::LockScreenOnly),
            result: Err(RotatorError::Store("settings locked".into())),
        };
        assert_eq!(retry_job(&run, 0), Some(SlotJob::Trigger(Trigger::LockScreenOnly)));
        let failed = run_with(vec![(ScreenTarget::Home, busy())]);
        assert_eq!(retry_job(&failed, 0), Some(SlotJob::Targets(vec![ScreenTarget::Home])));
    }

    #[test]
    fn completed_and_ignored_runs_are_not_retried() {
        assert_eq!(retry_job(&run_with(vec![]), 0), None);
        let ignored = SlotRun {
            job: SlotJob::Trigger(Trigger::Unlock),
            result: Ok(None),
        };
        assert_eq!(retry_job(&ignored, 0), None);
    }

    #[test]
    fn parses_stdin_commands() {
        assert_eq!(parse_command("rotate\n"), Some(DaemonCommand::Fire(Trigger::Manual)));
        assert_eq!(parse_command(" LOCK "), Some(DaemonCommand::Fire(Trigger::LockScreenOnly)));
        assert_eq!(parse_command("unlock"), Some(DaemonCommand::Fire(Trigger::Unlock)));
        assert_eq!(parse_command("stop"), Some(DaemonCommand::Stop));
        assert_eq!(parse_command("dance"), None);
    }

    #[tokio::test]
    async fn immediate_trigger_is_delivered() {
        let (scheduler, mut rx) = IntervalScheduler::new();
        scheduler.schedule_once(Trigger::Manual, Duration::ZERO).unwrap();
        assert_eq!(rx.recv().await, Some(Trigger::Manual));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_ticks_until_cancelled() {
        let (scheduler, mut rx) = IntervalScheduler::new();
        scheduler.schedule_periodic(Duration::from_secs(60)).unwrap();
        scheduler.schedule_once(Trigger::Boot, Duration::from_secs(90)).unwrap();

        assert_eq!(rx.recv().await, Some(Trigger::Scheduled));
        assert_eq!(rx.recv().await, Some(Trigger::Boot));
        assert_eq!(rx.recv().await, Some(Trigger::Scheduled));

        scheduler.cancel().unwrap();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn scheduling_without_runtime_is_an_error() {
        let (scheduler, _rx) = IntervalScheduler::new();
        assert!(scheduler.schedule_periodic(Duration::from_secs(60)).is_err());
        assert!(scheduler.schedule_once(Trigger::Manual, Duration::from_secs(1)).is_err());
    }
}
