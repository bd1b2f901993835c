//! One rotation cycle across the home and lock screens.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::applier::{RetryPolicy, WallpaperApplier};
use crate::error::{Result, RotatorError};
use crate::model::{DisplayMetrics, RotationMode, ScreenTarget, Trigger, WallpaperConfig};
use crate::selector::select;
use crate::services::{ConfigStore, ImageSource, WallpaperSink};
use crate::storage::Settings;

/// A scheduled job is given up after this many runs.
pub const MAX_RUN_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotatorState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No config targets this screen.
    NoEligibleConfig,
    /// The platform has no separate surface for this screen.
    Unsupported,
}

#[derive(Debug, Clone)]
pub enum TargetStatus {
    Applied {
        config_id: i64,
        /// Position within the target's eligible list.
        index: usize,
        /// Index written to settings, `None` in random mode.
        persisted_index: Option<i64>,
    },
    Skipped(SkipReason),
    Failed(RotatorError),
}

#[derive(Debug, Clone)]
pub struct TargetOutcome {
    pub target: ScreenTarget,
    pub status: TargetStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStatus {
    /// Every attempted target succeeded, including the nothing-to-do case.
    Completed,
    /// At least one target applied and at least one failed.
    Partial,
    /// Every attempted target failed.
    Failed,
}

#[derive(Debug, Clone)]
pub struct RotationReport {
    pub started_at: DateTime<Utc>,
    pub lock_only: bool,
    pub outcomes: Vec<TargetOutcome>,
}

impl RotationReport {
    fn new(lock_only: bool) -> Self {
        Self {
            started_at: Utc::now(),
            lock_only,
            outcomes: Vec::new(),
        }
    }

    pub fn status(&self) -> RotationStatus {
        let applied = self.applied().count();
        let failed = self.failures().count();
        match (applied, failed) {
            (_, 0) => RotationStatus::Completed,
            (0, _) => RotationStatus::Failed,
            _ => RotationStatus::Partial,
        }
    }

    pub fn applied(&self) -> impl Iterator<Item = &TargetOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, TargetStatus::Applied { .. }))
    }

    pub fn failures(&self) -> impl Iterator<Item = (ScreenTarget, &RotatorError)> {
        self.outcomes.iter().filter_map(|o| match &o.status {
            TargetStatus::Failed(err) => Some((o.target, err)),
            _ => None,
        })
    }

    /// Targets to run again after a retriable partial failure. Targets
    /// that applied are left out so their rotation does not advance twice.
    pub fn failed_targets(&self) -> Vec<ScreenTarget> {
        self.failures().map(|(target, _)| target).collect()
    }

    pub fn outcome(&self, target: ScreenTarget) -> Option<&TargetStatus> {
        self.outcomes.iter().find(|o| o.target == target).map(|o| &o.status)
    }

    pub fn is_success(&self) -> bool {
        self.status() == RotationStatus::Completed
    }
}

/// What the host scheduler should do with a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResult {
    Success,
    Retry,
    Failure,
}

impl JobResult {
    /// Map a report to a scheduler verdict. `run_attempt` counts from 0.
    ///
    /// Access and decode failures are terminal; they need the user to
    /// re-grant access or replace the image.
    pub fn from_report(report: &RotationReport, run_attempt: u32) -> Self {
        if report.is_success() {
            return JobResult::Success;
        }
        if report.failures().any(|(_, err)| !err.is_retriable()) {
            return JobResult::Failure;
        }
        if run_attempt + 1 < MAX_RUN_ATTEMPTS {
            JobResult::Retry
        } else {
            JobResult::Failure
        }
    }

    /// Verdict for a run that could not even load its settings.
    pub fn from_error(err: &RotatorError, run_attempt: u32) -> Self {
        if err.is_retriable() && run_attempt + 1 < MAX_RUN_ATTEMPTS {
            JobResult::Retry
        } else {
            JobResult::Failure
        }
    }
}

/// Picks and applies the next wallpaper for each screen.
///
/// Holds the settings store for the duration of a run; callers serialize
/// runs (see `scheduler::RotationSlot`).
pub struct Rotator<S, I, W> {
    settings: Settings<S>,
    applier: WallpaperApplier<I, W>,
    display: Option<DisplayMetrics>,
    rng: StdRng,
    state: RotatorState,
}

impl<S: ConfigStore, I: ImageSource, W: WallpaperSink> Rotator<S, I, W> {
    pub fn new(store: S, source: I, sink: W) -> Self {
        Self {
            settings: Settings::new(store),
            applier: WallpaperApplier::new(source, sink),
            display: None,
            rng: StdRng::from_entropy(),
            state: RotatorState::Idle,
        }
    }

    /// Use a fixed display size instead of the stored one.
    pub fn with_display(mut self, display: DisplayMetrics) -> Self {
        self.display = Some(display);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.applier = self.applier.with_retry(retry);
        self
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn state(&self) -> RotatorState {
        self.state
    }

    pub fn settings(&self) -> &Settings<S> {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings<S> {
        &mut self.settings
    }

    pub fn applier(&self) -> &WallpaperApplier<I, W> {
        &self.applier
    }

    /// React to a trigger. Returns `None` when the trigger is ignored.
    pub fn handle_trigger(&mut self, trigger: Trigger) -> Result<Option<RotationReport>> {
        if trigger == Trigger::Unlock && !self.settings.change_on_unlock()? {
            debug!("Ignoring unlock, change on unlock is disabled");
            return Ok(None);
        }
        info!("Rotation triggered by {:?}", trigger);
        self.run_rotation(trigger.lock_only()).map(Some)
    }

    /// Rotate every screen (or only the lock screen).
    ///
    /// An advanced sequential index is persisted right after its wallpaper
    /// was applied, so a failing target keeps its old index while the other
    /// target's progress is kept.
    pub fn run_rotation(&mut self, lock_only: bool) -> Result<RotationReport> {
        let targets: &[ScreenTarget] = if lock_only {
            &[ScreenTarget::Lock]
        } else {
            &ScreenTarget::ALL
        };
        self.run_rotation_targets(targets)
    }

    /// Rotate only `targets`, e.g. the ones a previous run failed on.
    pub fn run_rotation_targets(&mut self, targets: &[ScreenTarget]) -> Result<RotationReport> {
        self.state = RotatorState::Running;
        let result = self.rotate(targets);
        self.state = RotatorState::Idle;

        match &result {
            Ok(report) => match report.status() {
                RotationStatus::Completed => info!("Wallpaper rotation successful"),
                RotationStatus::Partial => warn!("Wallpaper rotation partially failed"),
                RotationStatus::Failed => error!("Wallpaper rotation failed"),
            },
            Err(e) => error!("Error rotating wallpaper: {}", e),
        }
        result
    }

    fn rotate(&mut self, targets: &[ScreenTarget]) -> Result<RotationReport> {
        let mut report = RotationReport::new(targets == [ScreenTarget::Lock]);
        let configs = self.settings.configs().map_err(RotatorError::from)?;
        if configs.is_empty() {
            warn!("No wallpaper configurations found");
            return Ok(report);
        }

        let mode = self.settings.rotation_mode().map_err(RotatorError::from)?;
        let display = match self.display {
            Some(display) => display,
            None => self.settings.display().map_err(RotatorError::from)?,
        };

        for &target in targets {
            let status = self.rotate_target(&configs, target, mode, display);
            report.outcomes.push(TargetOutcome { target, status });
        }
        Ok(report)
    }

    fn rotate_target(
        &mut self,
        configs: &[WallpaperConfig],
        target: ScreenTarget,
        mode: RotationMode,
        display: DisplayMetrics,
    ) -> TargetStatus {
        let eligible: Vec<&WallpaperConfig> = configs.iter().filter(|c| c.applies_to(target)).collect();
        if eligible.is_empty() {
            debug!("No configs for {} screen", target);
            return TargetStatus::Skipped(SkipReason::NoEligibleConfig);
        }
        if !self.applier.sink().supports(target) {
            warn!("{} screen is not supported by this platform, skipping", target);
            return TargetStatus::Skipped(SkipReason::Unsupported);
        }

        let prior = match self.settings.last_index(target) {
            Ok(index) => index,
            Err(e) => return TargetStatus::Failed(e.into()),
        };
        let selection = match select(&eligible, mode, prior, &mut self.rng) {
            Some(selection) => selection,
            None => return TargetStatus::Skipped(SkipReason::NoEligibleConfig),
        };
        info!(
            "Changing {} screen to config {} ({} of {}, {})",
            target,
            selection.config.id,
            selection.position + 1,
            eligible.len(),
            mode
        );

        if let Err(e) = self.applier.apply(selection.config, target, display) {
            error!("Error setting {} wallpaper: {}", target, e);
            return TargetStatus::Failed(e);
        }

        let mut persisted_index = None;
        if let Some(next) = selection.next_index {
            match self.settings.set_last_index(target, next) {
                Ok(()) => persisted_index = Some(next),
                Err(e) => error!("Failed to persist {} rotation index {}: {:#}", target, next, e),
            }
        }

        TargetStatus::Applied {
            config_id: selection.config.id,
            index: selection.position,
            persisted_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;

    fn report_with(statuses: Vec<(ScreenTarget, TargetStatus)>) -> RotationReport {
        RotationReport {
            started_at: Utc::now(),
            lock_only: false,
            outcomes: statuses
                .into_iter()
                .map(|(target, status)| TargetOutcome { target, status })
                .collect(),
        }
    }

    fn applied() -> TargetStatus {
        TargetStatus::Applied {
            config_id: 1,
            index: 0,
            persisted_index: Some(0),
        }
    }

    fn apply_error() -> RotatorError {
        RotatorError::Apply {
            attempts: 3,
            source: SinkError::Io("busy".into()),
        }
    }

    #[test]
    fn empty_report_is_completed() {
        let report = report_with(vec![]);
        assert_eq!(report.status(), RotationStatus::Completed);
        assert_eq!(JobResult::from_report(&report, 0), JobResult::Success);
    }

    #[test]
    fn skipped_targets_do_not_count_as_failures() {
        let report = report_with(vec![
            (ScreenTarget::Home, applied()),
            (ScreenTarget::Lock, TargetStatus::Skipped(SkipReason::Unsupported)),
        ]);
        assert_eq!(report.status(), RotationStatus::Completed);
    }

    #[test]
    fn partial_apply_failure_is_retried_until_ceiling() {
        let report = report_with(vec![
            (ScreenTarget::Home, applied()),
            (ScreenTarget::Lock, TargetStatus::Failed(apply_error())),
        ]);
        assert_eq!(report.status(), RotationStatus::Partial);
        assert_eq!(JobResult::from_report(&report, 0), JobResult::Retry);
        assert_eq!(JobResult::from_report(&report, 1), JobResult::Retry);
        assert_eq!(JobResult::from_report(&report, 2), JobResult::Failure);
    }

    #[test]
    fn only_failed_targets_are_rerun() {
        let report = report_with(vec![
            (ScreenTarget::Home, applied()),
            (ScreenTarget::Lock, TargetStatus::Failed(apply_error())),
        ]);
        assert_eq!(report.failed_targets(), vec![ScreenTarget::Lock]);
        assert!(report_with(vec![(ScreenTarget::Home, applied())]).failed_targets().is_empty());
    }

    #[test]
    fn access_failure_is_terminal() {
        let report = report_with(vec![
            (
                ScreenTarget::Home,
                TargetStatus::Failed(RotatorError::access("a.jpg", "permission denied")),
            ),
            (ScreenTarget::Lock, applied()),
        ]);
        assert_eq!(report.status(), RotationStatus::Partial);
        assert_eq!(JobResult::from_report(&report, 0), JobResult::Failure);
    }

    #[test]
    fn total_failure_status() {
        let report = report_with(vec![(ScreenTarget::Home, TargetStatus::Failed(apply_error()))]);
        assert_eq!(report.status(), RotationStatus::Failed);
    }

    #[test]
    fn store_errors_retry_within_ceiling() {
        let err = RotatorError::Store("locked".into());
        assert_eq!(JobResult::from_error(&err, 0), JobResult::Retry);
        assert_eq!(JobResult::from_error(&err, 2), JobResult::Failure);
        assert_eq!(
            JobResult::from_error(&RotatorError::Decode("x".into()), 0),
            JobResult::Failure
        );
    }
}
