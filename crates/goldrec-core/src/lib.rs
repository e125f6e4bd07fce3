//! Core domain model for the golden-record pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "goldrec-core";

/// A discrete unit of work within a run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Match,
    Load,
}

impl Stage {
    /// Pipeline order: extract, then match, then load.
    pub const ALL: [Stage; 3] = [Stage::Extract, Stage::Match, Stage::Load];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Match => "match",
            Stage::Load => "load",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Status of one submitted matching job. `TimedOut` and `Cancelled` are
/// applied client-side when the orchestrator gives up; the service itself
/// only ever reports the first four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchJobStatus {
    Submitted,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl MatchJobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MatchJobStatus::Submitted | MatchJobStatus::Running)
    }
}

/// One submitted unit of work at the external matching service, owned by the
/// orchestrator for the duration of a single match stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchJob {
    pub job_id: String,
    pub status: MatchJobStatus,
    pub submitted_at: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl MatchJob {
    pub fn new(job_id: impl Into<String>, submitted_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            status: MatchJobStatus::Submitted,
            submitted_at,
            last_polled_at: None,
        }
    }

    /// Wall-clock time since submission, the budget the poll timeout is
    /// measured against.
    pub fn elapsed(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.submitted_at)
    }
}

/// Why a run entered its failed terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage: Stage,
    pub message: String,
}

/// The unit of state threaded through a single pipeline run and persisted to
/// the object store after every stage transition, so a later invocation can
/// resume from the last successfully completed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineContext {
    pub run_id: Uuid,
    pub domain: String,
    pub process_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub source_location: Option<String>,
    pub output_location: Option<String>,
    pub record_count_in: u64,
    pub record_count_matched: u64,
    pub job_id: Option<String>,
    pub stage_status: BTreeMap<Stage, StageStatus>,
    pub attempts: BTreeMap<Stage, u32>,
    pub failure: Option<RunFailure>,
}

impl PipelineContext {
    pub fn new(domain: impl Into<String>, process_date: NaiveDate) -> Self {
        let mut stage_status = BTreeMap::new();
        for stage in Stage::ALL {
            stage_status.insert(stage, StageStatus::Pending);
        }
        Self {
            run_id: Uuid::new_v4(),
            domain: domain.into(),
            process_date,
            started_at: Utc::now(),
            finished_at: None,
            source_location: None,
            output_location: None,
            record_count_in: 0,
            record_count_matched: 0,
            job_id: None,
            stage_status,
            attempts: BTreeMap::new(),
            failure: None,
        }
    }

    pub fn stage_status(&self, stage: Stage) -> StageStatus {
        self.stage_status
            .get(&stage)
            .copied()
            .unwrap_or(StageStatus::Pending)
    }

    /// Advances a stage's status. Succeeded is final per stage: an update
    /// that would revert it is rejected and `false` is returned.
    pub fn set_stage_status(&mut self, stage: Stage, status: StageStatus) -> bool {
        if self.stage_status(stage) == StageStatus::Succeeded && status != StageStatus::Succeeded {
            return false;
        }
        self.stage_status.insert(stage, status);
        true
    }

    pub fn record_attempts(&mut self, stage: Stage, attempts: u32) {
        let entry = self.attempts.entry(stage).or_insert(0);
        *entry = (*entry).max(attempts);
    }

    /// The first stage, in pipeline order, that has not yet succeeded.
    /// `None` means the run is complete.
    pub fn next_stage(&self) -> Option<Stage> {
        Stage::ALL
            .into_iter()
            .find(|stage| self.stage_status(*stage) != StageStatus::Succeeded)
    }

    pub fn is_complete(&self) -> bool {
        self.next_stage().is_none()
    }

    pub fn mark_failed(&mut self, stage: Stage, message: impl Into<String>) {
        self.set_stage_status(stage, StageStatus::Failed);
        self.failure = Some(RunFailure {
            stage,
            message: message.into(),
        });
    }

    /// Clears terminal bookkeeping before re-entering a previously failed
    /// run. Succeeded stages are left untouched.
    pub fn reset_for_resume(&mut self) {
        self.failure = None;
        self.finished_at = None;
        for stage in Stage::ALL {
            if self.stage_status(stage) == StageStatus::Failed {
                self.stage_status.insert(stage, StageStatus::Pending);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> PipelineContext {
        PipelineContext::new("customers", NaiveDate::from_ymd_opt(2024, 1, 1).expect("date"))
    }

    #[test]
    fn new_context_starts_all_stages_pending() {
        let ctx = ctx();
        for stage in Stage::ALL {
            assert_eq!(ctx.stage_status(stage), StageStatus::Pending);
        }
        assert_eq!(ctx.next_stage(), Some(Stage::Extract));
        assert!(!ctx.is_complete());
    }

    #[test]
    fn succeeded_stage_does_not_revert() {
        let mut ctx = ctx();
        assert!(ctx.set_stage_status(Stage::Extract, StageStatus::Succeeded));
        assert!(!ctx.set_stage_status(Stage::Extract, StageStatus::Running));
        assert!(!ctx.set_stage_status(Stage::Extract, StageStatus::Failed));
        assert_eq!(ctx.stage_status(Stage::Extract), StageStatus::Succeeded);
    }

    #[test]
    fn next_stage_skips_succeeded_stages() {
        let mut ctx = ctx();
        ctx.set_stage_status(Stage::Extract, StageStatus::Succeeded);
        ctx.set_stage_status(Stage::Match, StageStatus::Failed);
        assert_eq!(ctx.next_stage(), Some(Stage::Match));

        ctx.set_stage_status(Stage::Match, StageStatus::Succeeded);
        assert_eq!(ctx.next_stage(), Some(Stage::Load));

        ctx.set_stage_status(Stage::Load, StageStatus::Succeeded);
        assert_eq!(ctx.next_stage(), None);
        assert!(ctx.is_complete());
    }

    #[test]
    fn reset_for_resume_clears_failure_but_keeps_progress() {
        let mut ctx = ctx();
        ctx.set_stage_status(Stage::Extract, StageStatus::Succeeded);
        ctx.mark_failed(Stage::Match, "matching job failed: schema mismatch");
        ctx.finished_at = Some(Utc::now());

        ctx.reset_for_resume();
        assert!(ctx.failure.is_none());
        assert!(ctx.finished_at.is_none());
        assert_eq!(ctx.stage_status(Stage::Extract), StageStatus::Succeeded);
        assert_eq!(ctx.stage_status(Stage::Match), StageStatus::Pending);
        assert_eq!(ctx.next_stage(), Some(Stage::Match));
    }

    #[test]
    fn record_attempts_keeps_the_high_water_mark() {
        let mut ctx = ctx();
        ctx.record_attempts(Stage::Extract, 2);
        ctx.record_attempts(Stage::Extract, 1);
        assert_eq!(ctx.attempts.get(&Stage::Extract), Some(&2));
    }

    #[test]
    fn match_job_terminal_states() {
        assert!(!MatchJobStatus::Submitted.is_terminal());
        assert!(!MatchJobStatus::Running.is_terminal());
        assert!(MatchJobStatus::Succeeded.is_terminal());
        assert!(MatchJobStatus::Failed.is_terminal());
        assert!(MatchJobStatus::TimedOut.is_terminal());
        assert!(MatchJobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn context_persists_with_stage_keys_as_strings() {
        let mut ctx = ctx();
        ctx.set_stage_status(Stage::Extract, StageStatus::Succeeded);
        let json = serde_json::to_value(&ctx).expect("serialize context");
        assert_eq!(json["stage_status"]["extract"], "succeeded");
        let restored: PipelineContext =
            serde_json::from_value(json).expect("deserialize context");
        assert_eq!(restored, ctx);
    }
}
