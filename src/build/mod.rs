//! Build records and the stage state machine
//!
//! A build is one versioned run of the pipeline over a ticker set. Stages move
//! `pending -> running -> {completed | failed | skipped}`; the build moves
//! `created -> in_progress -> {finalized | aborted}`. Only the orchestrator
//! mutates a `BuildRecord`.

mod artifacts;
mod orchestrator;
mod report;
mod stages;

pub use artifacts::{ArtifactWriter, GeneratedSection, RetrievalLog, SectionStatus};
pub use orchestrator::{
    BuildOutcome, BuildRequest, CancelFlag, Orchestrator, PipelineServices, QueryAnswer,
    ReindexSummary,
};
pub use report::render_report;

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One pipeline phase, declared in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Ingest,
    Chunk,
    Embed,
    Index,
    Retrieve,
    Assemble,
    Generate,
}

impl StageName {
    pub const ALL: [StageName; 7] = [
        StageName::Ingest,
        StageName::Chunk,
        StageName::Embed,
        StageName::Index,
        StageName::Retrieve,
        StageName::Assemble,
        StageName::Generate,
    ];

    /// Stages that must be `completed` before this one may start
    pub fn dependencies(&self) -> &'static [StageName] {
        match self {
            StageName::Ingest => &[],
            StageName::Chunk => &[StageName::Ingest],
            StageName::Embed => &[StageName::Chunk],
            StageName::Index => &[StageName::Embed],
            StageName::Retrieve => &[StageName::Index],
            StageName::Assemble => &[StageName::Retrieve],
            StageName::Generate => &[StageName::Assemble],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Ingest => "ingest",
            StageName::Chunk => "chunk",
            StageName::Embed => "embed",
            StageName::Index => "index",
            StageName::Retrieve => "retrieve",
            StageName::Assemble => "assemble",
            StageName::Generate => "generate",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StageName {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        StageName::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| PipelineError::Config(format!("unknown stage '{}'", s)))
    }
}

/// Status of one stage within a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(StageStatus::Pending),
            "running" => Ok(StageStatus::Running),
            "completed" => Ok(StageStatus::Completed),
            "failed" => Ok(StageStatus::Failed),
            "skipped" => Ok(StageStatus::Skipped),
            other => Err(PipelineError::InvalidState(format!(
                "unknown stage status '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Global state of a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Created,
    InProgress,
    Finalized,
    Aborted,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Created => "created",
            BuildState::InProgress => "in_progress",
            BuildState::Finalized => "finalized",
            BuildState::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(BuildState::Created),
            "in_progress" => Ok(BuildState::InProgress),
            "finalized" => Ok(BuildState::Finalized),
            "aborted" => Ok(BuildState::Aborted),
            other => Err(PipelineError::InvalidState(format!(
                "unknown build state '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-stage bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    /// Times the stage has entered `running`
    pub attempts: u32,
    /// Failure or skip reason
    pub reason: Option<String>,
    /// Non-fatal observations (e.g. tickers without documents)
    #[serde(default)]
    pub notes: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    fn pending() -> Self {
        Self {
            status: StageStatus::Pending,
            attempts: 0,
            reason: None,
            notes: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// The persisted identity and progress of one build. Serialized as the
/// build manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub build_id: String,
    pub scope: String,
    pub started_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub state: BuildState,
    pub ticker_set: Vec<String>,
    /// Requested stages only, in pipeline order
    pub stage_statuses: BTreeMap<StageName, StageRecord>,
    /// Artifact name -> path relative to the build directory
    pub artifact_paths: BTreeMap<String, String>,
    pub config_fingerprint: String,
    pub abort_reason: Option<String>,
}

/// Timestamped build identity: `20240301T120000Z-1a2b3c4d`
pub fn new_build_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y%m%dT%H%M%SZ"), &suffix[..8])
}

/// Requested stages plus everything they transitively depend on
pub fn close_over_dependencies(requested: &[StageName]) -> Vec<StageName> {
    let mut wanted: Vec<StageName> = requested.to_vec();
    let mut i = 0;
    while i < wanted.len() {
        for dep in wanted[i].dependencies() {
            if !wanted.contains(dep) {
                wanted.push(*dep);
            }
        }
        i += 1;
    }
    wanted.sort();
    wanted
}

impl BuildRecord {
    /// Create a record in state `created` with every stage `pending`
    pub fn new(
        scope: &str,
        ticker_set: Vec<String>,
        requested: &[StageName],
        config_fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let stage_statuses = close_over_dependencies(requested)
            .into_iter()
            .map(|stage| (stage, StageRecord::pending()))
            .collect();

        Self {
            build_id: new_build_id(now),
            scope: scope.to_string(),
            started_at: now,
            finalized_at: None,
            state: BuildState::Created,
            ticker_set,
            stage_statuses,
            artifact_paths: BTreeMap::new(),
            config_fingerprint: config_fingerprint.to_string(),
            abort_reason: None,
        }
    }

    pub fn status(&self, stage: StageName) -> Option<StageStatus> {
        self.stage_statuses.get(&stage).map(|r| r.status)
    }

    pub fn stages(&self) -> impl Iterator<Item = StageName> + '_ {
        self.stage_statuses.keys().copied()
    }

    fn deps_completed(&self, stage: StageName) -> bool {
        stage
            .dependencies()
            .iter()
            .all(|dep| self.status(*dep) == Some(StageStatus::Completed))
    }

    /// First pending stage whose dependencies are all completed
    pub fn next_runnable(&self) -> Option<StageName> {
        self.stage_statuses
            .iter()
            .find(|(stage, record)| {
                record.status == StageStatus::Pending && self.deps_completed(**stage)
            })
            .map(|(stage, _)| *stage)
    }

    /// True once no stage is pending or running
    pub fn is_settled(&self) -> bool {
        self.stage_statuses.values().all(|r| r.status.is_terminal())
    }

    pub fn failed_stages(&self) -> Vec<StageName> {
        self.stage_statuses
            .iter()
            .filter(|(_, r)| r.status == StageStatus::Failed)
            .map(|(s, _)| *s)
            .collect()
    }

    /// Finalized with zero failed stages
    pub fn is_successful(&self) -> bool {
        self.state == BuildState::Finalized && !self.has_failures()
    }

    pub fn has_failures(&self) -> bool {
        self.stage_statuses
            .values()
            .any(|r| r.status == StageStatus::Failed)
    }

    fn ensure_mutable(&self) -> Result<()> {
        match self.state {
            BuildState::Finalized => Err(PipelineError::BuildFinalized(self.build_id.clone())),
            BuildState::Aborted => Err(PipelineError::InvalidState(format!(
                "build {} is aborted; resume it first",
                self.build_id
            ))),
            _ => Ok(()),
        }
    }

    fn record_mut(&mut self, stage: StageName) -> Result<&mut StageRecord> {
        let build_id = self.build_id.clone();
        self.stage_statuses.get_mut(&stage).ok_or_else(|| {
            PipelineError::InvalidState(format!("stage {} not requested in build {}", stage, build_id))
        })
    }

    pub fn start_stage(&mut self, stage: StageName, now: DateTime<Utc>) -> Result<()> {
        self.ensure_mutable()?;
        if !self.deps_completed(stage) {
            return Err(PipelineError::InvalidState(format!(
                "stage {} started before its dependencies completed",
                stage
            )));
        }

        let record = self.record_mut(stage)?;
        if record.status != StageStatus::Pending {
            return Err(PipelineError::InvalidState(format!(
                "stage {} cannot start from {}",
                stage, record.status
            )));
        }
        record.status = StageStatus::Running;
        record.attempts += 1;
        record.reason = None;
        record.notes.clear();
        record.started_at = Some(now);
        record.finished_at = None;

        self.state = BuildState::InProgress;
        Ok(())
    }

    fn finish_running(
        &mut self,
        stage: StageName,
        status: StageStatus,
        reason: Option<String>,
        notes: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_mutable()?;
        let record = self.record_mut(stage)?;
        if record.status != StageStatus::Running {
            return Err(PipelineError::InvalidState(format!(
                "stage {} is {}, not running",
                stage, record.status
            )));
        }
        record.status = status;
        record.reason = reason;
        record.notes = notes;
        record.finished_at = Some(now);
        Ok(())
    }

    pub fn complete_stage(
        &mut self,
        stage: StageName,
        notes: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.finish_running(stage, StageStatus::Completed, None, notes, now)
    }

    /// Mark a running stage failed and skip everything blocked by it
    pub fn fail_stage(&mut self, stage: StageName, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.finish_running(stage, StageStatus::Failed, Some(reason.to_string()), Vec::new(), now)?;
        self.skip_blocked(now);
        Ok(())
    }

    /// Mark a running stage skipped (e.g. no generation service)
    pub fn skip_stage(&mut self, stage: StageName, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.finish_running(stage, StageStatus::Skipped, Some(reason.to_string()), Vec::new(), now)?;
        self.skip_blocked(now);
        Ok(())
    }

    /// Pending stages with a failed or skipped dependency become skipped
    fn skip_blocked(&mut self, now: DateTime<Utc>) {
        loop {
            let blocked: Vec<(StageName, StageName)> = self
                .stage_statuses
                .iter()
                .filter(|(_, r)| r.status == StageStatus::Pending)
                .filter_map(|(stage, _)| {
                    stage
                        .dependencies()
                        .iter()
                        .find(|dep| {
                            matches!(
                                self.status(**dep),
                                Some(StageStatus::Failed) | Some(StageStatus::Skipped)
                            )
                        })
                        .map(|dep| (*stage, *dep))
                })
                .collect();

            if blocked.is_empty() {
                break;
            }

            for (stage, dep) in blocked {
                if let Some(record) = self.stage_statuses.get_mut(&stage) {
                    record.status = StageStatus::Skipped;
                    record.reason = Some(format!("blocked by {} stage", dep));
                    record.finished_at = Some(now);
                }
            }
        }
    }

    pub fn record_artifact(&mut self, name: &str, relative_path: &str) {
        self.artifact_paths
            .insert(name.to_string(), relative_path.to_string());
    }

    /// Freeze the record once every stage is terminal
    pub fn finalize(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure_mutable()?;
        if !self.is_settled() {
            return Err(PipelineError::InvalidState(format!(
                "build {} still has pending or running stages",
                self.build_id
            )));
        }
        self.state = BuildState::Finalized;
        self.finalized_at = Some(now);
        Ok(())
    }

    /// Abort after cancellation or a fatal storage error
    pub fn abort(&mut self, reason: &str) -> Result<()> {
        if self.state == BuildState::Finalized {
            return Err(PipelineError::BuildFinalized(self.build_id.clone()));
        }
        self.state = BuildState::Aborted;
        self.abort_reason = Some(reason.to_string());
        Ok(())
    }

    /// Reopen an unfinished build, or a finalized one with failed stages:
    /// failed, skipped and interrupted stages return to pending, completed
    /// stages are kept as they are. Successful builds stay immutable.
    pub fn prepare_resume(&mut self) -> Result<Vec<StageName>> {
        if self.is_successful() {
            return Err(PipelineError::BuildFinalized(self.build_id.clone()));
        }

        let mut reopened = Vec::new();
        for (stage, record) in self.stage_statuses.iter_mut() {
            if record.status != StageStatus::Completed {
                if record.status != StageStatus::Pending {
                    reopened.push(*stage);
                }
                record.status = StageStatus::Pending;
                record.reason = None;
                record.finished_at = None;
            }
        }

        self.state = BuildState::InProgress;
        self.finalized_at = None;
        self.abort_reason = None;
        Ok(reopened)
    }
}
