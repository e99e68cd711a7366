//! Deployment progress aggregation.
//!
//! Folds the stream of `deployment_*` events into one [`DeploymentProgress`]
//! snapshot. The stage list is a fixed catalog: stages never appear or
//! disappear at runtime, only their status changes.
//!
//! The central rule is merge-not-reset: a start or resume event that arrives
//! while progress already exists keeps every stage's status and log lines.
//! Across a reconnect the transport gives no ordering guarantees, and this
//! rule is what keeps the view consistent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::protocol::{DeploymentReport, DeploymentStart, StageStatus, StageUpdate};

/// Overall percentage ceiling while a run is not terminal.
pub const MAX_NON_TERMINAL_PROGRESS: u8 = 99;

/// Static description of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub id: String,
    pub label: String,
    pub weight: f64,
}

impl StageSpec {
    pub fn new(id: &str, label: &str, weight: f64) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            weight,
        }
    }
}

/// Ordered, fixed set of stages with a constant total weight.
#[derive(Debug, Clone, PartialEq)]
pub struct StageCatalog {
    stages: Vec<StageSpec>,
    total_weight: f64,
}

impl StageCatalog {
    pub fn new(stages: Vec<StageSpec>) -> Self {
        let total_weight = stages.iter().map(|s| s.weight.max(0.0)).sum();
        Self {
            stages,
            total_weight,
        }
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn position(&self, stage_id: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.id == stage_id)
    }
}

impl Default for StageCatalog {
    fn default() -> Self {
        Self::new(vec![
            StageSpec::new("repo_access", "Accessing repository", 10.0),
            StageSpec::new("code_analysis", "Analyzing code", 15.0),
            StageSpec::new("dockerfile", "Generating Dockerfile", 10.0),
            StageSpec::new("env_vars", "Configuring environment", 5.0),
            StageSpec::new("build", "Building container image", 30.0),
            StageSpec::new("deploy", "Deploying service", 25.0),
            StageSpec::new("health_check", "Verifying health", 5.0),
        ])
    }
}

/// Deployment-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Deploying,
    Success,
    Failed,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Deploying)
    }
}

/// Live state of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub id: String,
    pub label: String,
    pub weight: f64,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl Stage {
    fn from_spec(spec: &StageSpec) -> Self {
        Self {
            id: spec.id.clone(),
            label: spec.label.clone(),
            weight: spec.weight,
            status: StageStatus::Pending,
            message: None,
            details: Vec::new(),
            start_time: None,
            end_time: None,
        }
    }

    /// Move the stage forward. Returns false if `status` would move it
    /// backwards (e.g. a replayed `in-progress` after `success`). A failed
    /// stage may only be retried while the run is deploying again.
    fn advance(&mut self, status: StageStatus, now: DateTime<Utc>, allow_retry: bool) -> bool {
        if self.status == StageStatus::Error && allow_retry && status != StageStatus::Pending {
            self.end_time = None;
        } else if self.status.is_terminal() && status != self.status {
            return false;
        } else if status.rank() < self.status.rank() {
            return false;
        }
        if status != StageStatus::Pending && self.start_time.is_none() {
            self.start_time = Some(now);
        }
        if status.is_terminal() && self.end_time.is_none() {
            self.end_time = Some(now);
        }
        self.status = status;
        true
    }

    /// Append log lines. A batch that replays the tail of what is already
    /// recorded only contributes the lines past that tail; repeated lines
    /// elsewhere are kept.
    fn merge_details(&mut self, lines: &[String]) -> usize {
        let skip = replayed_prefix(&self.details, lines);
        self.details.extend_from_slice(&lines[skip..]);
        lines.len() - skip
    }

    fn has_history(&self) -> bool {
        self.status != StageStatus::Pending || !self.details.is_empty()
    }
}

/// Length of the longest prefix of `incoming` that equals a suffix of
/// `existing`.
fn replayed_prefix(existing: &[String], incoming: &[String]) -> usize {
    let max = existing.len().min(incoming.len());
    (1..=max)
        .rev()
        .find(|&k| existing[existing.len() - k..] == incoming[..k])
        .unwrap_or(0)
}

/// Snapshot of one deployment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentProgress {
    pub deployment_id: String,
    pub stages: Vec<Stage>,
    pub current_stage: String,
    pub overall_progress: u8,
    pub status: DeploymentStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_url: Option<String>,
}

impl DeploymentProgress {
    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    fn has_history(&self) -> bool {
        self.overall_progress > 0 || self.stages.iter().any(Stage::has_history)
    }
}

/// How the aggregator treated a start/resume event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Fresh,
    Merged,
}

/// Tunables for the percentage computation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressConfig {
    /// Fraction (0.0..=1.0) of the running stage's weight credited before it
    /// completes.
    pub in_progress_credit: f64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            in_progress_credit: 0.5,
        }
    }
}

/// Stage state machine for the active session's deployment.
#[derive(Debug, Clone)]
pub struct DeploymentProgressAggregator {
    catalog: StageCatalog,
    config: ProgressConfig,
    progress: Option<DeploymentProgress>,
}

impl DeploymentProgressAggregator {
    pub fn new(catalog: StageCatalog, config: ProgressConfig) -> Self {
        Self {
            catalog,
            config,
            progress: None,
        }
    }

    pub fn progress(&self) -> Option<&DeploymentProgress> {
        self.progress.as_ref()
    }

    pub fn catalog(&self) -> &StageCatalog {
        &self.catalog
    }

    /// Drop the current run entirely. Only a session reset or switch does this.
    pub fn reset(&mut self) {
        self.progress = None;
    }

    /// Adopt a snapshot from history when nothing is live yet, otherwise
    /// fold it into the live run without losing anything either side has.
    pub fn restore(&mut self, snapshot: DeploymentProgress) {
        match self.progress.as_mut() {
            None => self.progress = Some(snapshot),
            Some(live) => {
                for hist in &snapshot.stages {
                    if let Some(stage) = live.stages.iter_mut().find(|s| s.id == hist.id) {
                        if hist.status.rank() > stage.status.rank() {
                            stage.status = hist.status;
                            stage.end_time = stage.end_time.or(hist.end_time);
                        }
                        stage.start_time = match (stage.start_time, hist.start_time) {
                            (Some(a), Some(b)) => Some(a.min(b)),
                            (a, b) => a.or(b),
                        };
                        if stage.message.is_none() {
                            stage.message = hist.message.clone();
                        }
                        let mut merged = hist.details.clone();
                        let skip = replayed_prefix(&merged, &stage.details);
                        merged.extend_from_slice(&stage.details[skip..]);
                        stage.details = merged;
                    }
                }
                live.start_time = live.start_time.min(snapshot.start_time);
                if live.deployment_url.is_none() {
                    live.deployment_url = snapshot.deployment_url;
                }
                if snapshot.status.is_terminal() && !live.status.is_terminal() {
                    live.status = snapshot.status;
                    live.overall_progress = snapshot.overall_progress;
                } else if !live.status.is_terminal() {
                    let computed = self.compute_overall(&self.progress_stages());
                    if let Some(live) = self.progress.as_mut() {
                        live.overall_progress = live
                            .overall_progress
                            .max(snapshot.overall_progress.min(MAX_NON_TERMINAL_PROGRESS))
                            .max(computed);
                    }
                }
            }
        }
    }

    /// Handle `deployment_started` (`explicit_resume == false`) or
    /// `deployment_resumed` (`explicit_resume == true`).
    ///
    /// An explicit resume always merges. A plain start merges whenever the
    /// session already holds progress for a run, and only builds a fresh
    /// stage array when there is none.
    pub fn start(&mut self, start: &DeploymentStart, explicit_resume: bool) -> StartOutcome {
        let now = Utc::now();
        let merge = explicit_resume
            || self
                .progress
                .as_ref()
                .is_some_and(DeploymentProgress::has_history);

        let outcome = match self.progress.as_mut() {
            Some(existing) if merge => {
                if existing.deployment_id != start.deployment_id {
                    info!(
                        previous = %existing.deployment_id,
                        deployment_id = %start.deployment_id,
                        "resuming deployment under a new id"
                    );
                }
                existing.deployment_id = start.deployment_id.clone();
                existing.status = DeploymentStatus::Deploying;
                existing.deployment_url = None;
                StartOutcome::Merged
            }
            _ => {
                let first = self
                    .catalog
                    .stages()
                    .first()
                    .map(|s| s.id.clone())
                    .unwrap_or_default();
                self.progress = Some(DeploymentProgress {
                    deployment_id: start.deployment_id.clone(),
                    stages: self.catalog.stages().iter().map(Stage::from_spec).collect(),
                    current_stage: first,
                    overall_progress: 0,
                    status: DeploymentStatus::Deploying,
                    start_time: now,
                    deployment_url: None,
                });
                StartOutcome::Fresh
            }
        };

        if let Some(stage_id) = start.resume_stage.as_deref() {
            self.apply_resume_stage(stage_id, now);
        }

        let computed = self.compute_overall(&self.progress_stages());
        if let Some(progress) = self.progress.as_mut() {
            let mut overall = progress.overall_progress.max(computed);
            if explicit_resume {
                // An explicit resume may move the figure either way: the
                // server's number is authoritative for the resumed run.
                overall = computed;
                if let Some(hint) = start.resume_progress {
                    overall = overall.max(clamp_percent(hint));
                }
            } else if let Some(hint) = start.resume_progress {
                overall = overall.max(clamp_percent(hint));
            }
            progress.overall_progress = overall.min(MAX_NON_TERMINAL_PROGRESS);
            debug!(
                deployment_id = %progress.deployment_id,
                overall = progress.overall_progress,
                outcome = ?outcome,
                "deployment started"
            );
        }
        outcome
    }

    /// Handle `deployment_progress`. Returns false when the event was
    /// ignored (no run, or a stage outside the catalog).
    pub fn apply_update(&mut self, update: &StageUpdate) -> bool {
        let now = Utc::now();
        let Some(progress) = self.progress.as_mut() else {
            debug!(stage = %update.stage, "no active deployment, ignoring stage update");
            return false;
        };
        let Some(stage) = progress.stages.iter_mut().find(|s| s.id == update.stage) else {
            warn!(stage = %update.stage, "stage not in catalog, ignoring update");
            return false;
        };

        let allow_retry = progress.status == DeploymentStatus::Deploying;
        if !stage.advance(update.status, now, allow_retry) {
            debug!(
                stage = %update.stage,
                current = ?stage.status,
                incoming = ?update.status,
                "ignoring stage status regression"
            );
        }
        if update.message.is_some() {
            stage.message = update.message.clone();
        }
        stage.merge_details(&update.details);
        let stage_failed =
            update.status == StageStatus::Error && stage.status == StageStatus::Error;

        if update.status == StageStatus::InProgress || update.status == StageStatus::Error {
            progress.current_stage = update.stage.clone();
        }
        if stage_failed && progress.status == DeploymentStatus::Deploying {
            progress.status = DeploymentStatus::Failed;
            info!(
                deployment_id = %progress.deployment_id,
                stage = %update.stage,
                "deployment failed"
            );
        }

        if progress.status == DeploymentStatus::Deploying {
            let computed = self.compute_overall(&self.progress_stages());
            if let Some(progress) = self.progress.as_mut() {
                progress.overall_progress = progress
                    .overall_progress
                    .max(computed)
                    .min(MAX_NON_TERMINAL_PROGRESS);
            }
        }
        true
    }

    /// Handle `deployment_complete`.
    pub fn complete(&mut self, report: &DeploymentReport) -> bool {
        let now = Utc::now();
        let Some(progress) = self.progress.as_mut() else {
            debug!("no active deployment, ignoring completion");
            return false;
        };
        let succeeded = report.succeeded();
        progress.overall_progress = 100;
        progress.status = if succeeded {
            DeploymentStatus::Success
        } else {
            DeploymentStatus::Failed
        };
        if let Some(url) = report.url() {
            progress.deployment_url = Some(url.to_string());
        }
        if succeeded {
            for stage in progress
                .stages
                .iter_mut()
                .filter(|s| s.status != StageStatus::Error)
            {
                stage.advance(StageStatus::Success, now, false);
            }
            if let Some(last) = progress.stages.last() {
                progress.current_stage = last.id.clone();
            }
        }
        info!(
            deployment_id = %progress.deployment_id,
            status = ?progress.status,
            url = ?progress.deployment_url,
            "deployment complete"
        );
        true
    }

    fn apply_resume_stage(&mut self, stage_id: &str, now: DateTime<Utc>) {
        let Some(index) = self.catalog.position(stage_id) else {
            warn!(stage = %stage_id, "resume stage not in catalog");
            return;
        };
        let Some(progress) = self.progress.as_mut() else {
            return;
        };
        for stage in progress.stages.iter_mut().take(index) {
            if stage.status == StageStatus::Pending {
                stage.advance(StageStatus::Success, now, false);
            }
        }
        if let Some(stage) = progress.stages.get_mut(index) {
            if stage.status == StageStatus::Pending {
                stage.advance(StageStatus::InProgress, now, false);
            }
        }
        progress.current_stage = stage_id.to_string();
    }

    fn progress_stages(&self) -> Vec<(StageStatus, f64)> {
        self.progress
            .as_ref()
            .map(|p| p.stages.iter().map(|s| (s.status, s.weight)).collect())
            .unwrap_or_default()
    }

    /// Weighted completion, before clamping.
    fn compute_overall(&self, stages: &[(StageStatus, f64)]) -> u8 {
        let total = self.catalog.total_weight();
        if total <= 0.0 {
            return 0;
        }
        let completed: f64 = stages
            .iter()
            .filter(|(status, _)| *status == StageStatus::Success)
            .map(|(_, weight)| weight.max(0.0))
            .sum();
        let credit = self.config.in_progress_credit.clamp(0.0, 1.0);
        let running: f64 = stages
            .iter()
            .filter(|(status, _)| *status == StageStatus::InProgress)
            .map(|(_, weight)| weight.max(0.0) * credit)
            .sum();
        clamp_percent(100.0 * (completed + running) / total)
    }
}

impl Default for DeploymentProgressAggregator {
    fn default() -> Self {
        Self::new(StageCatalog::default(), ProgressConfig::default())
    }
}

fn clamp_percent(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(id: &str) -> DeploymentStart {
        DeploymentStart {
            deployment_id: id.to_string(),
            resume_stage: None,
            resume_progress: None,
        }
    }

    fn update(stage: &str, status: StageStatus, details: &[&str]) -> StageUpdate {
        StageUpdate {
            stage: stage.to_string(),
            status,
            message: None,
            details: details.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn no_credit() -> DeploymentProgressAggregator {
        DeploymentProgressAggregator::new(
            StageCatalog::default(),
            ProgressConfig {
                in_progress_credit: 0.0,
            },
        )
    }

    #[test]
    fn test_default_catalog_weights() {
        let catalog = StageCatalog::default();
        assert_eq!(catalog.total_weight(), 100.0);
        assert_eq!(catalog.position("build"), Some(4));
    }

    #[test]
    fn test_fresh_start_initializes_all_pending() {
        let mut agg = DeploymentProgressAggregator::default();
        assert_eq!(agg.start(&start("d-1"), false), StartOutcome::Fresh);

        let p = agg.progress().unwrap();
        assert_eq!(p.deployment_id, "d-1");
        assert_eq!(p.overall_progress, 0);
        assert_eq!(p.status, DeploymentStatus::Deploying);
        assert_eq!(p.current_stage, "repo_access");
        assert!(p.stages.iter().all(|s| s.status == StageStatus::Pending));
    }

    #[test]
    fn test_build_success_scores_its_weight() {
        let mut agg = DeploymentProgressAggregator::default();
        agg.start(&start("d-1"), false);
        assert!(agg.apply_update(&update("build", StageStatus::Success, &[])));
        assert_eq!(agg.progress().unwrap().overall_progress, 30);

        let report = DeploymentReport {
            status: Some("success".into()),
            url: Some("https://x.run.app".into()),
            ..Default::default()
        };
        assert!(agg.complete(&report));
        let p = agg.progress().unwrap();
        assert_eq!(p.overall_progress, 100);
        assert_eq!(p.status, DeploymentStatus::Success);
        assert_eq!(p.deployment_url.as_deref(), Some("https://x.run.app"));
        assert!(p.stages.iter().all(|s| s.status == StageStatus::Success));
    }

    #[test]
    fn test_in_progress_credit() {
        let mut agg = DeploymentProgressAggregator::default();
        agg.start(&start("d-1"), false);
        agg.apply_update(&update("repo_access", StageStatus::Success, &[]));
        agg.apply_update(&update("build", StageStatus::InProgress, &[]));
        // 10 done + half of build's 30
        assert_eq!(agg.progress().unwrap().overall_progress, 25);
        assert_eq!(agg.progress().unwrap().current_stage, "build");
    }

    #[test]
    fn test_clamped_below_100_until_complete() {
        let mut agg = no_credit();
        agg.start(&start("d-1"), false);
        for spec in StageCatalog::default().stages() {
            agg.apply_update(&update(&spec.id, StageStatus::Success, &[]));
        }
        let p = agg.progress().unwrap();
        assert_eq!(p.overall_progress, MAX_NON_TERMINAL_PROGRESS);
        assert_eq!(p.status, DeploymentStatus::Deploying);
    }

    #[test]
    fn test_progress_never_decreases_on_regression() {
        let mut agg = no_credit();
        agg.start(&start("d-1"), false);
        agg.apply_update(&update("repo_access", StageStatus::Success, &[]));
        agg.apply_update(&update("repo_access", StageStatus::InProgress, &[]));
        let p = agg.progress().unwrap();
        assert_eq!(p.stage("repo_access").unwrap().status, StageStatus::Success);
        assert_eq!(p.overall_progress, 10);
    }

    #[test]
    fn test_details_skip_replayed_overlap() {
        let mut agg = DeploymentProgressAggregator::default();
        agg.start(&start("d-1"), false);
        agg.apply_update(&update("build", StageStatus::InProgress, &["Step 1/3", "Step 2/3"]));
        agg.apply_update(&update("build", StageStatus::InProgress, &["Step 2/3", "Step 3/3"]));
        agg.apply_update(&update("build", StageStatus::InProgress, &[]));
        assert_eq!(
            agg.progress().unwrap().stage("build").unwrap().details,
            vec!["Step 1/3", "Step 2/3", "Step 3/3"]
        );
    }

    #[test]
    fn test_details_keep_repeated_log_lines() {
        let mut agg = DeploymentProgressAggregator::default();
        agg.start(&start("d-1"), false);
        for line in [
            "Step 1/3 : FROM python",
            " ---> Using cache",
            "Step 2/3 : COPY . .",
            " ---> Using cache",
        ] {
            agg.apply_update(&update("build", StageStatus::InProgress, &[line]));
        }
        assert_eq!(
            agg.progress().unwrap().stage("build").unwrap().details,
            vec![
                "Step 1/3 : FROM python",
                " ---> Using cache",
                "Step 2/3 : COPY . .",
                " ---> Using cache",
            ]
        );

        // a replay of the whole log adds nothing
        agg.apply_update(&update(
            "build",
            StageStatus::InProgress,
            &["Step 2/3 : COPY . .", " ---> Using cache"],
        ));
        assert_eq!(
            agg.progress().unwrap().stage("build").unwrap().details.len(),
            4
        );
    }

    #[test]
    fn test_replayed_prefix() {
        let lines = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(replayed_prefix(&lines(&["a", "b", "c"]), &lines(&["b", "c", "d"])), 2);
        assert_eq!(replayed_prefix(&lines(&["a", "b"]), &lines(&["c"])), 0);
        assert_eq!(replayed_prefix(&lines(&[]), &lines(&["a"])), 0);
        assert_eq!(replayed_prefix(&lines(&["a", "a"]), &lines(&["a", "a", "a"])), 2);
    }

    #[test]
    fn test_stage_error_fails_deployment() {
        let mut agg = DeploymentProgressAggregator::default();
        agg.start(&start("d-1"), false);
        let mut failing = update("build", StageStatus::Error, &["exit code 1"]);
        failing.message = Some("docker build failed".into());
        agg.apply_update(&failing);

        let p = agg.progress().unwrap();
        assert_eq!(p.status, DeploymentStatus::Failed);
        assert_eq!(p.current_stage, "build");
        let build = p.stage("build").unwrap();
        assert_eq!(build.message.as_deref(), Some("docker build failed"));
        assert!(build.end_time.is_some());
    }

    #[test]
    fn test_unknown_stage_ignored() {
        let mut agg = DeploymentProgressAggregator::default();
        agg.start(&start("d-1"), false);
        let before = agg.progress().cloned();
        assert!(!agg.apply_update(&update("quantum_flux", StageStatus::Success, &[])));
        assert_eq!(agg.progress().cloned(), before);
    }

    #[test]
    fn test_update_without_deployment_ignored() {
        let mut agg = DeploymentProgressAggregator::default();
        assert!(!agg.apply_update(&update("build", StageStatus::Success, &[])));
        assert!(agg.progress().is_none());
        assert!(!agg.complete(&DeploymentReport::default()));
    }

    #[test]
    fn test_restart_with_new_id_preserves_stages() {
        let mut agg = DeploymentProgressAggregator::default();
        agg.start(&start("d-1"), false);
        agg.apply_update(&update("repo_access", StageStatus::Success, &["cloned main"]));
        let started_at = agg.progress().unwrap().start_time;

        assert_eq!(agg.start(&start("d-2"), false), StartOutcome::Merged);

        let p = agg.progress().unwrap();
        assert_eq!(p.deployment_id, "d-2");
        assert_eq!(p.start_time, started_at);
        let stage = p.stage("repo_access").unwrap();
        assert_eq!(stage.status, StageStatus::Success);
        assert_eq!(stage.details, vec!["cloned main"]);
        assert_eq!(p.overall_progress, 10);
    }

    #[test]
    fn test_start_without_history_is_fresh() {
        let mut agg = DeploymentProgressAggregator::default();
        agg.start(&start("d-1"), false);
        assert_eq!(agg.start(&start("d-2"), false), StartOutcome::Fresh);
        assert_eq!(agg.progress().unwrap().deployment_id, "d-2");
    }

    #[test]
    fn test_explicit_resume_marks_deploying_again() {
        let mut agg = DeploymentProgressAggregator::default();
        agg.start(&start("d-1"), false);
        agg.apply_update(&update("build", StageStatus::Error, &["oom"]));
        assert_eq!(agg.progress().unwrap().status, DeploymentStatus::Failed);

        assert_eq!(agg.start(&start("d-1"), true), StartOutcome::Merged);
        let p = agg.progress().unwrap();
        assert_eq!(p.status, DeploymentStatus::Deploying);
        assert_eq!(p.stage("build").unwrap().status, StageStatus::Error);
        assert_eq!(p.stage("build").unwrap().details, vec!["oom"]);

        // the resumed run retries the failed stage
        agg.apply_update(&update("build", StageStatus::InProgress, &["retrying"]));
        let p = agg.progress().unwrap();
        assert_eq!(p.status, DeploymentStatus::Deploying);
        let build = p.stage("build").unwrap();
        assert_eq!(build.status, StageStatus::InProgress);
        assert_eq!(build.details, vec!["oom", "retrying"]);
        assert!(build.end_time.is_none());
    }

    #[test]
    fn test_resume_from_later_stage_stays_deploying() {
        let mut agg = DeploymentProgressAggregator::default();
        agg.start(&start("d-1"), false);
        agg.apply_update(&update("code_analysis", StageStatus::Error, &[]));
        assert_eq!(agg.progress().unwrap().status, DeploymentStatus::Failed);

        let mut resume = start("d-1");
        resume.resume_stage = Some("build".into());
        agg.start(&resume, true);
        assert_eq!(agg.progress().unwrap().status, DeploymentStatus::Deploying);

        agg.apply_update(&update("build", StageStatus::InProgress, &["Step 1/3"]));
        let p = agg.progress().unwrap();
        assert_eq!(p.status, DeploymentStatus::Deploying);
        assert_eq!(p.current_stage, "build");
        assert_eq!(p.stage("code_analysis").unwrap().status, StageStatus::Error);

        agg.apply_update(&update("deploy", StageStatus::Error, &[]));
        assert_eq!(agg.progress().unwrap().status, DeploymentStatus::Failed);
    }

    #[test]
    fn test_failed_run_does_not_retry_without_resume() {
        let mut agg = DeploymentProgressAggregator::default();
        agg.start(&start("d-1"), false);
        agg.apply_update(&update("build", StageStatus::Error, &[]));
        agg.apply_update(&update("build", StageStatus::InProgress, &[]));
        let p = agg.progress().unwrap();
        assert_eq!(p.stage("build").unwrap().status, StageStatus::Error);
        assert_eq!(p.status, DeploymentStatus::Failed);
    }

    #[test]
    fn test_resume_stage_fills_earlier_stages() {
        let mut agg = no_credit();
        let resumed = DeploymentStart {
            deployment_id: "d-9".into(),
            resume_stage: Some("build".into()),
            resume_progress: Some(40.0),
        };
        assert_eq!(agg.start(&resumed, true), StartOutcome::Fresh);

        let p = agg.progress().unwrap();
        for id in ["repo_access", "code_analysis", "dockerfile", "env_vars"] {
            assert_eq!(p.stage(id).unwrap().status, StageStatus::Success, "{id}");
        }
        assert_eq!(p.stage("build").unwrap().status, StageStatus::InProgress);
        assert_eq!(p.current_stage, "build");
        assert_eq!(p.overall_progress, 40);
    }

    #[test]
    fn test_resume_progress_hint_capped() {
        let mut agg = DeploymentProgressAggregator::default();
        let resumed = DeploymentStart {
            deployment_id: "d-1".into(),
            resume_stage: None,
            resume_progress: Some(250.0),
        };
        agg.start(&resumed, true);
        assert_eq!(
            agg.progress().unwrap().overall_progress,
            MAX_NON_TERMINAL_PROGRESS
        );
    }

    #[test]
    fn test_failed_completion_still_reaches_100() {
        let mut agg = DeploymentProgressAggregator::default();
        agg.start(&start("d-1"), false);
        let report = DeploymentReport {
            success: Some(false),
            error: Some("quota exceeded".into()),
            ..Default::default()
        };
        agg.complete(&report);
        let p = agg.progress().unwrap();
        assert_eq!(p.overall_progress, 100);
        assert_eq!(p.status, DeploymentStatus::Failed);
        assert!(p.deployment_url.is_none());
    }

    #[test]
    fn test_restore_merges_history_into_live_run() {
        let mut history = DeploymentProgressAggregator::default();
        history.start(&start("d-1"), false);
        history.apply_update(&update("repo_access", StageStatus::Success, &["cloned"]));
        history.apply_update(&update("code_analysis", StageStatus::Success, &["flask app"]));
        let snapshot = history.progress().cloned().unwrap();

        let mut live = DeploymentProgressAggregator::default();
        live.start(&start("d-1"), false);
        live.apply_update(&update("build", StageStatus::InProgress, &["Step 1/9"]));
        live.restore(snapshot);

        let p = live.progress().unwrap();
        assert_eq!(p.stage("repo_access").unwrap().details, vec!["cloned"]);
        assert_eq!(p.stage("code_analysis").unwrap().status, StageStatus::Success);
        assert_eq!(p.stage("build").unwrap().details, vec!["Step 1/9"]);
        // 10 + 15 done, half of build
        assert_eq!(p.overall_progress, 40);
    }

    #[test]
    fn test_restore_adopts_snapshot_when_idle() {
        let mut history = DeploymentProgressAggregator::default();
        history.start(&start("d-1"), false);
        history.complete(&DeploymentReport {
            url: Some("https://x.run.app".into()),
            ..Default::default()
        });
        let snapshot = history.progress().cloned().unwrap();

        let mut agg = DeploymentProgressAggregator::default();
        agg.restore(snapshot.clone());
        assert_eq!(agg.progress(), Some(&snapshot));
    }

    #[test]
    fn test_progress_serializes_camel_case() {
        let mut agg = DeploymentProgressAggregator::default();
        agg.start(&start("d-1"), false);
        let json = serde_json::to_value(agg.progress().unwrap()).unwrap();
        assert_eq!(json["deploymentId"], "d-1");
        assert_eq!(json["overallProgress"], 0);
        assert_eq!(json["status"], "deploying");
        assert_eq!(json["stages"][0]["status"], "pending");
    }
}
