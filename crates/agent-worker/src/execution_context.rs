// ExecutionContext mapping `ExecutionContext.cs`.
// Per-step mutable state: result, cancellation, the step log, issues, progress,
// timeline detail records and attachments, plus the job-wide state every step shares.

use agent_common::{HostContext, TaskResult};
use agent_sdk::{ArgUtil, RepositoryResource, SecureFile, ServiceEndpoint};
use anyhow::{bail, ensure, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::variables::Variables;

/// Issues kept per step. The counters keep going past it.
pub const MAX_ISSUE_COUNT: usize = 10;

const DEFAULT_FORCE_COMPLETE_DELAY: Duration = Duration::from_secs(5);

/// Environment changes a step asked to carry into later steps.
pub type EnvironmentDiff = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueType {
    Error,
    Warning,
}

impl IssueType {
    fn tag(self) -> &'static str {
        match self {
            IssueType::Error => "##[error]",
            IssueType::Warning => "##[warning]",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub issue_type: IssueType,
    pub message: String,
    pub data: BTreeMap<String, String>,
}

impl Issue {
    pub fn new(issue_type: IssueType, message: impl Into<String>) -> Self {
        Self {
            issue_type,
            message: message.into(),
            data: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimelineRecordState {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl FromStr for TimelineRecordState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "inprogress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            _ => Err(()),
        }
    }
}

/// A sub-record of the step, created through `task.logdetail`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TimelineRecord {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub name: Option<String>,
    pub record_type: Option<String>,
    pub order: Option<i32>,
    pub percent_complete: Option<u32>,
    pub result: Option<TaskResult>,
    pub state: Option<TimelineRecordState>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub current_operation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub attachment_type: String,
    pub name: String,
    pub path: PathBuf,
}

// ---------------------------------------------------------------------------
// Global (shared by every step of the job)
// ---------------------------------------------------------------------------

pub struct Global {
    pub variables: Variables,
    pub endpoints: Vec<ServiceEndpoint>,
    pub secure_files: Vec<SecureFile>,
    pub repositories: Vec<RepositoryResource>,
    /// Directories added through `task.prependpath`, most recent last.
    pub prepend_path: Vec<String>,
    /// Environment overrides produced by earlier steps.
    pub environment: EnvironmentDiff,
    pub cancel_token: CancellationToken,
}

impl Global {
    pub fn new(variables: Variables) -> Self {
        Self {
            variables,
            endpoints: Vec::new(),
            secure_files: Vec::new(),
            repositories: Vec::new(),
            prepend_path: Vec::new(),
            environment: EnvironmentDiff::new(),
            cancel_token: CancellationToken::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

pub struct ExecutionContext {
    host_context: Arc<HostContext>,
    global: Arc<RwLock<Global>>,

    id: Uuid,
    display_name: String,

    result: Option<TaskResult>,

    cancellation_token: CancellationToken,
    /// Fired a short while after `task.complete` so a lingering child cannot hold the step.
    force_completed: CancellationToken,
    force_complete_delay: Duration,

    log_lines: Vec<String>,
    issues: Vec<Issue>,
    error_count: usize,
    warning_count: usize,

    percent_complete: u32,
    current_operation: Option<String>,
    detail_records: BTreeMap<Uuid, TimelineRecord>,
    attachments: Vec<Attachment>,
}

impl ExecutionContext {
    pub fn new_root(host_context: Arc<HostContext>, global: Global, display_name: impl Into<String>) -> Self {
        let cancellation_token = global.cancel_token.child_token();
        Self {
            host_context,
            global: Arc::new(RwLock::new(global)),
            id: Uuid::new_v4(),
            display_name: display_name.into(),
            result: None,
            cancellation_token,
            force_completed: CancellationToken::new(),
            force_complete_delay: DEFAULT_FORCE_COMPLETE_DELAY,
            log_lines: Vec::new(),
            issues: Vec::new(),
            error_count: 0,
            warning_count: 0,
            percent_complete: 0,
            current_operation: None,
            detail_records: BTreeMap::new(),
            attachments: Vec::new(),
        }
    }

    /// A fresh context for the next step, sharing the job state.
    pub fn create_step_context(&self, display_name: impl Into<String>) -> Self {
        let cancellation_token = self.global.read().cancel_token.child_token();
        Self {
            host_context: Arc::clone(&self.host_context),
            global: Arc::clone(&self.global),
            id: Uuid::new_v4(),
            display_name: display_name.into(),
            result: None,
            cancellation_token,
            force_completed: CancellationToken::new(),
            force_complete_delay: self.force_complete_delay,
            log_lines: Vec::new(),
            issues: Vec::new(),
            error_count: 0,
            warning_count: 0,
            percent_complete: 0,
            current_operation: None,
            detail_records: BTreeMap::new(),
            attachments: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn host_context(&self) -> &Arc<HostContext> {
        &self.host_context
    }

    pub fn global(&self) -> parking_lot::RwLockReadGuard<'_, Global> {
        self.global.read()
    }

    pub fn global_mut(&self) -> parking_lot::RwLockWriteGuard<'_, Global> {
        self.global.write()
    }

    /// The job's variables. Cloning shares the store.
    pub fn variables(&self) -> Variables {
        self.global.read().variables.clone()
    }

    pub fn endpoints(&self) -> Vec<ServiceEndpoint> {
        self.global.read().endpoints.clone()
    }

    pub fn secure_files(&self) -> Vec<SecureFile> {
        self.global.read().secure_files.clone()
    }

    pub fn repositories(&self) -> Vec<RepositoryResource> {
        self.global.read().repositories.clone()
    }

    pub fn prepend_path(&self) -> Vec<String> {
        self.global.read().prepend_path.clone()
    }

    /// Move `directory` to the end of the prepend list, dropping an earlier copy.
    pub fn add_prepend_path(&self, directory: &str) {
        let mut global = self.global.write();
        global.prepend_path.retain(|p| p != directory);
        global.prepend_path.push(directory.to_string());
    }

    pub fn job_environment(&self) -> EnvironmentDiff {
        self.global.read().environment.clone()
    }

    /// Carry a step's environment changes into the rest of the job.
    pub fn apply_environment_diff(&self, diff: &EnvironmentDiff) {
        let mut global = self.global.write();
        for (key, value) in diff {
            global.environment.insert(key.clone(), value.clone());
        }
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    pub fn force_completed_token(&self) -> CancellationToken {
        self.force_completed.clone()
    }

    pub fn set_force_complete_delay(&mut self, delay: Duration) {
        self.force_complete_delay = delay;
    }

    /// Fire the force-completed signal once the grace delay has passed.
    pub fn force_task_complete(&self) {
        let token = self.force_completed.clone();
        let delay = self.force_complete_delay;
        tracing::info!(target: "step", "Force finish current task in {} sec.", delay.as_secs());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    token.cancel();
                });
            }
            Err(_) => token.cancel(),
        }
    }

    // -----------------------------------------------------------------------
    // Result
    // -----------------------------------------------------------------------

    pub fn result(&self) -> Option<TaskResult> {
        self.result
    }

    pub fn set_result(&mut self, result: TaskResult) {
        self.result = Some(result);
    }

    /// Close the step, folding `result` into whatever the step already reported.
    pub fn complete(&mut self, result: Option<TaskResult>) -> TaskResult {
        let coming = result.unwrap_or(TaskResult::Succeeded);
        let final_result = TaskResult::merge(self.result, coming);
        self.result = Some(final_result);
        self.percent_complete = 100;
        self.section(&format!("Finishing: {}", self.display_name));
        tracing::info!(
            target: "step",
            "[{}] Result: {}, errors: {}, warnings: {}",
            self.display_name,
            final_result,
            self.error_count,
            self.warning_count
        );
        final_result
    }

    // -----------------------------------------------------------------------
    // Logging
    // -----------------------------------------------------------------------

    pub fn output(&mut self, message: &str) {
        let masked = self.mask(message);
        tracing::info!(target: "step", "[{}] {}", self.display_name, masked);
        self.log_lines.push(masked);
    }

    /// Written only when `system.debug` is on.
    pub fn debug(&mut self, message: &str) {
        if self.variables().system_debug() {
            self.write_tagged("##[debug]", message);
        } else {
            tracing::debug!(target: "step", "[{}] {}", self.display_name, self.mask(message));
        }
    }

    pub fn warning(&mut self, message: &str) {
        self.add_issue(Issue::new(IssueType::Warning, message));
    }

    pub fn error(&mut self, message: &str) {
        self.add_issue(Issue::new(IssueType::Error, message));
    }

    pub fn command(&mut self, message: &str) {
        self.write_tagged("##[command]", message);
    }

    pub fn section(&mut self, message: &str) {
        self.write_tagged("##[section]", message);
    }

    fn write_tagged(&mut self, tag: &str, message: &str) {
        let line = format!("{tag}{}", self.mask(message));
        match tag {
            "##[error]" => tracing::error!(target: "step", "[{}] {}", self.display_name, line),
            "##[warning]" => tracing::warn!(target: "step", "[{}] {}", self.display_name, line),
            _ => tracing::info!(target: "step", "[{}] {}", self.display_name, line),
        }
        self.log_lines.push(line);
    }

    fn mask(&self, message: &str) -> String {
        self.host_context.secret_masker().mask_secrets(message)
    }

    pub fn log_lines(&self) -> &[String] {
        &self.log_lines
    }

    // -----------------------------------------------------------------------
    // Issues
    // -----------------------------------------------------------------------

    /// Record and log an issue. Only the first few are kept, all are counted.
    pub fn add_issue(&mut self, mut issue: Issue) {
        issue.message = self.mask(&issue.message);
        let count = match issue.issue_type {
            IssueType::Error => &mut self.error_count,
            IssueType::Warning => &mut self.warning_count,
        };
        *count += 1;

        self.write_tagged(issue.issue_type.tag(), &issue.message);
        if self.issues.len() < MAX_ISSUE_COUNT {
            self.issues.push(issue);
        }
    }

    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn warning_count(&self) -> usize {
        self.warning_count
    }

    // -----------------------------------------------------------------------
    // Progress, timeline detail and attachments
    // -----------------------------------------------------------------------

    /// Progress never moves backwards.
    pub fn progress(&mut self, percentage: u32, current_operation: Option<&str>) -> Result<()> {
        ensure!(percentage <= 100, "Percentage {percentage} is out of range [0, 100].");
        self.percent_complete = self.percent_complete.max(percentage);
        self.current_operation = current_operation.map(str::to_string);
        Ok(())
    }

    pub fn percent_complete(&self) -> u32 {
        self.percent_complete
    }

    pub fn current_operation(&self) -> Option<&str> {
        self.current_operation.as_deref()
    }

    /// Create or update a detail record under this step.
    pub fn update_detail_timeline_record(&mut self, mut record: TimelineRecord) -> Result<()> {
        if let Some(existing) = self.detail_records.get_mut(&record.id) {
            match (record.parent_id, existing.parent_id) {
                (Some(new_parent), Some(old_parent)) if new_parent != old_parent => {
                    bail!("Cannot change parent timeline record");
                }
                (Some(_), None) => bail!("Cannot change parent timeline record"),
                _ => {}
            }

            existing.name = record.name.or(existing.name.take());
            existing.record_type = record.record_type.or(existing.record_type.take());
            existing.order = record.order.or(existing.order);
            existing.result = record.result.or(existing.result);
            existing.start_time = record.start_time.or(existing.start_time);
            existing.current_operation = record.current_operation.or(existing.current_operation.take());

            if let Some(state) = record.state {
                existing.state = Some(state);
            }
            if existing.state == Some(TimelineRecordState::Completed) {
                existing.percent_complete = Some(record.percent_complete.unwrap_or(100));
                existing.finish_time = Some(record.finish_time.unwrap_or_else(Utc::now));
            } else {
                existing.percent_complete = record.percent_complete.or(existing.percent_complete);
                existing.finish_time = record.finish_time.or(existing.finish_time);
            }
            return Ok(());
        }

        if record.name.as_deref().map_or(true, str::is_empty) {
            bail!("Name required for timeline record");
        }
        if record.record_type.as_deref().map_or(true, str::is_empty) {
            bail!("Type required for timeline record");
        }
        if let Some(parent) = record.parent_id {
            if parent != self.id && !self.detail_records.contains_key(&parent) {
                bail!("Parent timeline record not created");
            }
        }

        record.start_time.get_or_insert_with(Utc::now);
        record.state.get_or_insert(TimelineRecordState::InProgress);
        if record.state == Some(TimelineRecordState::Completed) {
            record.percent_complete.get_or_insert(100);
            record.finish_time.get_or_insert_with(Utc::now);
        }
        self.detail_records.insert(record.id, record);
        Ok(())
    }

    pub fn detail_record(&self, id: &Uuid) -> Option<&TimelineRecord> {
        self.detail_records.get(id)
    }

    pub fn queue_attach_file(&mut self, attachment_type: &str, name: &str, path: &Path) -> Result<()> {
        ArgUtil::not_null_or_empty(attachment_type, "type")?;
        ArgUtil::not_null_or_empty(name, "name")?;
        ArgUtil::file_exists(path, "filePath")?;
        self.attachments.push(Attachment {
            attachment_type: attachment_type.to_string(),
            name: name.to_string(),
            path: path.to_path_buf(),
        });
        Ok(())
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }
}

/// Root context over `root`, laid out like an installed agent with one pipeline workspace.
#[cfg(test)]
pub(crate) fn make_test_context(root: &Path) -> ExecutionContext {
    use agent_common::constants::path as layout;
    use agent_common::constants::variables::{agent, system};

    let host = HostContext::with_root("Test", root);
    let work = root.join(layout::WORK_DIRECTORY);
    let temp = work.join(layout::TEMP_DIRECTORY);
    let sources = work.join("1").join("s");
    for dir in [&temp, &sources] {
        std::fs::create_dir_all(dir).unwrap();
    }

    let variables = Variables::new(host.secret_masker().clone());
    let set = |name: &str, value: &Path| variables.set(name, &value.to_string_lossy(), false).unwrap();
    set(agent::ROOT_DIRECTORY, root);
    set(agent::WORK_FOLDER, &work);
    set(agent::TEMP_DIRECTORY, &temp);
    set(system::DEFAULT_WORKING_DIRECTORY, &sources);

    let mut context = ExecutionContext::new_root(host, Global::new(variables), "test-step");
    context.set_force_complete_delay(Duration::ZERO);
    context
}
