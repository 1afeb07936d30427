// TaskCommandExtension mapping `TaskCommandExtension.cs`.
// The `##vso[task.*]` commands a task uses to talk back to its step.

use agent_common::{Command, TaskResult};
use agent_sdk::StringUtil;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use uuid::Uuid;

use crate::command_manager::WorkerCommandExtension;
use crate::execution_context::{ExecutionContext, Issue, IssueType, TimelineRecord, TimelineRecordState};

pub const SUMMARY_ATTACHMENT_TYPE: &str = "DistributedTask.Core.Summary";
pub const FILE_ATTACHMENT_TYPE: &str = "DistributedTask.Core.FileAttachment";

pub struct TaskCommandExtension;

impl WorkerCommandExtension for TaskCommandExtension {
    fn command_area(&self) -> &'static str {
        "task"
    }

    fn process_command(&self, context: &mut ExecutionContext, command: &Command) -> Result<()> {
        match command.event.to_ascii_lowercase().as_str() {
            "logissue" | "issue" => process_log_issue(context, command),
            "setprogress" => process_set_progress(context, command),
            "logdetail" => process_log_detail(context, command),
            "complete" => process_complete(context, command),
            "setvariable" => process_set_variable(context, command),
            "addattachment" => process_add_attachment(context, command),
            "uploadsummary" => process_upload(context, command, SUMMARY_ATTACHMENT_TYPE, "Cannot upload summary"),
            "uploadfile" => process_upload(context, command, FILE_ATTACHMENT_TYPE, "Cannot upload file"),
            "prependpath" => process_prepend_path(context, command),
            "debug" => {
                context.debug(&command.data);
                Ok(())
            }
            event => bail!(
                "##vso[task.{event}] is not a recognized command for Task command extension."
            ),
        }
    }
}

fn process_log_issue(context: &mut ExecutionContext, command: &Command) -> Result<()> {
    let issue_type_name = command.property("type").unwrap_or_default();
    let issue_type = match issue_type_name.to_ascii_lowercase().as_str() {
        "error" => IssueType::Error,
        "warning" => IssueType::Warning,
        _ => bail!("issue type {issue_type_name} is not an expected issue type."),
    };

    let message = match command.property("sourcepath") {
        Some(source_path) => format!(
            "{}({},{}): {} {}: {}",
            source_path,
            command.property("linenumber").unwrap_or_default(),
            command.property("columnnumber").unwrap_or_default(),
            issue_type_name.to_ascii_lowercase(),
            command.property("code").unwrap_or_default(),
            command.data
        ),
        None => command.data.clone(),
    };

    let mut issue = Issue::new(issue_type, message);
    issue.data = command.properties.clone();
    context.add_issue(issue);
    Ok(())
}

fn process_set_progress(context: &mut ExecutionContext, command: &Command) -> Result<()> {
    if let Some(percent) = command.property("value").and_then(|v| v.trim().parse::<i64>().ok()) {
        let percent = percent.clamp(0, 100) as u32;
        context.progress(percent, Some(&command.data))?;
    }
    Ok(())
}

fn process_log_detail(context: &mut ExecutionContext, command: &Command) -> Result<()> {
    let id = command
        .property("id")
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .filter(|id| !id.is_nil());
    let Some(id) = id else {
        bail!("Missing timeline record id");
    };

    let parent_id = match command.property("parentid") {
        Some(value) => Some(
            Uuid::parse_str(value.trim())
                .with_context(|| format!("Invalid parent timeline record id '{value}'"))?,
        ),
        None => None,
    };

    let record = TimelineRecord {
        id,
        parent_id,
        name: command.property("name").map(str::to_string),
        record_type: command.property("type").map(str::to_string),
        order: command.property("order").and_then(|v| v.trim().parse().ok()),
        percent_complete: command
            .property("progress")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map(|p| p.clamp(0, 100) as u32),
        result: command
            .property("result")
            .map(|v| v.parse().unwrap_or(TaskResult::Succeeded)),
        state: command
            .property("state")
            .map(|v| v.parse().unwrap_or(TimelineRecordState::Pending)),
        start_time: command.property("starttime").map(parse_time_or_now),
        finish_time: command.property("finishtime").map(parse_time_or_now),
        current_operation: if command.data.is_empty() {
            None
        } else {
            Some(command.data.clone())
        },
    };

    context.update_detail_timeline_record(record)
}

fn parse_time_or_now(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn process_complete(context: &mut ExecutionContext, command: &Command) -> Result<()> {
    let result = command
        .property("result")
        .and_then(|v| v.parse::<TaskResult>().ok());
    let Some(result) = result else {
        bail!("Invalid task result");
    };

    context.set_result(result);
    context.progress(0, Some(&command.data))?;
    context.force_task_complete();
    Ok(())
}

fn process_set_variable(context: &mut ExecutionContext, command: &Command) -> Result<()> {
    let Some(name) = command.property("variable").filter(|v| !v.trim().is_empty()) else {
        context.warning("task.setvariable is missing the 'variable' property. The command is ignored.");
        return Ok(());
    };
    let is_secret = StringUtil::convert_to_bool_or(command.property("issecret"), false);

    if context.variables().set(name, &command.data, is_secret).is_err() {
        context.warning(&format!(
            "Can't update the read-only variable '{name}'. The value is unchanged."
        ));
    }
    Ok(())
}

fn process_add_attachment(context: &mut ExecutionContext, command: &Command) -> Result<()> {
    let attachment_type = command.property("type").unwrap_or_default();
    if attachment_type.is_empty() {
        bail!("Missing attachment type");
    }
    if StringUtil::contains_invalid_file_chars(attachment_type) {
        bail!("Type contain invalid characters.");
    }

    let name = command.property("name").unwrap_or_default();
    if name.is_empty() {
        bail!("Missing attachment name");
    }
    if StringUtil::contains_invalid_file_chars(name) {
        bail!("Name contain invalid characters.");
    }

    let path = Path::new(&command.data);
    if command.data.is_empty() || !path.is_file() {
        bail!("Missing attachment file");
    }
    context.queue_attach_file(attachment_type, name, path)
}

fn process_upload(
    context: &mut ExecutionContext,
    command: &Command,
    attachment_type: &str,
    missing_message: &str,
) -> Result<()> {
    if command.data.is_empty() {
        bail!("{missing_message}");
    }
    let path = Path::new(&command.data);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    context.queue_attach_file(attachment_type, &name, path)
}

fn process_prepend_path(context: &mut ExecutionContext, command: &Command) -> Result<()> {
    let directory = command.data.trim();
    if directory.is_empty() {
        bail!("Missing prepend path");
    }
    context.add_prepend_path(directory);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_manager::WorkerCommandManager;
    use crate::execution_context::make_test_context;

    fn run(ctx: &mut ExecutionContext, line: &str) -> Result<()> {
        let command = Command::try_parse(line).unwrap();
        TaskCommandExtension.process_command(ctx, &command)
    }

    #[test]
    fn log_issue_formats_source_location() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());

        run(
            &mut ctx,
            "##vso[task.logissue type=error;sourcepath=src/a.rs;linenumber=3;columnnumber=7;code=E1]bad",
        )
        .unwrap();
        run(&mut ctx, "##vso[task.issue type=Warning]careful").unwrap();

        assert_eq!(ctx.issues()[0].message, "src/a.rs(3,7): error E1: bad");
        assert_eq!(ctx.issues()[0].data.get("code").map(String::as_str), Some("E1"));
        assert_eq!(ctx.issues()[1].issue_type, IssueType::Warning);

        let err = run(&mut ctx, "##vso[task.logissue type=notice]x").unwrap_err();
        assert_eq!(err.to_string(), "issue type notice is not an expected issue type.");
    }

    #[test]
    fn set_progress_clamps() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        run(&mut ctx, "##vso[task.setprogress value=250]Copying").unwrap();
        assert_eq!(ctx.percent_complete(), 100);
        assert_eq!(ctx.current_operation(), Some("Copying"));
    }

    #[tokio::test]
    async fn complete_sets_result_and_fires_force_complete() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());

        let err = run(&mut ctx, "##vso[task.complete result=Nope]").unwrap_err();
        assert_eq!(err.to_string(), "Invalid task result");

        run(&mut ctx, "##vso[task.complete result=2]all done").unwrap();
        assert_eq!(ctx.result(), Some(TaskResult::Failed));
        tokio::time::timeout(std::time::Duration::from_secs(5), ctx.force_completed_token().cancelled())
            .await
            .unwrap();
    }

    #[test]
    fn set_variable_handles_secrets_and_read_only() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        ctx.variables().set_read_only("locked", "1", false);

        run(&mut ctx, "##vso[task.setvariable variable=token;issecret=true]hunter2").unwrap();
        run(&mut ctx, "##vso[task.setvariable variable=locked]2").unwrap();
        run(&mut ctx, "##vso[task.setvariable]orphan").unwrap();

        let token = ctx.variables().try_get_variable("token").unwrap();
        assert!(token.is_secret);
        assert_eq!(ctx.variables().get("locked").as_deref(), Some("1"));
        assert_eq!(ctx.warning_count(), 2);

        ctx.output("value is hunter2");
        assert_eq!(ctx.log_lines().last().unwrap(), "value is ********");
    }

    #[test]
    fn attachments_validate_type_name_and_file() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        let file = root.path().join("report.txt");
        std::fs::write(&file, "ok").unwrap();
        let file = file.to_string_lossy().into_owned();

        let err = run(&mut ctx, &format!("##vso[task.addattachment name=r]{file}")).unwrap_err();
        assert_eq!(err.to_string(), "Missing attachment type");
        let err = run(&mut ctx, &format!("##vso[task.addattachment type=a|b;name=r]{file}")).unwrap_err();
        assert_eq!(err.to_string(), "Type contain invalid characters.");
        let err = run(&mut ctx, "##vso[task.addattachment type=t;name=r]/no/such/file").unwrap_err();
        assert_eq!(err.to_string(), "Missing attachment file");

        run(&mut ctx, &format!("##vso[task.addattachment type=t;name=r]{file}")).unwrap();
        run(&mut ctx, &format!("##vso[task.uploadsummary]{file}")).unwrap();
        let err = run(&mut ctx, "##vso[task.uploadfile]").unwrap_err();
        assert_eq!(err.to_string(), "Cannot upload file");

        let attachments = ctx.attachments();
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[1].attachment_type, SUMMARY_ATTACHMENT_TYPE);
        assert_eq!(attachments[1].name, "report.txt");
    }

    #[test]
    fn log_detail_creates_and_updates_records() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        let id = Uuid::new_v4();

        let err = run(&mut ctx, "##vso[task.logdetail name=x]").unwrap_err();
        assert_eq!(err.to_string(), "Missing timeline record id");

        run(&mut ctx, &format!("##vso[task.logdetail id={id};name=Compile;type=build;order=1]starting")).unwrap();
        run(&mut ctx, &format!("##vso[task.logdetail id={id};state=Completed;result=Failed]")).unwrap();

        let record = ctx.detail_record(&id).unwrap();
        assert_eq!(record.name.as_deref(), Some("Compile"));
        assert_eq!(record.order, Some(1));
        assert_eq!(record.state, Some(TimelineRecordState::Completed));
        assert_eq!(record.result, Some(TaskResult::Failed));
        assert_eq!(record.percent_complete, Some(100));
    }

    #[test]
    fn prepend_path_and_unknown_event() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        run(&mut ctx, "##vso[task.prependpath]/opt/tool/bin").unwrap();
        assert_eq!(ctx.prepend_path(), vec!["/opt/tool/bin"]);

        let err = run(&mut ctx, "##vso[task.fly]").unwrap_err();
        assert_eq!(
            err.to_string(),
            "##vso[task.fly] is not a recognized command for Task command extension."
        );

        // Routed through the manager the failure is logged, not raised.
        assert!(WorkerCommandManager::new().try_process_command(&mut ctx, "##vso[task.fly]"));
        assert!(ctx.error_count() > 0);
    }
}
