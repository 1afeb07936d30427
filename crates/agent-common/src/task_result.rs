// TaskResult mapping `TaskResult.cs` and `Util/TaskResultUtil.cs`.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

const RETURN_CODE_OFFSET: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum TaskResult {
    Succeeded = 0,
    SucceededWithIssues = 1,
    Failed = 2,
    Canceled = 3,
    Skipped = 4,
    Abandoned = 5,
}

impl TaskResult {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(TaskResult::Succeeded),
            1 => Some(TaskResult::SucceededWithIssues),
            2 => Some(TaskResult::Failed),
            3 => Some(TaskResult::Canceled),
            4 => Some(TaskResult::Skipped),
            5 => Some(TaskResult::Abandoned),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskResult::Succeeded => "Succeeded",
            TaskResult::SucceededWithIssues => "SucceededWithIssues",
            TaskResult::Failed => "Failed",
            TaskResult::Canceled => "Canceled",
            TaskResult::Skipped => "Skipped",
            TaskResult::Abandoned => "Abandoned",
        }
    }

    pub fn to_return_code(self) -> i32 {
        RETURN_CODE_OFFSET + self as i32
    }

    pub fn from_return_code(code: i32) -> TaskResult {
        TaskResult::from_i32(code - RETURN_CODE_OFFSET).unwrap_or(TaskResult::Failed)
    }

    /// Keep the worse of two results; canceled, skipped and abandoned are never replaced.
    pub fn merge(current: Option<TaskResult>, coming: TaskResult) -> TaskResult {
        match current {
            None => coming,
            Some(current) if current > TaskResult::Failed => current,
            Some(current) => current.max(coming),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{0}' is not a valid task result")]
pub struct ParseTaskResultError(pub String);

/// Accepts the exact member name or its numeric value.
impl FromStr for TaskResult {
    type Err = ParseTaskResultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(number) = trimmed.parse::<i32>() {
            return TaskResult::from_i32(number).ok_or_else(|| ParseTaskResultError(s.to_string()));
        }
        [
            TaskResult::Succeeded,
            TaskResult::SucceededWithIssues,
            TaskResult::Failed,
            TaskResult::Canceled,
            TaskResult::Skipped,
            TaskResult::Abandoned,
        ]
        .into_iter()
        .find(|r| r.as_str() == trimmed)
        .ok_or_else(|| ParseTaskResultError(s.to_string()))
    }
}

impl std::fmt::Display for TaskResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_names_and_numbers() {
        assert_eq!("Failed".parse::<TaskResult>(), Ok(TaskResult::Failed));
        assert_eq!(
            "SucceededWithIssues".parse::<TaskResult>(),
            Ok(TaskResult::SucceededWithIssues)
        );
        assert_eq!("3".parse::<TaskResult>(), Ok(TaskResult::Canceled));
        assert!("failed".parse::<TaskResult>().is_err());
        assert!("9".parse::<TaskResult>().is_err());
        assert!("".parse::<TaskResult>().is_err());
    }

    #[test]
    fn return_codes() {
        assert_eq!(TaskResult::Succeeded.to_return_code(), 100);
        assert_eq!(TaskResult::Failed.to_return_code(), 102);
        assert_eq!(TaskResult::from_return_code(103), TaskResult::Canceled);
        assert_eq!(TaskResult::from_return_code(7), TaskResult::Failed);
    }

    #[test]
    fn merge_keeps_worst() {
        assert_eq!(TaskResult::merge(None, TaskResult::Succeeded), TaskResult::Succeeded);
        assert_eq!(
            TaskResult::merge(Some(TaskResult::SucceededWithIssues), TaskResult::Failed),
            TaskResult::Failed
        );
        assert_eq!(
            TaskResult::merge(Some(TaskResult::Failed), TaskResult::Succeeded),
            TaskResult::Failed
        );
        assert_eq!(
            TaskResult::merge(Some(TaskResult::Canceled), TaskResult::Failed),
            TaskResult::Canceled
        );
    }
}
