// StringUtil mapping `StringUtil.cs`.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Characters the agent refuses in attachment names and types.
pub const INVALID_FILE_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

pub struct StringUtil;

impl StringUtil {
    /// Indented JSON, used for anything a human reads in the log.
    pub fn convert_to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
        serde_json::to_string_pretty(value).context("Failed to serialize value to JSON")
    }

    /// Single-line JSON, used for environment variables and stdin payloads.
    pub fn convert_to_json_compact<T: Serialize + ?Sized>(value: &T) -> Result<String> {
        serde_json::to_string(value).context("Failed to serialize value to JSON")
    }

    pub fn convert_from_json<T: DeserializeOwned>(json: &str) -> Result<T> {
        serde_json::from_str(json).context("Failed to deserialize JSON")
    }

    /// `1`, `true`, `$true` map to true and `0`, `false`, `$false` to false, ignoring case.
    pub fn convert_to_bool(value: &str) -> Option<bool> {
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "$true" => Some(true),
            "0" | "false" | "$false" => Some(false),
            _ => None,
        }
    }

    pub fn convert_to_bool_or(value: Option<&str>, default: bool) -> bool {
        value.and_then(Self::convert_to_bool).unwrap_or(default)
    }

    pub fn contains_invalid_file_chars(value: &str) -> bool {
        value
            .chars()
            .any(|c| INVALID_FILE_CHARS.contains(&c) || (c as u32) < 0x20)
    }

    /// Wraps `value` in double quotes when it contains a character the command shell splits on.
    pub fn quote_if_needed(value: &str) -> String {
        if value.contains(' ') || value.contains('%') {
            format!("\"{value}\"")
        } else {
            value.to_string()
        }
    }
}
