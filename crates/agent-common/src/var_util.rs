// VarUtil mapping `Util/VarUtil.cs`.
// Environment-map key rules for the current platform.

use crate::constants::{OsPlatform, CURRENT_PLATFORM};
use std::collections::HashMap;

pub struct VarUtil;

impl VarUtil {
    /// Environment keys ignore case on Windows only.
    pub fn env_var_keys_equal(a: &str, b: &str) -> bool {
        match CURRENT_PLATFORM {
            OsPlatform::Windows => a.eq_ignore_ascii_case(b),
            _ => a == b,
        }
    }

    /// The `agent.os` value for this platform.
    pub fn os() -> &'static str {
        match CURRENT_PLATFORM {
            OsPlatform::Linux => "Linux",
            OsPlatform::MacOS => "Darwin",
            OsPlatform::Windows => "Windows_NT",
        }
    }

    /// Insert `key`, replacing any existing key that is equal under the platform rule.
    pub fn set_env(env: &mut HashMap<String, String>, key: &str, value: &str) {
        if let Some(existing) = env
            .keys()
            .find(|k| k.as_str() != key && Self::env_var_keys_equal(k, key))
            .cloned()
        {
            env.remove(&existing);
        }
        env.insert(key.to_string(), value.to_string());
    }

    /// Lookup under the platform rule.
    pub fn get_env<'a>(env: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
        env.get(key).map(String::as_str).or_else(|| {
            env.iter()
                .find(|(k, _)| Self::env_var_keys_equal(k, key))
                .map(|(_, v)| v.as_str())
        })
    }

    /// `overrides` win over `base`.
    pub fn merge_env(
        base: &HashMap<String, String>,
        overrides: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        let mut merged = base.clone();
        for (key, value) in overrides {
            Self::set_env(&mut merged, key, value);
        }
        merged
    }
}
