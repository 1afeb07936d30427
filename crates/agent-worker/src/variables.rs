// Variables mapping `Variables.cs`.
// Case-insensitive variable store shared by every step of a job. Secrets are
// registered with the masker and kept out of the public partition.

use agent_common::constants::variables::{agent, build, retain, system, MACRO_PREFIX, MACRO_SUFFIX};
use agent_common::{SecretMasker, TaskResult};
use agent_sdk::VariableValue;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// One stored variable. `name` keeps the casing it was first set with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub value: String,
    pub is_secret: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("variable is read-only")]
pub struct ReadOnlyVariableError;

/// Thread-safe variable store. Cloning shares the same store.
#[derive(Clone)]
pub struct Variables {
    /// Keyed by lowercase name.
    store: Arc<RwLock<HashMap<String, Variable>>>,
    secret_masker: SecretMasker,
}

impl std::fmt::Debug for Variables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Variables")
            .field("count", &self.store.read().len())
            .finish()
    }
}

impl Variables {
    pub fn new(secret_masker: SecretMasker) -> Self {
        Self {
            store: Arc::new(RwLock::new(HashMap::new())),
            secret_masker,
        }
    }

    /// Build from the job's variable table, registering secrets with the masker.
    pub fn from_values(secret_masker: SecretMasker, values: &BTreeMap<String, VariableValue>) -> Self {
        let variables = Self::new(secret_masker);
        for (name, value) in values {
            if value.is_read_only {
                variables.set_read_only(name, &value.value, value.is_secret);
            } else {
                let _ = variables.set(name, &value.value, value.is_secret);
            }
        }
        variables
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.store
            .read()
            .get(&name.to_lowercase())
            .map(|v| v.value.clone())
    }

    pub fn try_get_variable(&self, name: &str) -> Option<Variable> {
        self.store.read().get(&name.to_lowercase()).cloned()
    }

    /// Add or update a variable.
    ///
    /// A variable that was secret stays secret. Read-only variables are refused.
    pub fn set(&self, name: &str, value: &str, is_secret: bool) -> Result<(), ReadOnlyVariableError> {
        let key = name.to_lowercase();
        let mut store = self.store.write();

        let was_secret = match store.get(&key) {
            Some(existing) if existing.is_read_only => return Err(ReadOnlyVariableError),
            Some(existing) => existing.is_secret,
            None => false,
        };
        let is_secret = is_secret || was_secret;
        if is_secret && !value.is_empty() {
            self.secret_masker.add_value(value);
        }

        store.insert(
            key,
            Variable {
                name: name.to_string(),
                value: value.to_string(),
                is_secret,
                is_read_only: false,
            },
        );
        Ok(())
    }

    pub fn set_read_only(&self, name: &str, value: &str, is_secret: bool) {
        if is_secret && !value.is_empty() {
            self.secret_masker.add_value(value);
        }
        self.store.write().insert(
            name.to_lowercase(),
            Variable {
                name: name.to_string(),
                value: value.to_string(),
                is_secret,
                is_read_only: true,
            },
        );
    }

    /// Non-secret variables, sorted by name.
    pub fn public(&self) -> Vec<(String, String)> {
        self.partition(false)
    }

    /// Secret variables, sorted by name.
    pub fn private(&self) -> Vec<(String, String)> {
        self.partition(true)
    }

    fn partition(&self, secret: bool) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .store
            .read()
            .values()
            .filter(|v| v.is_secret == secret)
            .map(|v| (v.name.clone(), v.value.clone()))
            .collect();
        pairs.sort();
        pairs
    }

    /// `true`/`false`, ignoring case. Anything else is `None`.
    pub fn get_boolean(&self, name: &str) -> Option<bool> {
        let value = self.get(name)?;
        match value.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name)?.trim().parse().ok()
    }

    pub fn get_guid(&self, name: &str) -> Option<Uuid> {
        Uuid::parse_str(self.get(name)?.trim()).ok()
    }

    /// Replace `$(name)` macros with variable values. Unknown names are left alone.
    pub fn expand_values(&self, input: &str) -> String {
        let store = self.store.read();
        let mut result = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find(MACRO_PREFIX) {
            let after_prefix = &rest[start + MACRO_PREFIX.len()..];
            let Some(end) = after_prefix.find(MACRO_SUFFIX) else {
                break;
            };

            let name = &after_prefix[..end];
            result.push_str(&rest[..start]);
            match store.get(&name.to_lowercase()) {
                Some(variable) => result.push_str(&variable.value),
                None => {
                    result.push_str(MACRO_PREFIX);
                    result.push_str(name);
                    result.push_str(MACRO_SUFFIX);
                }
            }
            rest = &after_prefix[end + MACRO_SUFFIX.len()..];
        }

        result.push_str(rest);
        result
    }

    /// Snapshot in the shape handed to out-of-process plugins.
    pub fn to_plugin_variables(&self) -> BTreeMap<String, VariableValue> {
        self.store
            .read()
            .values()
            .map(|v| {
                (
                    v.name.clone(),
                    VariableValue {
                        value: v.value.clone(),
                        is_secret: v.is_secret,
                        is_read_only: v.is_read_only,
                    },
                )
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    // -----------------------------------------------------------------------
    // Well-known variables
    // -----------------------------------------------------------------------

    pub fn system_debug(&self) -> bool {
        self.get_boolean(system::DEBUG).unwrap_or(false)
    }

    pub fn system_default_working_directory(&self) -> Option<String> {
        self.get(system::DEFAULT_WORKING_DIRECTORY)
            .filter(|s| !s.is_empty())
    }

    pub fn system_access_token(&self) -> Option<String> {
        self.get(system::ACCESS_TOKEN).filter(|s| !s.is_empty())
    }

    pub fn agent_root_directory(&self) -> Option<String> {
        self.get(agent::ROOT_DIRECTORY).filter(|s| !s.is_empty())
    }

    pub fn agent_temp_directory(&self) -> Option<String> {
        self.get(agent::TEMP_DIRECTORY).filter(|s| !s.is_empty())
    }

    pub fn agent_work_folder(&self) -> Option<String> {
        self.get(agent::WORK_FOLDER).filter(|s| !s.is_empty())
    }

    pub fn agent_container_network(&self) -> Option<String> {
        self.get(agent::CONTAINER_NETWORK).filter(|s| !s.is_empty())
    }

    pub fn agent_job_status(&self) -> Option<TaskResult> {
        self.get(agent::JOB_STATUS)?.parse().ok()
    }

    pub fn build_definition_name(&self) -> Option<String> {
        self.get(build::DEFINITION_NAME)
    }

    /// Keep the console's default output encoding instead of forcing UTF-8.
    pub fn retain_default_encoding(&self) -> bool {
        self.get_boolean(retain::DEFAULT_ENCODING).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> (Variables, SecretMasker) {
        let masker = SecretMasker::new();
        (Variables::new(masker.clone()), masker)
    }

    #[test]
    fn names_are_case_insensitive_but_keep_casing() {
        let (vars, _) = vars();
        vars.set("Build.SourceBranch", "main", false).unwrap();
        assert_eq!(vars.get("build.sourcebranch").as_deref(), Some("main"));
        assert_eq!(
            vars.public(),
            vec![("Build.SourceBranch".to_string(), "main".to_string())]
        );
    }

    #[test]
    fn secrets_are_private_masked_and_sticky() {
        let (vars, masker) = vars();
        vars.set("token", "abc123", true).unwrap();
        vars.set("plain", "x", false).unwrap();
        assert_eq!(masker.mask_secrets("abc123"), "********");
        assert_eq!(vars.private(), vec![("token".to_string(), "abc123".to_string())]);
        assert_eq!(vars.public(), vec![("plain".to_string(), "x".to_string())]);

        vars.set("TOKEN", "def456", false).unwrap();
        assert!(vars.try_get_variable("token").unwrap().is_secret);
        assert_eq!(masker.mask_secrets("def456"), "********");
    }

    #[test]
    fn read_only_refuses_updates() {
        let (vars, _) = vars();
        vars.set_read_only("system.accessToken", "t", true);
        assert_eq!(vars.set("System.AccessToken", "other", false), Err(ReadOnlyVariableError));
        assert_eq!(vars.system_access_token().as_deref(), Some("t"));
    }

    #[test]
    fn typed_getters() {
        let (vars, _) = vars();
        vars.set("system.debug", "True", false).unwrap();
        vars.set("count", " 42 ", false).unwrap();
        vars.set("bad", "yes", false).unwrap();
        vars.set("id", "8d1a43d7-7f3f-4c5c-9f5d-2f1f3a6f1e2b", false).unwrap();
        vars.set("agent.jobstatus", "SucceededWithIssues", false).unwrap();

        assert!(vars.system_debug());
        assert_eq!(vars.get_int("count"), Some(42));
        assert_eq!(vars.get_boolean("bad"), None);
        assert_eq!(vars.get_int("missing"), None);
        assert!(vars.get_guid("id").is_some());
        assert_eq!(vars.agent_job_status(), Some(TaskResult::SucceededWithIssues));
        assert!(!vars.retain_default_encoding());
    }

    #[test]
    fn expand_macros() {
        let (vars, _) = vars();
        vars.set("greeting", "hello", false).unwrap();
        vars.set("Target", "world", false).unwrap();
        assert_eq!(
            vars.expand_values("$(greeting) $(target) $(unknown) $(open"),
            "hello world $(unknown) $(open"
        );
    }

    #[test]
    fn from_values_keeps_flags() {
        let masker = SecretMasker::new();
        let mut values = BTreeMap::new();
        values.insert("a".to_string(), VariableValue::new("1", false));
        values.insert(
            "b".to_string(),
            VariableValue {
                value: "2".into(),
                is_secret: true,
                is_read_only: true,
            },
        );

        let vars = Variables::from_values(masker, &values);
        assert_eq!(vars.len(), 2);
        let plugin = vars.to_plugin_variables();
        assert!(plugin["b"].is_secret && plugin["b"].is_read_only);
        assert!(vars.set("b", "3", false).is_err());
    }
}
