// Task plugin payload types mapping `AgentTaskPlugin.cs`.
// The records the worker hands to out-of-process plugins, shared with the
// worker's own endpoint and variable plumbing.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Name of the endpoint the agent uses to talk back to its own server.
pub const SYSTEM_VSS_CONNECTION: &str = "SystemVssConnection";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointAuthorization {
    pub scheme: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEndpoint {
    /// Nil for anonymous endpoints.
    #[serde(default)]
    pub id: Uuid,
    pub name: String,
    #[serde(default, rename = "type")]
    pub endpoint_type: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub authorization: Option<EndpointAuthorization>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl ServiceEndpoint {
    pub fn is_system_connection(&self) -> bool {
        self.name.eq_ignore_ascii_case(SYSTEM_VSS_CONNECTION)
    }

    pub fn authorization_parameter(&self, name: &str) -> Option<&str> {
        self.authorization.as_ref().and_then(|a| {
            a.parameters
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureFile {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub ticket: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryResource {
    pub alias: String,
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type")]
    pub repository_type: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
}

impl RepositoryResource {
    pub const SELF_ALIAS: &'static str = "self";

    /// String property lookup, ignoring case in the property name.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_str())
    }

    /// `versionInfo.author`, the identity that produced the checked-out commit.
    pub fn author(&self) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("versionInfo"))
            .and_then(|(_, v)| v.get("author"))
            .and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableValue {
    pub value: String,
    #[serde(default)]
    pub is_secret: bool,
    #[serde(default)]
    pub is_read_only: bool,
}

impl VariableValue {
    pub fn new(value: impl Into<String>, is_secret: bool) -> Self {
        Self {
            value: value.into(),
            is_secret,
            is_read_only: false,
        }
    }
}

/// Everything a plugin needs to run one task step, written to the plugin host's stdin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTaskPluginExecutionContext {
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    #[serde(default)]
    pub repositories: Vec<RepositoryResource>,
    #[serde(default)]
    pub endpoints: Vec<ServiceEndpoint>,
    #[serde(default)]
    pub variables: BTreeMap<String, VariableValue>,
    #[serde(default)]
    pub task_variables: BTreeMap<String, VariableValue>,
}

impl AgentTaskPluginExecutionContext {
    /// Case-insensitive input lookup. A required input that is missing or empty is an error.
    pub fn get_input(&self, name: &str, required: bool) -> anyhow::Result<Option<String>> {
        let value = self
            .inputs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone());

        if required && value.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("Input required and not supplied: {name}");
        }
        Ok(value)
    }

    pub fn get_variable(&self, name: &str) -> Option<&VariableValue> {
        self.variables
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_wire_shape() {
        let mut parameters = BTreeMap::new();
        parameters.insert("AccessToken".to_string(), "tok".to_string());
        let endpoint = ServiceEndpoint {
            id: Uuid::nil(),
            name: SYSTEM_VSS_CONNECTION.to_string(),
            endpoint_type: "ExternalTfs".to_string(),
            url: "https://dev.example.com/".to_string(),
            authorization: Some(EndpointAuthorization {
                scheme: "OAuth".to_string(),
                parameters,
            }),
            data: BTreeMap::new(),
        };

        let json = serde_json::to_value(&endpoint).unwrap();
        assert_eq!(json["type"], "ExternalTfs");
        assert_eq!(json["authorization"]["scheme"], "OAuth");
        assert!(endpoint.is_system_connection());
        assert_eq!(endpoint.authorization_parameter("accesstoken"), Some("tok"));
    }

    #[test]
    fn get_input_is_case_insensitive_and_checks_required() {
        let mut ctx = AgentTaskPluginExecutionContext::default();
        ctx.inputs.insert("Container".to_string(), "docker://alpine".to_string());
        ctx.inputs.insert("args".to_string(), String::new());

        assert_eq!(
            ctx.get_input("container", true).unwrap().as_deref(),
            Some("docker://alpine")
        );
        assert!(ctx.get_input("args", true).is_err());
        assert_eq!(ctx.get_input("args", false).unwrap().as_deref(), Some(""));
        assert!(ctx.get_input("missing", true).is_err());
    }

    #[test]
    fn repository_properties() {
        let repo: RepositoryResource = serde_json::from_value(serde_json::json!({
            "alias": "self",
            "version": "1a204f47",
            "properties": {
                "name": "octo/app",
                "ref": "refs/heads/main",
                "versionInfo": { "author": "mona" }
            }
        }))
        .unwrap();

        assert_eq!(repo.property("Name"), Some("octo/app"));
        assert_eq!(repo.property("ref"), Some("refs/heads/main"));
        assert_eq!(repo.author(), Some("mona"));
        assert_eq!(repo.property("path"), None);
    }

    #[test]
    fn plugin_context_uses_camel_case() {
        let mut ctx = AgentTaskPluginExecutionContext::default();
        ctx.task_variables
            .insert("token".to_string(), VariableValue::new("s3cret", true));
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["taskVariables"]["token"]["isSecret"], true);
        assert_eq!(json["taskVariables"]["token"]["isReadOnly"], false);
    }
}
