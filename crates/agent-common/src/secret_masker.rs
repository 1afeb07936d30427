// SecretMasker mapping `SecretMasker.cs`.
// Shared by every trace source and step log: registered values are replaced before a line is emitted.

use parking_lot::RwLock;
use std::sync::Arc;

pub const SECRET_MASK: &str = "********";

/// Thread-safe store of secret values. Cloning shares the same store.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    values: Arc<RwLock<Vec<String>>>,
}

impl SecretMasker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value. Blank values are ignored.
    ///
    /// Values are also registered in their JSON-escaped form, because endpoint
    /// authorization and relay payloads are logged as JSON.
    pub fn add_value(&self, secret: &str) {
        if secret.trim().is_empty() {
            return;
        }

        let mut candidates = vec![secret.to_string()];
        if let Ok(json) = serde_json::to_string(secret) {
            let escaped = json[1..json.len() - 1].to_string();
            if escaped != secret {
                candidates.push(escaped);
            }
        }

        let mut values = self.values.write();
        for candidate in candidates {
            if !values.contains(&candidate) {
                values.push(candidate);
            }
        }
        // Longest first so a secret containing another secret is masked whole.
        values.sort_by(|a, b| b.len().cmp(&a.len()));
    }

    pub fn mask_secrets(&self, input: &str) -> String {
        let values = self.values.read();
        let mut result = input.to_string();
        for value in values.iter() {
            if result.contains(value.as_str()) {
                result = result.replace(value.as_str(), SECRET_MASK);
            }
        }
        result
    }

    pub fn secret_count(&self) -> usize {
        self.values.read().len()
    }
}
