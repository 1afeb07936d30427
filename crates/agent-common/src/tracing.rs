// Tracing mapping `Tracing.cs` and `TraceManager.cs`.
// Named diagnostic sources that mask secrets and then hand the line to the `tracing` crate.

use crate::secret_masker::SecretMasker;
use agent_sdk::TraceWriter;
use chrono::Utc;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceEventType {
    Verbose,
    Information,
    Warning,
    Error,
}

impl std::fmt::Display for TraceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceEventType::Verbose => write!(f, "VERB"),
            TraceEventType::Information => write!(f, "INFO"),
            TraceEventType::Warning => write!(f, "WARN"),
            TraceEventType::Error => write!(f, "ERR "),
        }
    }
}

/// A named trace source. All sources from one `TraceManager` share its `SecretMasker`.
#[derive(Clone)]
pub struct Tracing {
    name: String,
    secret_masker: SecretMasker,
    level: TraceEventType,
}

impl Tracing {
    pub fn new(name: impl Into<String>, secret_masker: SecretMasker, level: TraceEventType) -> Self {
        Self {
            name: name.into(),
            secret_masker,
            level,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Render a line the way it is handed to the subscriber.
    pub fn format(&self, event_type: TraceEventType, message: &str) -> String {
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%SZ");
        format!(
            "[{}][{}] {}: {}",
            timestamp,
            self.name,
            event_type,
            self.secret_masker.mask_secrets(message)
        )
    }

    fn trace(&self, event_type: TraceEventType, message: &str) {
        if event_type < self.level {
            return;
        }

        let formatted = self.format(event_type, message);
        match event_type {
            TraceEventType::Error => tracing::error!(component = %self.name, "{}", formatted),
            TraceEventType::Warning => tracing::warn!(component = %self.name, "{}", formatted),
            TraceEventType::Information => tracing::info!(component = %self.name, "{}", formatted),
            TraceEventType::Verbose => tracing::debug!(component = %self.name, "{}", formatted),
        }
    }

    pub fn entering(&self, name: &str) {
        self.verbose(&format!("Entering {}", name));
    }

    pub fn leaving(&self, name: &str) {
        self.verbose(&format!("Leaving {}", name));
    }

    /// Log an error with its whole cause chain.
    pub fn error_chain(&self, err: &anyhow::Error) {
        self.error(&format!("{}", err));
        for cause in err.chain().skip(1) {
            self.error(&format!("Caused by: {}", cause));
        }
    }
}

impl TraceWriter for Tracing {
    fn info(&self, message: &str) {
        self.trace(TraceEventType::Information, message);
    }

    fn verbose(&self, message: &str) {
        self.trace(TraceEventType::Verbose, message);
    }

    fn warning(&self, message: &str) {
        self.trace(TraceEventType::Warning, message);
    }

    fn error(&self, message: &str) {
        self.trace(TraceEventType::Error, message);
    }
}

/// Hands out named `Tracing` sources over one shared masker.
pub struct TraceManager {
    secret_masker: SecretMasker,
    level: TraceEventType,
}

impl TraceManager {
    pub fn new(secret_masker: SecretMasker) -> Self {
        Self {
            secret_masker,
            level: TraceEventType::Verbose,
        }
    }

    pub fn get(&self, name: &str) -> Tracing {
        Tracing::new(name, self.secret_masker.clone(), self.level)
    }

    pub fn get_writer(&self, name: &str) -> Arc<dyn TraceWriter> {
        Arc::new(self.get(name))
    }
}
