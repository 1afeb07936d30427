// TraceWriter mapping `ITraceWriter.cs`.
// The narrow logging seam handed to the process gateway, step hosts and docker manager.

use std::borrow::Cow;

/// Sink for diagnostic lines produced while launching and supervising processes.
pub trait TraceWriter: Send + Sync {
    fn info(&self, message: &str);

    fn verbose(&self, message: &str);

    fn warning(&self, message: &str) {
        self.info(&format!("##[warning]{message}"));
    }

    fn error(&self, message: &str) {
        self.info(&format!("##[error]{message}"));
    }
}

/// Forwards to the `tracing` crate, tagging every event with a component field.
#[derive(Debug, Clone)]
pub struct TracingTraceWriter {
    component: Cow<'static, str>,
}

impl TracingTraceWriter {
    pub fn new(component: impl Into<Cow<'static, str>>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }
}

impl Default for TracingTraceWriter {
    fn default() -> Self {
        Self::new("agent")
    }
}

impl TraceWriter for TracingTraceWriter {
    fn info(&self, message: &str) {
        tracing::info!(component = %self.component, "{}", message);
    }

    fn verbose(&self, message: &str) {
        tracing::debug!(component = %self.component, "{}", message);
    }

    fn warning(&self, message: &str) {
        tracing::warn!(component = %self.component, "{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(component = %self.component, "{}", message);
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTraceWriter;

impl TraceWriter for NullTraceWriter {
    fn info(&self, _message: &str) {}
    fn verbose(&self, _message: &str) {}
    fn warning(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceLevel {
    Info,
    Verbose,
    Warning,
    Error,
}

/// Keeps every line in memory so tests can assert on what a component traced.
#[derive(Debug, Default)]
pub struct CollectingTraceWriter {
    lines: parking_lot::Mutex<Vec<(TraceLevel, String)>>,
}

impl CollectingTraceWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(TraceLevel, String)> {
        self.lines.lock().clone()
    }

    /// True when any collected line at `level` contains `needle`.
    pub fn contains(&self, level: TraceLevel, needle: &str) -> bool {
        self.lines
            .lock()
            .iter()
            .any(|(l, m)| *l == level && m.contains(needle))
    }

    fn push(&self, level: TraceLevel, message: &str) {
        self.lines.lock().push((level, message.to_string()));
    }
}

impl TraceWriter for CollectingTraceWriter {
    fn info(&self, message: &str) {
        self.push(TraceLevel::Info, message);
    }

    fn verbose(&self, message: &str) {
        self.push(TraceLevel::Verbose, message);
    }

    fn warning(&self, message: &str) {
        self.push(TraceLevel::Warning, message);
    }

    fn error(&self, message: &str) {
        self.push(TraceLevel::Error, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_writer_keeps_levels_in_order() {
        let writer = CollectingTraceWriter::new();
        writer.info("starting");
        writer.verbose("args");
        writer.warning("slow");
        writer.error("boom");

        let lines = writer.lines();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], (TraceLevel::Info, "starting".to_string()));
        assert_eq!(lines[3], (TraceLevel::Error, "boom".to_string()));
        assert!(writer.contains(TraceLevel::Warning, "slo"));
        assert!(!writer.contains(TraceLevel::Info, "boom"));
    }

    #[test]
    fn default_warning_prefixes_info() {
        struct InfoOnly(parking_lot::Mutex<Vec<String>>);
        impl TraceWriter for InfoOnly {
            fn info(&self, message: &str) {
                self.0.lock().push(message.to_string());
            }
            fn verbose(&self, _message: &str) {}
        }

        let writer = InfoOnly(parking_lot::Mutex::new(Vec::new()));
        writer.warning("careful");
        writer.error("failed");
        assert_eq!(
            *writer.0.lock(),
            vec!["##[warning]careful".to_string(), "##[error]failed".to_string()]
        );
    }

    #[test]
    fn tracing_writer_keeps_component() {
        let writer = TracingTraceWriter::new("docker");
        assert_eq!(writer.component(), "docker");
        writer.info("no subscriber installed");
    }
}
