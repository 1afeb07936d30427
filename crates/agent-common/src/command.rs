// Command mapping `Command.cs`.
// Parses logging commands of the form `##vso[area.event key=value;key=value]data`.

use std::collections::BTreeMap;

/// Marker that opens a logging command anywhere in an output line.
pub const LOGGING_COMMAND_PREFIX: &str = "##vso[";

struct EscapeMapping {
    token: &'static str,
    replacement: &'static str,
}

const ESCAPE_MAPPINGS: &[EscapeMapping] = &[
    EscapeMapping { token: ";", replacement: "%3B" },
    EscapeMapping { token: "\r", replacement: "%0D" },
    EscapeMapping { token: "\n", replacement: "%0A" },
    EscapeMapping { token: "]", replacement: "%5D" },
    EscapeMapping { token: "%", replacement: "%25" },
];

/// One parsed logging command. Lives for the line that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub area: String,
    pub event: String,
    pub properties: BTreeMap<String, String>,
    pub data: String,
}

impl Command {
    pub fn new(area: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            area: area.into(),
            event: event.into(),
            properties: BTreeMap::new(),
            data: String::new(),
        }
    }

    /// Property lookup ignoring the case of the key.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Parse the first logging command in `message`.
    ///
    /// The name must be exactly `area.event`; properties split on `;` and then on the
    /// first `=`, and pairs with an empty key or value are dropped.
    pub fn try_parse(message: &str) -> Option<Command> {
        if message.is_empty() {
            return None;
        }

        let prefix_index = message.find(LOGGING_COMMAND_PREFIX)?;
        let rb_index = prefix_index + message[prefix_index..].find(']')?;
        let cmd_info = &message[prefix_index + LOGGING_COMMAND_PREFIX.len()..rb_index];

        let (name, properties) = match cmd_info.find(' ') {
            Some(space) => (&cmd_info[..space], Some(&cmd_info[space + 1..])),
            None => (cmd_info, None),
        };

        let area_event: Vec<&str> = name.split('.').filter(|s| !s.is_empty()).collect();
        let [area, event] = area_event.as_slice() else {
            return None;
        };

        let mut command = Command::new(*area, *event);
        if let Some(properties) = properties {
            for entry in properties.split(';').filter(|s| !s.is_empty()) {
                let mut pair = entry.splitn(2, '=');
                let key = pair.next().unwrap_or_default();
                let value = pair.next().unwrap_or_default();
                if !key.is_empty() && !value.is_empty() {
                    command.properties.insert(key.to_string(), unescape(value));
                }
            }
        }
        command.data = unescape(&message[rb_index + 1..]);

        Some(command)
    }

    pub fn escape(value: &str) -> String {
        let mut escaped = value.to_string();
        for mapping in ESCAPE_MAPPINGS.iter().rev() {
            escaped = escaped.replace(mapping.token, mapping.replacement);
        }
        escaped
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}.{}", LOGGING_COMMAND_PREFIX, self.area, self.event)?;
        let mut first = true;
        for (key, value) in &self.properties {
            f.write_str(if first { " " } else { ";" })?;
            write!(f, "{}={}", key, Command::escape(value))?;
            first = false;
        }
        write!(f, "]{}", Command::escape(&self.data))
    }
}

fn unescape(escaped: &str) -> String {
    let mut result = escaped.to_string();
    for mapping in ESCAPE_MAPPINGS {
        result = result.replace(mapping.replacement, mapping.token);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_area_event_properties_and_data() {
        let cmd =
            Command::try_parse("##vso[task.setvariable variable=foo;issecret=true]bar").unwrap();
        assert_eq!(cmd.area, "task");
        assert_eq!(cmd.event, "setvariable");
        assert_eq!(cmd.property("variable"), Some("foo"));
        assert_eq!(cmd.property("IsSecret"), Some("true"));
        assert_eq!(cmd.data, "bar");
    }

    #[test]
    fn prefix_may_appear_mid_line() {
        let cmd = Command::try_parse("2024-01-01T00:00:00Z ##vso[task.debug]hello").unwrap();
        assert_eq!(cmd.event, "debug");
        assert_eq!(cmd.data, "hello");
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(Command::try_parse("").is_none());
        assert!(Command::try_parse("plain output").is_none());
        assert!(Command::try_parse("##vso[task]data").is_none());
        assert!(Command::try_parse("##vso[a.b.c]data").is_none());
        assert!(Command::try_parse("##vso[task.complete result=Failed").is_none());
        assert!(Command::try_parse("##[error]not a logging command").is_none());
    }

    #[test]
    fn drops_incomplete_properties() {
        let cmd = Command::try_parse("##vso[task.logissue type=;=x;code=CS1;;novalue]msg").unwrap();
        assert_eq!(cmd.properties.len(), 1);
        assert_eq!(cmd.property("code"), Some("CS1"));
    }

    #[test]
    fn value_keeps_later_equals_signs() {
        let cmd = Command::try_parse("##vso[task.setvariable variable=a=b]x").unwrap();
        assert_eq!(cmd.property("variable"), Some("a=b"));
    }

    #[test]
    fn unescapes_properties_and_data() {
        let cmd = Command::try_parse(
            "##vso[task.logissue type=error;sourcepath=a%3Bb%5D]line1%0Aline2%0D%25done",
        )
        .unwrap();
        assert_eq!(cmd.property("sourcepath"), Some("a;b]"));
        assert_eq!(cmd.data, "line1\nline2\r%done");
    }

    #[test]
    fn display_escapes() {
        let mut cmd = Command::new("task", "setvariable");
        cmd.properties.insert("variable".to_string(), "x;y".to_string());
        cmd.data = "50%\n".to_string();
        let rendered = cmd.to_string();
        assert_eq!(rendered, "##vso[task.setvariable variable=x%3By]50%25%0A");
        assert_eq!(Command::try_parse(&rendered).unwrap(), cmd);
    }
}
