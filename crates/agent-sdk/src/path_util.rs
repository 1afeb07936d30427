// PathUtil mapping `PathUtil.cs`.

use crate::io_util::IOUtil;

#[cfg(target_os = "windows")]
pub const PATH_VARIABLE: &str = "Path";
#[cfg(not(target_os = "windows"))]
pub const PATH_VARIABLE: &str = "PATH";

#[cfg(target_os = "windows")]
pub const PATH_SEPARATOR: char = ';';
#[cfg(not(target_os = "windows"))]
pub const PATH_SEPARATOR: char = ':';

pub struct PathUtil;

impl PathUtil {
    /// Prefix `current` with `prepend`. Nothing is added when `prepend` is already first.
    pub fn prepend_path(prepend: &str, current: &str) -> String {
        if prepend.is_empty() {
            return current.to_string();
        }
        if current.is_empty() {
            return prepend.to_string();
        }

        let prefix = format!("{prepend}{PATH_SEPARATOR}");
        if IOUtil::path_starts_with(current, &prefix) || IOUtil::paths_equal(current, prepend) {
            return current.to_string();
        }

        format!("{prepend}{PATH_SEPARATOR}{current}")
    }

    /// Join prepend entries so the most recently added directory wins the lookup.
    pub fn join_prepend_entries(entries: &[String]) -> String {
        entries
            .iter()
            .rev()
            .filter(|e| !e.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join(&PATH_SEPARATOR.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepend_onto_empty() {
        assert_eq!(PathUtil::prepend_path("/tools", ""), "/tools");
        assert_eq!(PathUtil::prepend_path("", "/usr/bin"), "/usr/bin");
    }

    #[test]
    fn prepend_keeps_existing_entries_after() {
        let current = format!("/usr/bin{PATH_SEPARATOR}/bin");
        assert_eq!(
            PathUtil::prepend_path("/tools", &current),
            format!("/tools{PATH_SEPARATOR}/usr/bin{PATH_SEPARATOR}/bin")
        );
    }

    #[test]
    fn prepend_is_idempotent_when_first() {
        let current = format!("/tools{PATH_SEPARATOR}/usr/bin");
        assert_eq!(PathUtil::prepend_path("/tools", &current), current);
    }

    #[test]
    fn later_entries_come_first() {
        let entries = vec!["/first".to_string(), String::new(), "/second".to_string()];
        assert_eq!(
            PathUtil::join_prepend_entries(&entries),
            format!("/second{PATH_SEPARATOR}/first")
        );
    }
}
