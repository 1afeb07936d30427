// ArgUtil mapping `ArgUtil.cs`.
// Precondition checks that surface as a typed validation error instead of a panic.

use std::path::Path;

/// A required argument was missing or malformed. Always a caller bug.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArgumentError {
    #[error("Value cannot be null. (Parameter '{0}')")]
    Null(String),

    #[error("Value cannot be null or empty. (Parameter '{0}')")]
    NullOrEmpty(String),

    #[error("File not found: '{path}' (Parameter '{name}')")]
    FileNotFound { name: String, path: String },

    #[error("Directory not found: '{path}' (Parameter '{name}')")]
    DirectoryNotFound { name: String, path: String },

    #[error("{name} does not equal expected value. Expected '{expected}'. Actual '{actual}'.")]
    NotEqual {
        name: String,
        expected: String,
        actual: String,
    },
}

pub struct ArgUtil;

impl ArgUtil {
    pub fn not_null<T>(value: Option<&T>, name: &str) -> Result<(), ArgumentError> {
        match value {
            Some(_) => Ok(()),
            None => Err(ArgumentError::Null(name.to_string())),
        }
    }

    pub fn not_null_or_empty(value: &str, name: &str) -> Result<(), ArgumentError> {
        if value.is_empty() {
            return Err(ArgumentError::NullOrEmpty(name.to_string()));
        }
        Ok(())
    }

    pub fn equal<T: PartialEq + std::fmt::Debug>(
        expected: &T,
        actual: &T,
        name: &str,
    ) -> Result<(), ArgumentError> {
        if expected != actual {
            return Err(ArgumentError::NotEqual {
                name: name.to_string(),
                expected: format!("{expected:?}"),
                actual: format!("{actual:?}"),
            });
        }
        Ok(())
    }

    pub fn file_exists(path: &Path, name: &str) -> Result<(), ArgumentError> {
        if !path.is_file() {
            return Err(ArgumentError::FileNotFound {
                name: name.to_string(),
                path: path.display().to_string(),
            });
        }
        Ok(())
    }

    pub fn directory_exists(path: &Path, name: &str) -> Result<(), ArgumentError> {
        if !path.is_dir() {
            return Err(ArgumentError::DirectoryNotFound {
                name: name.to_string(),
                path: path.display().to_string(),
            });
        }
        Ok(())
    }
}
