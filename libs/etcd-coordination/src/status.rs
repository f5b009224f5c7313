//! Two-valued status returned by the legacy write and lock accessors.

use std::fmt;

/// Outcome of a legacy write/lock call. Carries no error detail; use the
/// `Result`-returning variants when the cause matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    Err,
}

impl StatusCode {
    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }

    /// numeric form used by existing callers: `0` for ok, `1` for error
    pub fn as_i32(self) -> i32 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::Err => 1,
        }
    }
}

impl<T, E> From<&Result<T, E>> for StatusCode {
    fn from(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => StatusCode::Ok,
            Err(_) => StatusCode::Err,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCode::Ok => write!(f, "OK"),
            StatusCode::Err => write!(f, "ERR"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_result() {
        let ok: Result<(), String> = Ok(());
        let err: Result<(), String> = Err("boom".into());
        assert_eq!(StatusCode::from(&ok), StatusCode::Ok);
        assert_eq!(StatusCode::from(&err), StatusCode::Err);
        assert!(StatusCode::Ok.is_ok());
        assert!(!StatusCode::Err.is_ok());
    }

    #[test]
    fn test_numeric_and_display() {
        assert_eq!(StatusCode::Ok.as_i32(), 0);
        assert_eq!(StatusCode::Err.as_i32(), 1);
        assert_eq!(StatusCode::Ok.to_string(), "OK");
        assert_eq!(StatusCode::Err.to_string(), "ERR");
    }
}
