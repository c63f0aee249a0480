//! Error kinds for the protocol core, and their wire-format response codes.

use std::fmt;

/// The seven error kinds the protocol core can report, per the response
/// convention `E<KIND>: <text>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Image / frame / placement not found.
    NotFound,
    /// Bad key, bad value, unknown action, inconsistent parameters.
    Invalid,
    /// File read / copy / decode failed.
    BadFile,
    /// Cannot create a cache file.
    Io,
    /// Upload exceeds the per-file size limit.
    TooBig,
}

impl ErrorKind {
    /// The short textual code used in response strings (`Gi=1;ENOENT: ...`).
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "ENOENT",
            ErrorKind::Invalid => "EINVAL",
            ErrorKind::BadFile => "EBADF",
            ErrorKind::Io => "EIO",
            ErrorKind::TooBig => "EFBIG",
        }
    }
}

/// A protocol-level error: a kind plus a human-readable detail message.
#[derive(Debug, Clone)]
pub struct CoreError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl CoreError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        CoreError {
            kind,
            detail: detail.into(),
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, detail)
    }

    pub fn invalid(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invalid, detail)
    }

    pub fn bad_file(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadFile, detail)
    }

    pub fn io(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, detail)
    }

    pub fn too_big(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::TooBig, detail)
    }

    /// Render as the wire-format response body, e.g. `ENOENT: no such image`.
    pub fn response_code(&self) -> String {
        format!("{}: {}", self.kind.code(), self.detail)
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.response_code())
    }
}

impl std::error::Error for CoreError {}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_code_formats_kind_and_detail() {
        let err = CoreError::not_found("no such image");
        assert_eq!(err.response_code(), "ENOENT: no such image");
    }

    #[test]
    fn all_kinds_have_distinct_codes() {
        let kinds = [
            ErrorKind::NotFound,
            ErrorKind::Invalid,
            ErrorKind::BadFile,
            ErrorKind::Io,
            ErrorKind::TooBig,
        ];
        let codes: Vec<&str> = kinds.iter().map(|k| k.code()).collect();
        let mut sorted = codes.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), codes.len());
    }
}
