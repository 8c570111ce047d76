//! Error types shared by the reader, codec, filter and pipeline.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GtError>;

/// A single malformed record. Workers log it, count it and move on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {reason}")]
pub struct ParseError {
    pub line: u64,
    pub reason: String,
}

impl ParseError {
    pub fn new(line: u64, reason: impl Into<String>) -> Self {
        Self {
            line,
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum GtError {
    #[error("parse error at {0}")]
    Parse(#[from] ParseError),

    /// Record-aligned streams disagree on the record at the same index.
    #[error("streams out of sync at chunk {chunk}, record {record}: {}", .tags.join(" != "))]
    Desync {
        chunk: u64,
        record: usize,
        tags: Vec<String>,
    },

    /// A stream ended (or a record was cut) while its siblings still had data.
    #[error("unexpected end of input in stream {stream} at line {line}")]
    TruncatedInput { stream: usize, line: u64 },

    #[error("cannot load annotation '{}': {reason}", .path.display())]
    AnnotationSource { path: PathBuf, reason: String },

    #[error("invalid filter parameter '{field}': {reason}")]
    FilterConfig { field: &'static str, reason: String },

    /// Templates of one record group that cannot be merged into one.
    #[error("cannot merge '{tag}': {reason}")]
    Merge { tag: String, reason: String },

    #[error("processing aborted after {processed} templates: {source}")]
    Aborted {
        processed: u64,
        #[source]
        source: Box<GtError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GtError {
    /// Fatal errors stop every worker; parse and merge errors only skip a
    /// record.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, GtError::Parse(_) | GtError::Merge { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_message() {
        let err: GtError = ParseError::new(12, "bad strand 'x'").into();
        let msg = format!("{err}");
        assert!(msg.contains("line 12"));
        assert!(msg.contains("bad strand"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_desync_message() {
        let err = GtError::Desync {
            chunk: 3,
            record: 7,
            tags: vec!["read1".to_string(), "read2".to_string()],
        };
        assert_eq!(
            format!("{err}"),
            "streams out of sync at chunk 3, record 7: read1 != read2"
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn test_aborted_keeps_source() {
        let err = GtError::Aborted {
            processed: 42,
            source: Box::new(GtError::TruncatedInput { stream: 1, line: 9 }),
        };
        let msg = format!("{err}");
        assert!(msg.contains("42 templates"));
        assert!(msg.contains("stream 1"));
    }
}
