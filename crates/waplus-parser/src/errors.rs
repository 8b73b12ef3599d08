use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File-level decoding failure. Every variant records the byte offset where
/// decoding stopped so operators can locate the damage in the source file.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("no decoder registered for format `{format}`")]
    UnknownFormat { format: String },

    #[error("{decoder} header invalid at byte {byte_offset}: {message}")]
    InvalidHeader {
        decoder: &'static str,
        byte_offset: u64,
        message: String,
    },

    #[error("{decoder} input is not valid UTF-8 at byte {byte_offset}")]
    Encoding {
        decoder: &'static str,
        byte_offset: u64,
    },

    #[error("{decoder} input truncated at byte {byte_offset}: {message}")]
    Truncated {
        decoder: &'static str,
        byte_offset: u64,
        message: String,
    },

    #[error("{decoder} descriptor invalid at byte {byte_offset}: {message}")]
    Descriptor {
        decoder: &'static str,
        byte_offset: u64,
        message: String,
    },

    #[error("{decoder} file did not contain any data")]
    Empty { decoder: &'static str },
}

impl ParseError {
    pub fn byte_offset(&self) -> u64 {
        match self {
            ParseError::UnknownFormat { .. } | ParseError::Empty { .. } => 0,
            ParseError::InvalidHeader { byte_offset, .. }
            | ParseError::Encoding { byte_offset, .. }
            | ParseError::Truncated { byte_offset, .. }
            | ParseError::Descriptor { byte_offset, .. } => *byte_offset,
        }
    }

    pub fn reason(&self) -> String {
        self.to_string()
    }
}

/// Row-level marker yielded in-stream by tabular decoders. Sibling rows keep
/// decoding after one of these.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("row {row} (line {line}, byte {byte_offset}): {message}")]
pub struct RowError {
    /// 1-based data row, header excluded.
    pub row: u64,
    /// 1-based physical line in the source file.
    pub line: u64,
    pub byte_offset: u64,
    pub message: String,
}

impl RowError {
    pub fn new(row: u64, line: u64, byte_offset: u64, message: impl Into<String>) -> Self {
        Self {
            row,
            line,
            byte_offset,
            message: message.into(),
        }
    }
}
