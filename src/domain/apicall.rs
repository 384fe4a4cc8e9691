//! API call results
//!
//! Operations that touch several nodes do not fail as a whole; they report
//! what happened per node as a list of entries.

use crate::error::{Error, ErrorCategory};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Severity of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RcKind {
    Info,
    Warning,
    Error,
}

/// One line of an API call result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCallRcEntry {
    pub kind: RcKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correction: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub obj_refs: BTreeMap<String, String>,
}

impl ApiCallRcEntry {
    pub fn new(kind: RcKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            correction: None,
            obj_refs: BTreeMap::new(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(RcKind::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(RcKind::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(RcKind::Error, message)
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_correction(mut self, correction: impl Into<String>) -> Self {
        self.correction = Some(correction.into());
        self
    }

    pub fn with_ref(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.obj_refs.insert(key.into(), value.to_string());
        self
    }
}

/// Ordered list of result entries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCallRc {
    pub entries: Vec<ApiCallRcEntry>,
}

impl ApiCallRc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(entry: ApiCallRcEntry) -> Self {
        Self {
            entries: vec![entry],
        }
    }

    pub fn push(&mut self, entry: ApiCallRcEntry) {
        self.entries.push(entry);
    }

    pub fn extend(&mut self, other: ApiCallRc) {
        self.entries.extend(other.entries);
    }

    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|e| e.kind == RcKind::Error)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl From<&Error> for ApiCallRcEntry {
    fn from(err: &Error) -> Self {
        let entry = ApiCallRcEntry::error(err.to_string());
        match err.category() {
            ErrorCategory::AccessDenied => {
                entry.with_correction("Request the required access on the object")
            }
            ErrorCategory::Conflict => {
                entry.with_correction("Wait for the running operation to finish and retry")
            }
            ErrorCategory::Transient => entry.with_correction("Retry the operation"),
            _ => entry,
        }
    }
}

impl From<Error> for ApiCallRc {
    fn from(err: Error) -> Self {
        ApiCallRc::single(ApiCallRcEntry::from(&err))
    }
}
