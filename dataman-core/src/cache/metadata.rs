use std::{fmt, path::PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Observation-scoped dataset id, e.g. `GS-2006A-Q-1-2-003`.
#[derive(
    Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DatasetLabel(String);

impl DatasetLabel {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatasetLabel {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(
    Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum QaState {
    #[default]
    Undefined,
    Pass,
    Usable,
    Fail,
    Check,
}

impl QaState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Pass => "pass",
            Self::Usable => "usable",
            Self::Fail => "fail",
            Self::Check => "check",
        }
    }
}

impl fmt::Display for QaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed snapshot of one dataset file. Published snapshots are never
/// mutated; updates produce a new value via [`DatasetMetadata::apply`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub label: DatasetLabel,
    pub file: PathBuf,
    pub qa_state: QaState,
    pub release: Option<NaiveDate>,
    pub header_private: bool,
    /// Modification time of the file, milliseconds since the epoch.
    pub last_modified: i64,
}

impl DatasetMetadata {
    pub fn file_name(&self) -> Option<&str> {
        self.file.file_name().and_then(|name| name.to_str())
    }

    /// Returns a copy with every field present in `patch` applied.
    pub fn apply(&self, patch: &DatasetPatch) -> Self {
        let mut next = self.clone();
        if let Some(qa_state) = patch.qa_state {
            next.qa_state = qa_state;
        }
        if let Some(release) = patch.release {
            next.release = Some(release);
        }
        if let Some(header_private) = patch.header_private {
            next.header_private = header_private;
        }
        next
    }
}

/// One header field that has to be rewritten.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldChange {
    QaState(QaState),
    Release(NaiveDate),
    HeaderPrivate(bool),
}

/// Requested changes to a dataset. Absent fields are left alone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetPatch {
    pub qa_state: Option<QaState>,
    pub release: Option<NaiveDate>,
    pub header_private: Option<bool>,
}

impl DatasetPatch {
    pub fn qa_state(qa_state: QaState) -> Self {
        Self {
            qa_state: Some(qa_state),
            ..Self::default()
        }
    }

    pub fn release(release: NaiveDate, header_private: Option<bool>) -> Self {
        Self {
            release: Some(release),
            header_private,
            ..Self::default()
        }
    }

    /// Fields that are present in the patch and differ from `current`.
    pub fn changes(&self, current: &DatasetMetadata) -> Vec<FieldChange> {
        let mut changes = Vec::with_capacity(3);
        if let Some(qa_state) = self.qa_state
            && qa_state != current.qa_state
        {
            changes.push(FieldChange::QaState(qa_state));
        }
        if let Some(release) = self.release
            && current.release != Some(release)
        {
            changes.push(FieldChange::Release(release));
        }
        if let Some(header_private) = self.header_private
            && header_private != current.header_private
        {
            changes.push(FieldChange::HeaderPrivate(header_private));
        }
        changes
    }
}
