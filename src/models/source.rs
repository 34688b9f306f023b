//! Clone source model

use serde::{Deserialize, Serialize};

/// How a virtual machine is cloned from its template
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloneMode {
    /// Independent copy of every template disk
    #[default]
    Full,
    /// Delta disks backed by a template snapshot
    Linked,
}

/// Which template snapshot a clone starts from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotRef {
    Current,
    Named(String),
}

impl SnapshotRef {
    pub fn name(&self) -> Option<&str> {
        match self {
            SnapshotRef::Current => None,
            SnapshotRef::Named(name) => Some(name),
        }
    }
}

/// Template a virtual machine is cloned from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub template: String,
    #[serde(default)]
    pub mode: CloneMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotRef>,
}

impl SourceSpec {
    pub fn full(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            mode: CloneMode::Full,
            snapshot: None,
        }
    }

    pub fn linked(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            mode: CloneMode::Linked,
            snapshot: None,
        }
    }

    pub fn with_snapshot(mut self, name: impl Into<String>) -> Self {
        self.snapshot = Some(SnapshotRef::Named(name.into()));
        self
    }

    pub fn is_linked(&self) -> bool {
        self.mode == CloneMode::Linked
    }

    /// Snapshot the clone needs. Linked clones fall back to the current one.
    pub fn effective_snapshot(&self) -> Option<SnapshotRef> {
        match (&self.snapshot, self.mode) {
            (Some(snapshot), _) => Some(snapshot.clone()),
            (None, CloneMode::Linked) => Some(SnapshotRef::Current),
            (None, CloneMode::Full) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_snapshot() {
        assert_eq!(SourceSpec::full("tmpl").effective_snapshot(), None);
        assert_eq!(
            SourceSpec::linked("tmpl").effective_snapshot(),
            Some(SnapshotRef::Current)
        );
        assert_eq!(
            SourceSpec::linked("tmpl").with_snapshot("snap1").effective_snapshot(),
            Some(SnapshotRef::Named("snap1".into()))
        );
    }

    #[test]
    fn test_source_deserialize_defaults() {
        let source: SourceSpec = serde_json::from_str(r#"{"template":"tmpl"}"#).unwrap();
        assert_eq!(source.mode, CloneMode::Full);
        assert!(source.snapshot.is_none());

        let source: SourceSpec =
            serde_json::from_str(r#"{"template":"tmpl","mode":"linked","snapshot":{"named":"s"}}"#)
                .unwrap();
        assert!(source.is_linked());
        assert_eq!(source.snapshot.as_ref().and_then(|s| s.name()), Some("s"));
    }
}
