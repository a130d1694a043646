use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::models::RecordedEvent;

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentId(pub String);

impl ExperimentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Stable id for a data location: `exp-` plus 12 hex digits of its SHA-256.
    pub fn for_location(location: &str) -> Self {
        let digest = Sha256::digest(location.trim_end_matches('/').as_bytes());
        let hex = format!("{digest:x}");
        Self(format!("exp-{}", &hex[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ExperimentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Discovered,
    Registered,
    Analyzing,
    QcComplete,
    Analyzed,
    Archived,
}

impl ExperimentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Registered => "registered",
            Self::Analyzing => "analyzing",
            Self::QcComplete => "qc_complete",
            Self::Analyzed => "analyzed",
            Self::Archived => "archived",
        }
    }
}

impl std::str::FromStr for ExperimentStatus {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "discovered" => Ok(Self::Discovered),
            "registered" => Ok(Self::Registered),
            "analyzing" => Ok(Self::Analyzing),
            "qc_complete" => Ok(Self::QcComplete),
            "analyzed" => Ok(Self::Analyzed),
            "archived" => Ok(Self::Archived),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub name: String,
    pub location: String,
    pub status: ExperimentStatus,
    pub tags: BTreeSet<String>,
    pub metadata: BTreeMap<String, Value>,
    pub created_at_ms: u64,
    pub events: Vec<RecordedEvent>,
}

/// Registration input. `id` falls back to [`ExperimentId::for_location`].
#[derive(Clone, Debug, PartialEq)]
pub struct NewExperiment {
    pub id: Option<ExperimentId>,
    pub name: String,
    pub location: String,
    pub discovered: bool,
    pub tags: BTreeSet<String>,
    pub metadata: BTreeMap<String, Value>,
}

impl NewExperiment {
    pub fn new(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            location: location.into(),
            discovered: false,
            tags: BTreeSet::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn id(mut self, id: ExperimentId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn discovered(mut self, discovered: bool) -> Self {
        self.discovered = discovered;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn resolved_id(&self) -> ExperimentId {
        self.id
            .clone()
            .unwrap_or_else(|| ExperimentId::for_location(&self.location))
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExperimentFilter {
    pub status: Option<ExperimentStatus>,
    pub tag: Option<String>,
    pub name_contains: Option<String>,
}

impl ExperimentFilter {
    pub fn matches(&self, experiment: &Experiment) -> bool {
        if let Some(status) = self.status
            && experiment.status != status
        {
            return false;
        }
        if let Some(tag) = &self.tag
            && !experiment.tags.contains(tag)
        {
            return false;
        }
        if let Some(needle) = &self.name_contains
            && !experiment.name.contains(needle.as_str())
        {
            return false;
        }
        true
    }
}
