use std::collections::BTreeMap;
use std::path::Path;

use haven_core::{ConsentState, Role};
use haven_export::{InMemoryDirectory, InMemoryRecordSource, SourceRecord};
use serde::{Deserialize, Serialize};

use crate::error::{RootError, RootResult};

/// A JSON snapshot of the case-management side: staff roles, the consent
/// ledger and the source records. Stands in for the live systems when
/// running the CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub roles: BTreeMap<String, Vec<Role>>,
    #[serde(default)]
    pub consents: Vec<ConsentState>,
    #[serde(default)]
    pub records: Vec<SourceRecord>,
}

impl Fixture {
    pub fn load(path: &Path) -> RootResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RootError::Config(format!("cannot read fixture {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn directory(&self) -> InMemoryDirectory {
        let mut dir = InMemoryDirectory::new();
        for (actor, roles) in &self.roles {
            dir = dir.with_roles(actor.as_str(), roles.clone());
        }
        for consent in &self.consents {
            dir = dir.with_consent(consent.clone());
        }
        dir
    }

    pub fn record_source(&self) -> InMemoryRecordSource {
        InMemoryRecordSource::new(self.records.clone())
    }
}
