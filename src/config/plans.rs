//! Stage plans: which stages a document passes through, by provenance.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::Provenance;

pub const CLEANUP: &str = "cleanup";
pub const EXTRACT_TERMS: &str = "extract_terms";
pub const LINK: &str = "link";
pub const CLASSIFY: &str = "classify";
pub const PLACE: &str = "place";

/// Provenance → ordered stage list. Missing entries fall back to the default plan.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct StagePlans {
    plans: BTreeMap<Provenance, Vec<String>>,
}

impl Default for StagePlans {
    fn default() -> Self {
        let full: Vec<String> = [CLEANUP, EXTRACT_TERMS, LINK, CLASSIFY, PLACE]
            .iter()
            .map(|s| s.to_string())
            .collect();
        // Committed documents are already clean and already placed.
        let committed: Vec<String> = [EXTRACT_TERMS, LINK, CLASSIFY]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let mut plans = BTreeMap::new();
        plans.insert(Provenance::Commit, committed);
        plans.insert(Provenance::Clipper, full.clone());
        plans.insert(Provenance::Manual, full.clone());
        plans.insert(Provenance::Other, full);
        Self { plans }
    }
}

impl StagePlans {
    pub fn new(plans: BTreeMap<Provenance, Vec<String>>) -> Self {
        Self { plans }
    }

    /// Stages for a document of this provenance.
    pub fn stages_for(&self, provenance: Provenance) -> Vec<String> {
        match self.plans.get(&provenance) {
            Some(stages) => stages.clone(),
            None => Self::default()
                .plans
                .remove(&provenance)
                .unwrap_or_default(),
        }
    }

    /// Stages are tracked by name within a record, so a plan may not name
    /// the same stage twice, and may not be empty.
    pub fn validate(&self) -> Result<()> {
        for (provenance, stages) in &self.plans {
            if stages.is_empty() {
                return Err(Error::Config(format!("plan for {provenance} has no stages")));
            }
            let mut seen = std::collections::BTreeSet::new();
            if let Some(repeated) = stages.iter().find(|s| !seen.insert(s.as_str())) {
                return Err(Error::Config(format!(
                    "plan for {provenance} names stage {repeated:?} more than once"
                )));
            }
        }
        Ok(())
    }

    /// Every stage name referenced by any plan.
    pub fn stage_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plans.values().flatten().cloned().collect();
        names.sort();
        names.dedup();
        names
    }
}
