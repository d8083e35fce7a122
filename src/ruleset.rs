use std::collections::{BTreeMap, HashMap, HashSet};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::util::default_percentage;

const PREALLOCATED_CHAIN_SIZE: usize = 8;

/// Registry metadata for a feature. The engine reads it but never changes it.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub is_enforced: bool,
}

/// A ruleset's direct assignment for one feature.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesetFeature {
    pub enabled: bool,
    /// Share of identities (0..=100) the feature is rolled out to when enabled.
    #[serde(default = "default_percentage")]
    pub percentage: u8,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl RulesetFeature {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            percentage: 100,
            config: Default::default(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::enabled()
        }
    }

    pub fn with_percentage(mut self, percentage: u8) -> Self {
        self.percentage = percentage;
        self
    }
}

/// A named, inheritable bundle of feature assignments.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ruleset {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub features: BTreeMap<String, RulesetFeature>,
}

impl Ruleset {
    pub(crate) fn validate(&self) -> Result<(), ConfigurationError> {
        if self.parent_id.as_deref() == Some(self.id.as_str()) {
            return Err(ConfigurationError::InheritanceCycle(self.id.clone()));
        }
        match self.features.iter().find(|(_, f)| f.percentage > 100) {
            Some((name, f)) => Err(ConfigurationError::invalid(
                "ruleset",
                &self.id,
                format!("percentage {} of {} is above 100", f.percentage, name),
            )),
            None => Ok(()),
        }
    }
}

/// A feature's effective assignment after inheritance has been applied.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedFeature {
    pub enabled: bool,
    pub percentage: u8,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub config: serde_json::Map<String, serde_json::Value>,
    /// The ruleset whose direct assignment won.
    pub source_ruleset_id: String,
    /// True when the winning assignment came from an ancestor.
    pub inherited: bool,
}

pub type ResolvedFeatures = BTreeMap<String, ResolvedFeature>;

/// Looks rulesets up by id. Implemented by anything holding ruleset data.
pub trait RulesetLookup {
    fn ruleset(&self, ruleset_id: &str) -> Option<&Ruleset>;
}

impl RulesetLookup for HashMap<String, Ruleset> {
    fn ruleset(&self, ruleset_id: &str) -> Option<&Ruleset> {
        self.get(ruleset_id)
    }
}

/// Returns `ruleset_id` followed by its ancestors up to the root.
///
/// Fails with [ConfigurationError::UnknownRuleset] if `ruleset_id` or any parent is missing, and
/// with [ConfigurationError::InheritanceCycle] rather than looping when a ruleset repeats.
pub fn ancestor_chain<'a, L: RulesetLookup + ?Sized>(
    lookup: &'a L,
    ruleset_id: &str,
) -> Result<Vec<&'a Ruleset>, ConfigurationError> {
    let mut seen = HashSet::with_capacity(PREALLOCATED_CHAIN_SIZE);
    let mut chain = Vec::with_capacity(PREALLOCATED_CHAIN_SIZE);
    let mut next = Some(ruleset_id);

    while let Some(id) = next {
        if !seen.insert(id) {
            warn!("ruleset {} inherits from itself through {}", ruleset_id, id);
            return Err(ConfigurationError::InheritanceCycle(id.to_owned()));
        }
        let ruleset = lookup
            .ruleset(id)
            .ok_or_else(|| ConfigurationError::UnknownRuleset(id.to_owned()))?;
        chain.push(ruleset);
        next = ruleset.parent_id.as_deref();
    }
    Ok(chain)
}

/// Merges the direct features of `ruleset_id` and its ancestors, root first, so that a closer
/// descendant always wins over an ancestor.
pub fn resolve_ruleset_features<L: RulesetLookup + ?Sized>(
    lookup: &L,
    ruleset_id: &str,
) -> Result<ResolvedFeatures, ConfigurationError> {
    let chain = ancestor_chain(lookup, ruleset_id)?;
    let mut resolved = ResolvedFeatures::new();
    for ruleset in chain.iter().rev() {
        for (name, feature) in &ruleset.features {
            resolved.insert(
                name.clone(),
                ResolvedFeature {
                    enabled: feature.enabled,
                    percentage: feature.percentage,
                    config: feature.config.clone(),
                    source_ruleset_id: ruleset.id.clone(),
                    inherited: ruleset.id != ruleset_id,
                },
            );
        }
    }
    Ok(resolved)
}
