use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::info;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::client::{ClientDirectory, ClientRecord, Override};
use crate::error::{ConfigurationError, ProviderError};
use crate::provider::RuleProvider;
use crate::ruleset::{
    ancestor_chain, resolve_ruleset_features, Feature, ResolvedFeatures, Ruleset, RulesetLookup,
};
use crate::schedule::{Schedule, ScheduleEngine};
use crate::segment::Segment;
use crate::targeting::{TargetingEngine, TargetingRule};

/// The serialized form of a complete rule data set.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SnapshotDocument {
    #[serde(default)]
    pub features: Vec<Feature>,
    pub rulesets: Vec<Ruleset>,
    pub baseline_ruleset_id: String,
    #[serde(default)]
    pub clients: Vec<ClientRecord>,
    #[serde(default)]
    pub overrides: Vec<Override>,
    #[serde(default)]
    pub schedules: Vec<Schedule>,
    #[serde(default)]
    pub targeting_rules: Vec<TargetingRule>,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

fn check_unique<'a, I>(entity: &'static str, ids: I) -> Result<(), ConfigurationError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(ConfigurationError::Duplicate {
                entity,
                id: id.to_owned(),
            });
        }
    }
    Ok(())
}

impl SnapshotDocument {
    /// Checks the document as a whole: unique ids, existing parents and assignments, acyclic
    /// inheritance, a baseline, and well-formed rulesets, schedules, rules and segments.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        check_unique("feature", self.features.iter().map(|f| f.name.as_str()))?;
        check_unique("ruleset", self.rulesets.iter().map(|r| r.id.as_str()))?;
        check_unique("ruleset name", self.rulesets.iter().map(|r| r.name.as_str()))?;
        check_unique("client", self.clients.iter().map(|c| c.client_id.as_str()))?;
        check_unique("schedule", self.schedules.iter().map(|s| s.id.as_str()))?;
        check_unique("targeting rule", self.targeting_rules.iter().map(|r| r.id.as_str()))?;
        check_unique("segment", self.segments.iter().map(|s| s.name.as_str()))?;

        let rulesets: HashMap<String, Ruleset> = self
            .rulesets
            .iter()
            .map(|r| (r.id.clone(), r.clone()))
            .collect();
        if !rulesets.contains_key(&self.baseline_ruleset_id) {
            return Err(ConfigurationError::MissingBaseline);
        }
        for ruleset in &self.rulesets {
            ruleset.validate()?;
            ancestor_chain(&rulesets, &ruleset.id)?;
        }
        for client in &self.clients {
            if !rulesets.contains_key(&client.ruleset_id) {
                return Err(ConfigurationError::UnknownRuleset(client.ruleset_id.clone()));
            }
        }
        for o in &self.overrides {
            if !self.clients.iter().any(|c| c.client_id == o.client_id) {
                return Err(ConfigurationError::UnknownClient(o.client_id.clone()));
            }
        }
        for schedule in &self.schedules {
            schedule.validate()?;
        }
        for rule in &self.targeting_rules {
            rule.validate()?;
        }
        for segment in &self.segments {
            segment.validate()?;
        }
        Ok(())
    }
}

/// One consistent, immutable view of all rule data. Evaluations run against a single snapshot
/// from start to finish; refreshing replaces the snapshot as a whole.
#[derive(Clone, Debug)]
pub struct Snapshot {
    features: BTreeMap<String, Feature>,
    rulesets: HashMap<String, Ruleset>,
    baseline_ruleset_id: String,
    directory: ClientDirectory,
    schedules: ScheduleEngine,
    targeting: TargetingEngine,
}

impl Snapshot {
    /// Validates `document` and indexes it for evaluation.
    pub fn from_document(document: SnapshotDocument) -> Result<Self, ConfigurationError> {
        document.validate()?;
        Ok(Self::index(document))
    }

    /// Indexes `document` without validating it.
    pub(crate) fn index(document: SnapshotDocument) -> Self {
        Snapshot {
            features: document
                .features
                .into_iter()
                .map(|f| (f.name.clone(), f))
                .collect(),
            rulesets: document
                .rulesets
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect(),
            baseline_ruleset_id: document.baseline_ruleset_id,
            directory: ClientDirectory::new(document.clients, document.overrides),
            schedules: ScheduleEngine::new(document.schedules),
            targeting: TargetingEngine::new(document.targeting_rules, document.segments),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        let document: SnapshotDocument = serde_json::from_str(json)
            .map_err(|e| ConfigurationError::invalid("snapshot", "document", e))?;
        Self::from_document(document)
    }

    /// The document this snapshot was built from, with collections in a stable order.
    pub fn to_document(&self) -> SnapshotDocument {
        let mut rulesets: Vec<Ruleset> = self.rulesets.values().cloned().collect();
        rulesets.sort_by(|a, b| a.id.cmp(&b.id));
        let mut clients: Vec<ClientRecord> = self.directory.clients().cloned().collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        let mut overrides: Vec<Override> = self.directory.all_overrides().cloned().collect();
        overrides.sort_by_key(Override::key);
        let mut schedules: Vec<Schedule> = self.schedules.schedules().cloned().collect();
        schedules.sort_by(|a, b| (&a.feature_name, b.priority).cmp(&(&b.feature_name, a.priority)));
        let mut targeting_rules: Vec<TargetingRule> = self.targeting.rules().cloned().collect();
        targeting_rules
            .sort_by(|a, b| (&a.feature_name, b.priority).cmp(&(&b.feature_name, a.priority)));

        SnapshotDocument {
            features: self.features.values().cloned().collect(),
            rulesets,
            baseline_ruleset_id: self.baseline_ruleset_id.clone(),
            clients,
            overrides,
            schedules,
            targeting_rules,
            segments: self.targeting.segments().to_vec(),
        }
    }

    pub fn feature(&self, name: &str) -> Option<&Feature> {
        self.features.get(name)
    }

    pub fn rulesets(&self) -> impl Iterator<Item = &Ruleset> {
        self.rulesets.values()
    }

    pub fn baseline_ruleset_id(&self) -> &str {
        &self.baseline_ruleset_id
    }

    pub fn directory(&self) -> &ClientDirectory {
        &self.directory
    }

    pub fn schedules(&self) -> &ScheduleEngine {
        &self.schedules
    }

    pub fn targeting(&self) -> &TargetingEngine {
        &self.targeting
    }

    pub fn resolve(&self, ruleset_id: &str) -> Result<ResolvedFeatures, ConfigurationError> {
        resolve_ruleset_features(self, ruleset_id)
    }

    pub fn resolve_baseline(&self) -> Result<ResolvedFeatures, ConfigurationError> {
        self.resolve(&self.baseline_ruleset_id)
    }

    /// Every feature name the snapshot mentions, sorted: the registry, ruleset assignments,
    /// overrides, schedules and targeting rules.
    pub fn feature_names(&self) -> BTreeSet<&str> {
        let registry = self.features.keys().map(String::as_str);
        let assigned = self
            .rulesets
            .values()
            .flat_map(|r| r.features.keys().map(String::as_str));
        let overridden = self
            .directory
            .all_overrides()
            .map(|o| o.feature_name.as_str());
        let scheduled = self.schedules.schedules().map(|s| s.feature_name.as_str());
        let targeted = self.targeting.rules().map(|r| r.feature_name.as_str());
        registry
            .chain(assigned)
            .chain(overridden)
            .chain(scheduled)
            .chain(targeted)
            .collect()
    }
}

impl RulesetLookup for Snapshot {
    fn ruleset(&self, ruleset_id: &str) -> Option<&Ruleset> {
        self.rulesets.get(ruleset_id)
    }
}

impl RuleProvider for Snapshot {
    fn get_ruleset(&self, ruleset_id: &str) -> Result<Option<Ruleset>, ProviderError> {
        Ok(self.rulesets.get(ruleset_id).cloned())
    }

    fn get_ancestor_chain(&self, ruleset_id: &str) -> Result<Vec<Ruleset>, ProviderError> {
        ancestor_chain(self, ruleset_id)
            .map(|chain| chain.into_iter().cloned().collect())
            .map_err(|e| ProviderError::Malformed(e.to_string()))
    }

    fn get_client_record(&self, client_id: &str) -> Result<Option<ClientRecord>, ProviderError> {
        Ok(self.directory.client(client_id).cloned())
    }

    fn get_active_overrides(&self, client_id: &str) -> Result<Vec<Override>, ProviderError> {
        Ok(self.directory.overrides(client_id).to_vec())
    }

    fn get_active_schedules(&self, feature_name: &str) -> Result<Vec<Schedule>, ProviderError> {
        Ok(self
            .schedules
            .schedules_for(feature_name)
            .into_iter()
            .filter(|s| s.active)
            .cloned()
            .collect())
    }

    fn get_active_targeting_rules(
        &self,
        feature_name: &str,
    ) -> Result<Vec<TargetingRule>, ProviderError> {
        Ok(self
            .targeting
            .rules_for(feature_name)
            .iter()
            .filter(|r| r.active)
            .cloned()
            .collect())
    }

    fn get_active_segments(&self) -> Result<Vec<Segment>, ProviderError> {
        Ok(self
            .targeting
            .segments()
            .iter()
            .filter(|s| s.active)
            .cloned()
            .collect())
    }

    fn get_baseline_ruleset(&self) -> Result<Ruleset, ProviderError> {
        self.rulesets
            .get(&self.baseline_ruleset_id)
            .cloned()
            .ok_or_else(|| ProviderError::Malformed(ConfigurationError::MissingBaseline.to_string()))
    }

    fn list_features(&self) -> Result<Vec<Feature>, ProviderError> {
        Ok(self.features.values().cloned().collect())
    }

    fn list_ruleset_ids(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self.rulesets.keys().cloned().collect())
    }

    fn list_client_ids(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self.directory.clients().map(|c| c.client_id.clone()).collect())
    }

    fn list_overrides(&self) -> Result<Vec<Override>, ProviderError> {
        Ok(self.directory.all_overrides().cloned().collect())
    }

    fn list_schedules(&self) -> Result<Vec<Schedule>, ProviderError> {
        Ok(self.schedules.schedules().cloned().collect())
    }

    fn list_targeting_rules(&self) -> Result<Vec<TargetingRule>, ProviderError> {
        Ok(self.targeting.rules().cloned().collect())
    }

    fn list_segments(&self) -> Result<Vec<Segment>, ProviderError> {
        Ok(self.targeting.segments().to_vec())
    }

    fn load_snapshot(&self) -> Result<Snapshot, ProviderError> {
        Ok(self.clone())
    }
}

#[derive(Clone)]
struct CachedSnapshot {
    snapshot: Arc<Snapshot>,
    loaded_at: DateTime<Utc>,
}

/// Holds the last snapshot loaded from the provider.
///
/// Readers take a cheap clone of the current `Arc` and never wait for a refresh; a refresh swaps
/// in a complete new snapshot.
pub struct SnapshotCache {
    current: RwLock<Option<CachedSnapshot>>,
    ttl: Duration,
}

impl SnapshotCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            current: RwLock::new(None),
            ttl,
        }
    }

    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.current.read().as_ref().map(|c| Arc::clone(&c.snapshot))
    }

    pub fn replace(&self, snapshot: Snapshot, now: DateTime<Utc>) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        *self.current.write() = Some(CachedSnapshot {
            snapshot: Arc::clone(&snapshot),
            loaded_at: now,
        });
        info!("rule snapshot replaced at {}", now);
        snapshot
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.current.read().as_ref().map(|c| c.loaded_at)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.loaded_at().map(|loaded_at| now - loaded_at)
    }

    /// True when no snapshot was ever loaded or the current one is older than the TTL.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match (self.age(now), chrono::Duration::from_std(self.ttl)) {
            (Some(age), Ok(ttl)) => age >= ttl,
            (Some(_), Err(_)) => false,
            (None, _) => true,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
