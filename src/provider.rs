use crate::client::{ClientRecord, Override};
use crate::error::ProviderError;
use crate::ruleset::{Feature, Ruleset};
use crate::schedule::Schedule;
use crate::segment::Segment;
use crate::snapshot::{Snapshot, SnapshotDocument};
use crate::targeting::TargetingRule;

/// RuleProvider is the interface to the persistence layer that owns every ruleset, client,
/// override, schedule, targeting rule and segment the engine evaluates against.
///
/// The engine never calls these methods on the evaluation path. It calls
/// [RuleProvider::load_snapshot] when refreshing its cache and evaluates against the resulting
/// [Snapshot]. Implementations only need the lookup methods; the default `load_snapshot`
/// assembles a snapshot from them. A provider that can produce a whole consistent snapshot more
/// cheaply should override it.
pub trait RuleProvider: Send + Sync {
    /// Retrieve the ruleset with id `ruleset_id`.
    fn get_ruleset(&self, ruleset_id: &str) -> Result<Option<Ruleset>, ProviderError>;

    /// Retrieve `ruleset_id` followed by its ancestors up to the root.
    fn get_ancestor_chain(&self, ruleset_id: &str) -> Result<Vec<Ruleset>, ProviderError>;

    fn get_client_record(&self, client_id: &str) -> Result<Option<ClientRecord>, ProviderError>;

    /// Overrides of `client_id`. Expired overrides may be included; the engine filters them.
    fn get_active_overrides(&self, client_id: &str) -> Result<Vec<Override>, ProviderError>;

    fn get_active_schedules(&self, feature_name: &str) -> Result<Vec<Schedule>, ProviderError>;

    fn get_active_targeting_rules(
        &self,
        feature_name: &str,
    ) -> Result<Vec<TargetingRule>, ProviderError>;

    fn get_active_segments(&self) -> Result<Vec<Segment>, ProviderError>;

    /// Retrieve the designated fallback ruleset.
    fn get_baseline_ruleset(&self) -> Result<Ruleset, ProviderError>;

    /// The feature registry.
    fn list_features(&self) -> Result<Vec<Feature>, ProviderError>;

    fn list_ruleset_ids(&self) -> Result<Vec<String>, ProviderError>;

    fn list_client_ids(&self) -> Result<Vec<String>, ProviderError>;

    /// Every override, expired ones included.
    fn list_overrides(&self) -> Result<Vec<Override>, ProviderError>;

    /// Every schedule, inactive ones included.
    fn list_schedules(&self) -> Result<Vec<Schedule>, ProviderError>;

    /// Every targeting rule, inactive ones included.
    fn list_targeting_rules(&self) -> Result<Vec<TargetingRule>, ProviderError>;

    /// Every segment, inactive ones included.
    fn list_segments(&self) -> Result<Vec<Segment>, ProviderError>;

    /// Read everything into one consistent, validated [Snapshot].
    ///
    /// Inactive and expired records are part of the snapshot; evaluation skips them, and
    /// management operations can still find them.
    fn load_snapshot(&self) -> Result<Snapshot, ProviderError> {
        let features = self.list_features()?;
        let baseline = self.get_baseline_ruleset()?;

        let mut rulesets = Vec::new();
        for id in self.list_ruleset_ids()? {
            match self.get_ruleset(&id)? {
                Some(ruleset) => rulesets.push(ruleset),
                None => return Err(ProviderError::Malformed(format!("ruleset {} vanished", id))),
            }
        }
        if !rulesets.iter().any(|r| r.id == baseline.id) {
            rulesets.push(baseline.clone());
        }

        let mut clients = Vec::new();
        for client_id in self.list_client_ids()? {
            if let Some(client) = self.get_client_record(&client_id)? {
                clients.push(client);
            }
        }

        let document = SnapshotDocument {
            features,
            rulesets,
            baseline_ruleset_id: baseline.id,
            clients,
            overrides: self.list_overrides()?,
            schedules: self.list_schedules()?,
            targeting_rules: self.list_targeting_rules()?,
            segments: self.list_segments()?,
        };
        Snapshot::from_document(document).map_err(|e| ProviderError::Malformed(e.to_string()))
    }
}
