#![cfg(test)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::json;

use crate::client::{override_key, ClientRecord, Override};
use crate::error::ProviderError;
use crate::management::RuleStore;
use crate::provider::RuleProvider;
use crate::ruleset::{Feature, Ruleset};
use crate::schedule::Schedule;
use crate::segment::Segment;
use crate::snapshot::{Snapshot, SnapshotDocument};
use crate::targeting::TargetingRule;

pub fn fixture_document() -> SnapshotDocument {
    serde_json::from_value(json!({
        "features": [
            {"name": "A"}, {"name": "B"}, {"name": "C"},
            {"name": "beta", "category": "experiments"},
            {"name": "core_feature", "isEnforced": true},
            {"name": "promo"}, {"name": "country_launch"},
            {"name": "new_checkout"}, {"name": "dark_mode"}
        ],
        "rulesets": [
            {
                "id": "baseline", "name": "Baseline",
                "features": {
                    "core_feature": {"enabled": true},
                    "A": {"enabled": true},
                    "dark_mode": {"enabled": false},
                    "country_launch": {"enabled": false}
                }
            },
            {
                "id": "starter", "name": "Starter",
                "features": {"A": {"enabled": true}, "core_feature": {"enabled": true}}
            },
            {
                "id": "pro", "name": "Pro", "parentId": "starter",
                "features": {
                    "A": {"enabled": false},
                    "B": {"enabled": true},
                    "core_feature": {"enabled": false}
                }
            },
            {
                "id": "enterprise", "name": "Enterprise", "parentId": "pro",
                "features": {"C": {"enabled": true}}
            },
            {
                "id": "beta_program", "name": "Beta program", "parentId": "starter",
                "features": {
                    "beta": {"enabled": true, "percentage": 50},
                    "country_launch": {"enabled": false},
                    "new_checkout": {"enabled": true},
                    "dark_mode": {"enabled": false}
                }
            }
        ],
        "baselineRulesetId": "baseline",
        "clients": [
            {"clientId": "acme", "rulesetId": "beta_program"},
            {"clientId": "globex", "rulesetId": "enterprise", "metadata": {"tier": "gold"}},
            {"clientId": "initech", "rulesetId": "pro"},
            {"clientId": "dormant", "rulesetId": "enterprise", "active": false}
        ],
        "overrides": [
            {"clientId": "acme", "featureName": "B", "enabled": true, "expiresAt": "2020-01-01T00:00:00Z"},
            {"clientId": "initech", "featureName": "C", "enabled": true, "reason": "trial"},
            {
                "clientId": "globex", "featureName": "B", "enabled": false,
                "reason": "billing hold", "expiresAt": "2099-01-01T00:00:00Z"
            }
        ],
        "schedules": [
            {
                "id": "launch", "featureName": "promo", "type": "one_time",
                "startAt": "2025-01-01T09:00:00Z", "enabledDuringSchedule": true
            },
            {
                "id": "retired", "featureName": "promo", "type": "date_range",
                "startAt": "2025-01-01T10:00:00Z", "enabledDuringSchedule": true, "active": false
            },
            {
                "id": "weekend_dark", "featureName": "dark_mode", "type": "recurring",
                "cronExpression": "* * * * sat,sun", "clientId": "acme", "enabledDuringSchedule": true
            }
        ],
        "targetingRules": [
            {
                "id": "na_launch", "featureName": "country_launch", "priority": 10, "action": "enable",
                "conditions": [{"attribute": "country", "operator": "in", "values": ["US", "CA"]}]
            },
            {
                "id": "vip_checkout", "featureName": "new_checkout", "priority": 20,
                "action": "variant", "variantValue": "express",
                "conditions": [{"attribute": "segments", "operator": "in", "values": ["vip"]}]
            },
            {
                "id": "beta_staff", "featureName": "beta", "priority": 1, "action": "enable",
                "active": false,
                "conditions": [{"attribute": "email", "operator": "ends_with", "value": "@acme.test"}]
            }
        ],
        "segments": [
            {"name": "vip", "conditions": [{"attribute": "plan", "operator": "equals", "value": "gold"}]}
        ]
    }))
    .unwrap()
}

pub fn fixture_snapshot() -> Snapshot {
    Snapshot::from_document(fixture_document()).unwrap()
}

/// Implements the lookup half of [RuleProvider] by asking `self.inner()` for a snapshot.
macro_rules! delegate_lookups {
    () => {
        fn get_ruleset(&self, ruleset_id: &str) -> Result<Option<Ruleset>, ProviderError> {
            self.inner()?.get_ruleset(ruleset_id)
        }

        fn get_ancestor_chain(&self, ruleset_id: &str) -> Result<Vec<Ruleset>, ProviderError> {
            self.inner()?.get_ancestor_chain(ruleset_id)
        }

        fn get_client_record(&self, client_id: &str) -> Result<Option<ClientRecord>, ProviderError> {
            self.inner()?.get_client_record(client_id)
        }

        fn get_active_overrides(&self, client_id: &str) -> Result<Vec<Override>, ProviderError> {
            self.inner()?.get_active_overrides(client_id)
        }

        fn get_active_schedules(&self, feature_name: &str) -> Result<Vec<Schedule>, ProviderError> {
            self.inner()?.get_active_schedules(feature_name)
        }

        fn get_active_targeting_rules(
            &self,
            feature_name: &str,
        ) -> Result<Vec<TargetingRule>, ProviderError> {
            self.inner()?.get_active_targeting_rules(feature_name)
        }

        fn get_active_segments(&self) -> Result<Vec<Segment>, ProviderError> {
            self.inner()?.get_active_segments()
        }

        fn get_baseline_ruleset(&self) -> Result<Ruleset, ProviderError> {
            self.inner()?.get_baseline_ruleset()
        }

        fn list_features(&self) -> Result<Vec<Feature>, ProviderError> {
            self.inner()?.list_features()
        }

        fn list_ruleset_ids(&self) -> Result<Vec<String>, ProviderError> {
            self.inner()?.list_ruleset_ids()
        }

        fn list_client_ids(&self) -> Result<Vec<String>, ProviderError> {
            self.inner()?.list_client_ids()
        }

        fn list_overrides(&self) -> Result<Vec<Override>, ProviderError> {
            self.inner()?.list_overrides()
        }

        fn list_schedules(&self) -> Result<Vec<Schedule>, ProviderError> {
            self.inner()?.list_schedules()
        }

        fn list_targeting_rules(&self) -> Result<Vec<TargetingRule>, ProviderError> {
            self.inner()?.list_targeting_rules()
        }

        fn list_segments(&self) -> Result<Vec<Segment>, ProviderError> {
            self.inner()?.list_segments()
        }
    };
}

/// Counts every snapshot load, optionally answering only after a delay.
pub struct CountingProvider {
    snapshot: Snapshot,
    loads: Arc<AtomicUsize>,
    delay: Duration,
}

impl CountingProvider {
    pub fn new(snapshot: Snapshot, loads: Arc<AtomicUsize>) -> Self {
        Self::slow(snapshot, loads, Duration::ZERO)
    }

    pub fn slow(snapshot: Snapshot, loads: Arc<AtomicUsize>, delay: Duration) -> Self {
        Self {
            snapshot,
            loads,
            delay,
        }
    }

    fn inner(&self) -> Result<Snapshot, ProviderError> {
        Ok(self.snapshot.clone())
    }
}

impl RuleProvider for CountingProvider {
    delegate_lookups!();

    fn load_snapshot(&self) -> Result<Snapshot, ProviderError> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.snapshot.clone())
    }
}

/// A provider that fails outright, fails after a delay, or serves one snapshot and then fails.
pub struct FailingProvider {
    snapshot: Option<Snapshot>,
    delay: Duration,
    served: AtomicBool,
}

impl FailingProvider {
    pub fn unavailable() -> Self {
        Self {
            snapshot: None,
            delay: Duration::ZERO,
            served: AtomicBool::new(true),
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::unavailable()
        }
    }

    pub fn after_first(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Some(snapshot),
            delay: Duration::ZERO,
            served: AtomicBool::new(false),
        }
    }

    fn inner(&self) -> Result<Snapshot, ProviderError> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        match &self.snapshot {
            Some(snapshot) if !self.served.swap(true, Ordering::SeqCst) => Ok(snapshot.clone()),
            _ => Err(ProviderError::Unavailable("connection refused".into())),
        }
    }
}

impl RuleProvider for FailingProvider {
    delegate_lookups!();

    fn load_snapshot(&self) -> Result<Snapshot, ProviderError> {
        self.inner()
    }
}

/// Keeps a snapshot document in memory and serves it as both provider and store.
pub struct MemoryStore {
    document: RwLock<SnapshotDocument>,
}

impl MemoryStore {
    pub fn new(document: SnapshotDocument) -> Self {
        Self {
            document: RwLock::new(document),
        }
    }

    fn inner(&self) -> Result<Snapshot, ProviderError> {
        Snapshot::from_document(self.document.read().clone())
            .map_err(|e| ProviderError::Malformed(e.to_string()))
    }
}

impl RuleProvider for MemoryStore {
    delegate_lookups!();

    fn load_snapshot(&self) -> Result<Snapshot, ProviderError> {
        self.inner()
    }
}

/// Reads a [MemoryStore] through the lookup methods only, so snapshots come from the default
/// `load_snapshot`.
pub struct LookupsOnly(pub Arc<MemoryStore>);

impl LookupsOnly {
    fn inner(&self) -> Result<Snapshot, ProviderError> {
        self.0.inner()
    }
}

impl RuleProvider for LookupsOnly {
    delegate_lookups!();
}

fn upsert<T, F>(items: &mut Vec<T>, item: T, same: F)
where
    F: Fn(&T) -> bool,
{
    match items.iter_mut().find(|existing| same(existing)) {
        Some(existing) => *existing = item,
        None => items.push(item),
    }
}

impl RuleStore for MemoryStore {
    fn put_ruleset(&self, ruleset: &Ruleset) -> Result<(), ProviderError> {
        upsert(&mut self.document.write().rulesets, ruleset.clone(), |r| r.id == ruleset.id);
        Ok(())
    }

    fn delete_ruleset(&self, ruleset_id: &str) -> Result<(), ProviderError> {
        self.document.write().rulesets.retain(|r| r.id != ruleset_id);
        Ok(())
    }

    fn put_client(&self, client: &ClientRecord) -> Result<(), ProviderError> {
        upsert(&mut self.document.write().clients, client.clone(), |c| {
            c.client_id == client.client_id
        });
        Ok(())
    }

    fn put_override(&self, client_override: &Override) -> Result<(), ProviderError> {
        let key = client_override.key();
        upsert(&mut self.document.write().overrides, client_override.clone(), |o| o.key() == key);
        Ok(())
    }

    fn delete_override(&self, client_id: &str, feature_name: &str) -> Result<(), ProviderError> {
        let key = override_key(client_id, feature_name);
        self.document.write().overrides.retain(|o| o.key() != key);
        Ok(())
    }

    fn put_schedule(&self, schedule: &Schedule) -> Result<(), ProviderError> {
        upsert(&mut self.document.write().schedules, schedule.clone(), |s| s.id == schedule.id);
        Ok(())
    }

    fn delete_schedule(&self, schedule_id: &str) -> Result<(), ProviderError> {
        self.document.write().schedules.retain(|s| s.id != schedule_id);
        Ok(())
    }

    fn put_targeting_rule(&self, rule: &TargetingRule) -> Result<(), ProviderError> {
        upsert(&mut self.document.write().targeting_rules, rule.clone(), |r| r.id == rule.id);
        Ok(())
    }

    fn delete_targeting_rule(&self, rule_id: &str) -> Result<(), ProviderError> {
        self.document.write().targeting_rules.retain(|r| r.id != rule_id);
        Ok(())
    }
}
