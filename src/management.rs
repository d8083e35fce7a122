use log::{info, warn};
use serde::Serialize;

use crate::audit::{AuditAction, AuditEvent, EntityType};
use crate::client::{override_key, ClientRecord, Override};
use crate::error::{ConfigurationError, ManagementError, ProviderError};
use crate::eval::Engine;
use crate::ruleset::{Ruleset, RulesetLookup};
use crate::schedule::Schedule;
use crate::snapshot::{Snapshot, SnapshotDocument};
use crate::targeting::TargetingRule;

/// RuleStore is the write side of the persistence layer.
///
/// The engine validates every change against its current snapshot before calling the store, and
/// reloads its snapshot from the [crate::RuleProvider] afterwards, so a store only has to persist
/// what it is given.
pub trait RuleStore: Send + Sync {
    /// Insert or replace a ruleset.
    fn put_ruleset(&self, ruleset: &Ruleset) -> Result<(), ProviderError>;

    fn delete_ruleset(&self, ruleset_id: &str) -> Result<(), ProviderError>;

    /// Insert or replace a client record.
    fn put_client(&self, client: &ClientRecord) -> Result<(), ProviderError>;

    /// Insert or replace the override of `client_override.client_id` for its feature.
    fn put_override(&self, client_override: &Override) -> Result<(), ProviderError>;

    fn delete_override(&self, client_id: &str, feature_name: &str) -> Result<(), ProviderError>;

    fn put_schedule(&self, schedule: &Schedule) -> Result<(), ProviderError>;

    fn delete_schedule(&self, schedule_id: &str) -> Result<(), ProviderError>;

    fn put_targeting_rule(&self, rule: &TargetingRule) -> Result<(), ProviderError>;

    fn delete_targeting_rule(&self, rule_id: &str) -> Result<(), ProviderError>;
}

struct Change {
    action: AuditAction,
    entity_type: EntityType,
    entity_id: String,
    before: Option<serde_json::Value>,
    after: Option<serde_json::Value>,
}

impl Change {
    fn new<T: Serialize>(
        action: AuditAction,
        entity_type: EntityType,
        entity_id: &str,
        before: Option<&T>,
        after: Option<&T>,
    ) -> Self {
        Self {
            action,
            entity_type,
            entity_id: entity_id.to_owned(),
            before: before.and_then(|v| serde_json::to_value(v).ok()),
            after: after.and_then(|v| serde_json::to_value(v).ok()),
        }
    }
}

fn find_schedule<'a>(snapshot: &'a Snapshot, schedule_id: &str) -> Option<&'a Schedule> {
    snapshot.schedules().schedules().find(|s| s.id == schedule_id)
}

fn find_rule<'a>(snapshot: &'a Snapshot, rule_id: &str) -> Option<&'a TargetingRule> {
    snapshot.targeting().rules().find(|r| r.id == rule_id)
}

fn find_override<'a>(
    snapshot: &'a Snapshot,
    client_id: &str,
    feature_name: &str,
) -> Option<&'a Override> {
    snapshot
        .directory()
        .overrides(client_id)
        .iter()
        .find(|o| o.feature_name == feature_name)
}

fn replace_by<T, F>(items: &mut Vec<T>, item: T, same: F)
where
    F: Fn(&T) -> bool,
{
    items.retain(|existing| !same(existing));
    items.push(item);
}

impl Engine {
    /// Validates the edited snapshot document, writes through the store, records the audit event
    /// and reloads the snapshot.
    fn commit<E, W>(
        &self,
        snapshot: &Snapshot,
        change: Change,
        actor: Option<&str>,
        edit: E,
        write: W,
    ) -> Result<(), ManagementError>
    where
        E: FnOnce(&mut SnapshotDocument),
        W: FnOnce(&dyn RuleStore) -> Result<(), ProviderError>,
    {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| ProviderError::Unavailable("no rule store configured".into()))?;

        let mut candidate = snapshot.to_document();
        edit(&mut candidate);
        candidate.validate()?;

        write(store.as_ref())?;

        let actor = self.actor(actor);
        info!(
            "{:?} {:?} {} by {}",
            change.action, change.entity_type, change.entity_id, actor
        );
        self.audit.record(AuditEvent {
            action: change.action,
            entity_type: change.entity_type,
            entity_id: change.entity_id,
            before: change.before,
            after: change.after,
            actor,
            timestamp: self.clock.now(),
        });

        if let Err(e) = self.refresh() {
            warn!("change stored but the snapshot could not be reloaded: {}", e);
        }
        Ok(())
    }

    pub fn create_ruleset(&self, ruleset: Ruleset, actor: Option<&str>) -> Result<(), ManagementError> {
        let snapshot = self.require_snapshot()?;
        if snapshot.ruleset(&ruleset.id).is_some() {
            return Err(ConfigurationError::Duplicate {
                entity: "ruleset",
                id: ruleset.id,
            }
            .into());
        }
        let change = Change::new(
            AuditAction::Create,
            EntityType::Ruleset,
            &ruleset.id,
            None,
            Some(&ruleset),
        );
        self.commit(
            &snapshot,
            change,
            actor,
            |document| document.rulesets.push(ruleset.clone()),
            |store| store.put_ruleset(&ruleset),
        )
    }

    pub fn update_ruleset(&self, ruleset: Ruleset, actor: Option<&str>) -> Result<(), ManagementError> {
        let snapshot = self.require_snapshot()?;
        let before = snapshot
            .ruleset(&ruleset.id)
            .ok_or_else(|| ManagementError::not_found("ruleset", &ruleset.id))?;
        let change = Change::new(
            AuditAction::Update,
            EntityType::Ruleset,
            &ruleset.id,
            Some(before),
            Some(&ruleset),
        );
        self.commit(
            &snapshot,
            change,
            actor,
            |document| replace_by(&mut document.rulesets, ruleset.clone(), |r| r.id == ruleset.id),
            |store| store.put_ruleset(&ruleset),
        )
    }

    /// Deletes a ruleset nothing refers to any more. The baseline, a parent of another ruleset
    /// and a ruleset assigned to a client cannot be deleted.
    pub fn delete_ruleset(&self, ruleset_id: &str, actor: Option<&str>) -> Result<(), ManagementError> {
        let snapshot = self.require_snapshot()?;
        let before = snapshot
            .ruleset(ruleset_id)
            .ok_or_else(|| ManagementError::not_found("ruleset", ruleset_id))?;

        let still_referenced = |referenced_by: String| ConfigurationError::StillReferenced {
            entity: "ruleset",
            id: ruleset_id.to_owned(),
            referenced_by,
        };
        if snapshot.baseline_ruleset_id() == ruleset_id {
            return Err(still_referenced("the baseline setting".into()).into());
        }
        if let Some(child) = snapshot
            .rulesets()
            .find(|r| r.parent_id.as_deref() == Some(ruleset_id))
        {
            return Err(still_referenced(format!("ruleset '{}'", child.id)).into());
        }
        if let Some(client) = snapshot
            .directory()
            .clients()
            .find(|c| c.ruleset_id == ruleset_id)
        {
            return Err(still_referenced(format!("client '{}'", client.client_id)).into());
        }

        let change = Change::new(
            AuditAction::Delete,
            EntityType::Ruleset,
            ruleset_id,
            Some(before),
            None,
        );
        self.commit(
            &snapshot,
            change,
            actor,
            |document| document.rulesets.retain(|r| r.id != ruleset_id),
            |store| store.delete_ruleset(ruleset_id),
        )
    }

    /// Creates `new_id` with the parent and direct features of `source_id`.
    pub fn clone_ruleset(
        &self,
        source_id: &str,
        new_id: &str,
        new_name: &str,
        actor: Option<&str>,
    ) -> Result<Ruleset, ManagementError> {
        let snapshot = self.require_snapshot()?;
        let source = snapshot
            .ruleset(source_id)
            .ok_or_else(|| ManagementError::not_found("ruleset", source_id))?;
        let copy = Ruleset {
            id: new_id.to_owned(),
            name: new_name.to_owned(),
            parent_id: source.parent_id.clone(),
            features: source.features.clone(),
        };
        self.create_ruleset(copy.clone(), actor)?;
        Ok(copy)
    }

    /// Points `client_id` at `ruleset_id`, registering the client if it is new.
    pub fn assign_client_ruleset(
        &self,
        client_id: &str,
        ruleset_id: &str,
        actor: Option<&str>,
    ) -> Result<(), ManagementError> {
        let snapshot = self.require_snapshot()?;
        let before = snapshot.directory().client(client_id);
        let after = match before {
            Some(existing) => ClientRecord {
                ruleset_id: ruleset_id.to_owned(),
                ..existing.clone()
            },
            None => ClientRecord {
                client_id: client_id.to_owned(),
                ruleset_id: ruleset_id.to_owned(),
                metadata: Default::default(),
                active: true,
            },
        };
        let change = Change::new(
            AuditAction::Assign,
            EntityType::Client,
            client_id,
            before,
            Some(&after),
        );
        self.commit(
            &snapshot,
            change,
            actor,
            |document| {
                replace_by(&mut document.clients, after.clone(), |c| c.client_id == client_id)
            },
            |store| store.put_client(&after),
        )
    }

    pub fn add_override(&self, client_override: Override, actor: Option<&str>) -> Result<(), ManagementError> {
        let snapshot = self.require_snapshot()?;
        let key = client_override.key();
        if find_override(&snapshot, &client_override.client_id, &client_override.feature_name).is_some() {
            return Err(ConfigurationError::Duplicate {
                entity: "override",
                id: key,
            }
            .into());
        }
        let change = Change::new(
            AuditAction::Create,
            EntityType::Override,
            &key,
            None,
            Some(&client_override),
        );
        self.commit(
            &snapshot,
            change,
            actor,
            |document| document.overrides.push(client_override.clone()),
            |store| store.put_override(&client_override),
        )
    }

    pub fn update_override(&self, client_override: Override, actor: Option<&str>) -> Result<(), ManagementError> {
        let snapshot = self.require_snapshot()?;
        let key = client_override.key();
        let before = find_override(&snapshot, &client_override.client_id, &client_override.feature_name)
            .ok_or_else(|| ManagementError::not_found("override", &key))?;
        let change = Change::new(
            AuditAction::Update,
            EntityType::Override,
            &key,
            Some(before),
            Some(&client_override),
        );
        self.commit(
            &snapshot,
            change,
            actor,
            |document| {
                replace_by(&mut document.overrides, client_override.clone(), |o| o.key() == key)
            },
            |store| store.put_override(&client_override),
        )
    }

    pub fn remove_override(
        &self,
        client_id: &str,
        feature_name: &str,
        actor: Option<&str>,
    ) -> Result<(), ManagementError> {
        let snapshot = self.require_snapshot()?;
        let key = override_key(client_id, feature_name);
        let before = find_override(&snapshot, client_id, feature_name)
            .ok_or_else(|| ManagementError::not_found("override", &key))?;
        let change = Change::new(AuditAction::Delete, EntityType::Override, &key, Some(before), None);
        self.commit(
            &snapshot,
            change,
            actor,
            |document| document.overrides.retain(|o| o.key() != key),
            |store| store.delete_override(client_id, feature_name),
        )
    }

    pub fn add_schedule(&self, schedule: Schedule, actor: Option<&str>) -> Result<(), ManagementError> {
        let snapshot = self.require_snapshot()?;
        if find_schedule(&snapshot, &schedule.id).is_some() {
            return Err(ConfigurationError::Duplicate {
                entity: "schedule",
                id: schedule.id,
            }
            .into());
        }
        let change = Change::new(
            AuditAction::Create,
            EntityType::Schedule,
            &schedule.id,
            None,
            Some(&schedule),
        );
        self.commit(
            &snapshot,
            change,
            actor,
            |document| document.schedules.push(schedule.clone()),
            |store| store.put_schedule(&schedule),
        )
    }

    pub fn update_schedule(&self, schedule: Schedule, actor: Option<&str>) -> Result<(), ManagementError> {
        let snapshot = self.require_snapshot()?;
        let before = find_schedule(&snapshot, &schedule.id)
            .ok_or_else(|| ManagementError::not_found("schedule", &schedule.id))?;
        let change = Change::new(
            AuditAction::Update,
            EntityType::Schedule,
            &schedule.id,
            Some(before),
            Some(&schedule),
        );
        self.commit(
            &snapshot,
            change,
            actor,
            |document| replace_by(&mut document.schedules, schedule.clone(), |s| s.id == schedule.id),
            |store| store.put_schedule(&schedule),
        )
    }

    pub fn delete_schedule(&self, schedule_id: &str, actor: Option<&str>) -> Result<(), ManagementError> {
        let snapshot = self.require_snapshot()?;
        let before = find_schedule(&snapshot, schedule_id)
            .ok_or_else(|| ManagementError::not_found("schedule", schedule_id))?;
        let change = Change::new(
            AuditAction::Delete,
            EntityType::Schedule,
            schedule_id,
            Some(before),
            None,
        );
        self.commit(
            &snapshot,
            change,
            actor,
            |document| document.schedules.retain(|s| s.id != schedule_id),
            |store| store.delete_schedule(schedule_id),
        )
    }

    pub fn add_targeting_rule(&self, rule: TargetingRule, actor: Option<&str>) -> Result<(), ManagementError> {
        let snapshot = self.require_snapshot()?;
        if find_rule(&snapshot, &rule.id).is_some() {
            return Err(ConfigurationError::Duplicate {
                entity: "targeting rule",
                id: rule.id,
            }
            .into());
        }
        let change = Change::new(
            AuditAction::Create,
            EntityType::TargetingRule,
            &rule.id,
            None,
            Some(&rule),
        );
        self.commit(
            &snapshot,
            change,
            actor,
            |document| document.targeting_rules.push(rule.clone()),
            |store| store.put_targeting_rule(&rule),
        )
    }

    pub fn update_targeting_rule(&self, rule: TargetingRule, actor: Option<&str>) -> Result<(), ManagementError> {
        let snapshot = self.require_snapshot()?;
        let before = find_rule(&snapshot, &rule.id)
            .ok_or_else(|| ManagementError::not_found("targeting rule", &rule.id))?;
        let change = Change::new(
            AuditAction::Update,
            EntityType::TargetingRule,
            &rule.id,
            Some(before),
            Some(&rule),
        );
        self.commit(
            &snapshot,
            change,
            actor,
            |document| replace_by(&mut document.targeting_rules, rule.clone(), |r| r.id == rule.id),
            |store| store.put_targeting_rule(&rule),
        )
    }

    pub fn delete_targeting_rule(&self, rule_id: &str, actor: Option<&str>) -> Result<(), ManagementError> {
        let snapshot = self.require_snapshot()?;
        let before = find_rule(&snapshot, rule_id)
            .ok_or_else(|| ManagementError::not_found("targeting rule", rule_id))?;
        let change = Change::new(
            AuditAction::Delete,
            EntityType::TargetingRule,
            rule_id,
            Some(before),
            None,
        );
        self.commit(
            &snapshot,
            change,
            actor,
            |document| document.targeting_rules.retain(|r| r.id != rule_id),
            |store| store.delete_targeting_rule(rule_id),
        )
    }
}
