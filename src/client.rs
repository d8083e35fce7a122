use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::util::default_true;

/// A registered caller of the engine and the ruleset it is assigned to.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    pub client_id: String,
    pub ruleset_id: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// A client-specific decision for one feature, optionally time-limited.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Override {
    pub client_id: String,
    pub feature_name: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Override {
    /// An override counts until the instant it expires.
    pub fn is_active_at(&self, now: &DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires_at| expires_at > *now)
    }

    /// The `clientId:featureName` key identifying this override.
    pub fn key(&self) -> String {
        override_key(&self.client_id, &self.feature_name)
    }
}

pub(crate) fn override_key(client_id: &str, feature_name: &str) -> String {
    format!("{}:{}", client_id, feature_name)
}

/// Maps client ids to their ruleset and their overrides.
#[derive(Clone, Debug, Default)]
pub struct ClientDirectory {
    clients: HashMap<String, ClientRecord>,
    overrides: HashMap<String, Vec<Override>>,
}

impl ClientDirectory {
    /// A later override for the same client and feature replaces an earlier one.
    pub fn new(clients: Vec<ClientRecord>, overrides: Vec<Override>) -> Self {
        let clients = clients
            .into_iter()
            .map(|c| (c.client_id.clone(), c))
            .collect();
        let mut by_client: HashMap<String, Vec<Override>> = HashMap::new();
        for o in overrides {
            let list = by_client.entry(o.client_id.clone()).or_default();
            list.retain(|existing| existing.feature_name != o.feature_name);
            list.push(o);
        }
        Self {
            clients,
            overrides: by_client,
        }
    }

    pub fn client(&self, client_id: &str) -> Option<&ClientRecord> {
        self.clients.get(client_id)
    }

    pub fn clients(&self) -> impl Iterator<Item = &ClientRecord> {
        self.clients.values()
    }

    /// The ruleset of an active client; None for unknown or inactive clients.
    pub fn get_assigned_ruleset(&self, client_id: &str) -> Option<&str> {
        self.client(client_id)
            .filter(|c| c.active)
            .map(|c| c.ruleset_id.as_str())
    }

    /// Every override stored for `client_id`, expired ones included.
    pub fn overrides(&self, client_id: &str) -> &[Override] {
        self.overrides
            .get(client_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn all_overrides(&self) -> impl Iterator<Item = &Override> {
        self.overrides.values().flatten()
    }

    /// Overrides of `client_id` that have not expired at `now`.
    pub fn get_active_overrides(&self, client_id: &str, now: &DateTime<Utc>) -> Vec<&Override> {
        self.overrides(client_id)
            .iter()
            .filter(|o| o.is_active_at(now))
            .collect()
    }

    pub fn active_override(
        &self,
        client_id: &str,
        feature_name: &str,
        now: &DateTime<Utc>,
    ) -> Option<&Override> {
        self.overrides(client_id)
            .iter()
            .find(|o| o.feature_name == feature_name && o.is_active_at(now))
    }
}
