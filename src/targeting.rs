use std::cmp::Reverse;
use std::collections::HashMap;

use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::attribute_value::AttributeValue;
use crate::condition::{evaluate_conditions, Condition, ConditionScope, Logic};
use crate::context::EvaluationContext;
use crate::error::ConfigurationError;
use crate::segment::{segment_memberships, Segment};
use crate::util::default_true;

/// What a matching targeting rule does to its feature.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Enable,
    Disable,
    /// Selects a variant value without deciding whether the feature is enabled.
    Variant,
}

/// A prioritized, condition-based rule that can force a feature on or off.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetingRule {
    pub id: String,
    pub feature_name: String,
    /// When set, the rule only applies to clients resolved to this ruleset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ruleset_id: Option<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub logic: Logic,
    pub action: RuleAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_value: Option<AttributeValue>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl TargetingRule {
    fn applies_to(&self, ruleset_id: Option<&str>) -> bool {
        self.active
            && match &self.ruleset_id {
                Some(scope) => ruleset_id == Some(scope.as_str()),
                None => true,
            }
    }

    pub fn matches(&self, context: &EvaluationContext, scope: &ConditionScope) -> bool {
        evaluate_conditions(&self.conditions, self.logic, context, scope)
    }

    /// The enable/disable decision of this rule, or None for a variant rule.
    pub fn decision(&self) -> Option<bool> {
        match self.action {
            RuleAction::Enable => Some(true),
            RuleAction::Disable => Some(false),
            RuleAction::Variant => None,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigurationError> {
        if self.action == RuleAction::Variant && self.variant_value.is_none() {
            return Err(ConfigurationError::invalid(
                "targeting rule",
                &self.id,
                "variant rules need a variantValue",
            ));
        }
        self.conditions
            .iter()
            .try_for_each(Condition::validate)
            .map_err(|e| ConfigurationError::invalid("targeting rule", &self.id, e))
    }
}

/// Holds the active targeting rules of every feature, ordered by descending priority, and the
/// segments they can refer to.
#[derive(Clone, Debug, Default)]
pub struct TargetingEngine {
    rules: HashMap<String, Vec<TargetingRule>>,
    segments: Vec<Segment>,
}

impl TargetingEngine {
    /// Groups `rules` by feature. Rules with equal priority keep their relative order.
    pub fn new(rules: Vec<TargetingRule>, segments: Vec<Segment>) -> Self {
        let rules = rules
            .into_iter()
            .sorted_by_key(|rule| Reverse(rule.priority))
            .into_group_map_by(|rule| rule.feature_name.clone());
        Self { rules, segments }
    }

    /// Rules for `feature_name` in evaluation order, inactive ones included.
    pub fn rules_for(&self, feature_name: &str) -> &[TargetingRule] {
        self.rules
            .get(feature_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn rules(&self) -> impl Iterator<Item = &TargetingRule> {
        self.rules.values().flatten()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Finds the first rule, by descending priority, that applies to `ruleset_id` and matches
    /// `context` once the context is augmented with its segment memberships.
    pub fn evaluate(
        &self,
        context: &EvaluationContext,
        ruleset_id: Option<&str>,
        scope: &ConditionScope,
    ) -> Option<&TargetingRule> {
        let mut candidates = self
            .rules_for(scope.feature_name)
            .iter()
            .filter(|rule| rule.applies_to(ruleset_id))
            .peekable();
        candidates.peek()?;

        let augmented = context.with_segments(segment_memberships(&self.segments, context, scope));
        let matched = candidates.find(|rule| rule.matches(&augmented, scope));
        if let Some(rule) = matched {
            debug!(
                "targeting rule {} matched for {} ({:?})",
                rule.id, scope.feature_name, rule.action
            );
        }
        matched
    }
}
