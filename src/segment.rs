use serde::{Deserialize, Serialize};

use crate::condition::{evaluate_conditions, Condition, ConditionScope, Logic};
use crate::context::EvaluationContext;
use crate::error::{ConfigurationError, EvaluationError};
use crate::util::default_true;

/// A named, reusable condition list describing a user population.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub logic: Logic,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Segment {
    /// True when `context` belongs to this segment. Inactive segments contain nobody.
    pub fn contains(&self, context: &EvaluationContext, scope: &ConditionScope) -> bool {
        self.active && evaluate_conditions(&self.conditions, self.logic, context, scope)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigurationError> {
        self.conditions
            .iter()
            .try_for_each(Condition::validate)
            .map_err(|e: EvaluationError| ConfigurationError::invalid("segment", &self.name, e))
    }
}

/// Names of the segments in `segments` that contain `context`, in the order given.
pub fn segment_memberships(
    segments: &[Segment],
    context: &EvaluationContext,
    scope: &ConditionScope,
) -> Vec<String> {
    segments
        .iter()
        .filter(|segment| segment.contains(context, scope))
        .map(|segment| segment.name.clone())
        .collect()
}
