use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::attribute_value::AttributeValue;

/// Attribute holding the caller's user identity, used for percentage bucketing.
pub const USER_ID_ATTRIBUTE: &str = "userId";
/// Attribute the targeting engine fills with the names of the segments a context belongs to.
pub const SEGMENTS_ATTRIBUTE: &str = "segments";

/// The attributes of a single evaluation: who is asking, from where, with what.
///
/// An evaluation context is an arbitrary attribute map. By convention it contains a `userId`
/// string, which percentage rollouts hash on; everything else is free-form and can be reached
/// by conditions through dot-separated paths such as `"device.os.version"`.
///
/// Build one with [ContextBuilder], or deserialize it from a JSON object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvaluationContext {
    attributes: HashMap<String, AttributeValue>,
}

impl EvaluationContext {
    /// A context with no attributes at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a new [ContextBuilder].
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// Looks up an attribute. A path containing dots is walked through nested objects; a `Null`
    /// value at the end of the path counts as missing.
    ///
    /// An attribute whose literal name contains a dot is found before path traversal is tried.
    pub fn value_of(&self, attribute: &str) -> Option<&AttributeValue> {
        if let Some(value) = self.attributes.get(attribute) {
            return if value.is_null() { None } else { Some(value) };
        }

        let mut parts = attribute.split('.');
        let head = self.attributes.get(parts.next()?)?;
        head.get_path(parts)
    }

    /// The `userId` attribute rendered as a string, if present.
    pub fn user_id(&self) -> Option<String> {
        self.value_of(USER_ID_ATTRIBUTE)
            .filter(|v| !matches!(v, AttributeValue::Array(_) | AttributeValue::Object(_)))
            .and_then(AttributeValue::to_comparable_string)
    }

    pub fn attributes(&self) -> &HashMap<String, AttributeValue> {
        &self.attributes
    }

    /// Returns a copy of this context whose `segments` attribute lists `segment_names` after any
    /// segment names the caller already supplied.
    pub(crate) fn with_segments(&self, segment_names: Vec<String>) -> EvaluationContext {
        let mut attributes = self.attributes.clone();
        let mut segments = match attributes.remove(SEGMENTS_ATTRIBUTE) {
            Some(AttributeValue::Array(existing)) => existing,
            Some(AttributeValue::Null) | None => Vec::new(),
            Some(single) => vec![single],
        };
        segments.extend(segment_names.into_iter().map(AttributeValue::String));
        attributes.insert(SEGMENTS_ATTRIBUTE.to_owned(), AttributeValue::Array(segments));
        EvaluationContext { attributes }
    }
}

impl From<HashMap<String, AttributeValue>> for EvaluationContext {
    fn from(attributes: HashMap<String, AttributeValue>) -> Self {
        Self { attributes }
    }
}

impl<S, T> FromIterator<(S, T)> for EvaluationContext
where
    String: From<S>,
    AttributeValue: From<T>,
{
    fn from_iter<I: IntoIterator<Item = (S, T)>>(iter: I) -> Self {
        Self {
            attributes: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Contains methods for building an [EvaluationContext].
#[derive(Default)]
pub struct ContextBuilder {
    attributes: HashMap<String, AttributeValue>,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the `userId` attribute.
    pub fn user_id(&mut self, user_id: impl Into<String>) -> &mut Self {
        self.set_value(USER_ID_ATTRIBUTE, AttributeValue::String(user_id.into()))
    }

    /// Sets any attribute. Setting an attribute twice keeps the last value.
    pub fn set_value(&mut self, attribute: impl Into<String>, value: AttributeValue) -> &mut Self {
        self.attributes.insert(attribute.into(), value);
        self
    }

    /// Sets a string attribute.
    pub fn set_string(&mut self, attribute: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.set_value(attribute, AttributeValue::String(value.into()))
    }

    /// Removes an attribute that was previously set.
    pub fn remove(&mut self, attribute: &str) -> &mut Self {
        self.attributes.remove(attribute);
        self
    }

    pub fn build(&self) -> EvaluationContext {
        EvaluationContext {
            attributes: self.attributes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;
    use spectral::prelude::*;

    #[test]
    fn builds_context_with_user_id() {
        let context = ContextBuilder::new()
            .user_id("u-1")
            .set_string("country", "NZ")
            .build();

        assert_that!(context.user_id()).contains_value("u-1".to_string());
        assert_that!(context.value_of("country")).contains_value(&AttributeValue::from("NZ"));
        assert_that!(context.value_of("plan")).is_none();
    }

    #[test]
    fn numeric_user_ids_render_without_fraction() {
        let context = ContextBuilder::new()
            .set_value(USER_ID_ATTRIBUTE, 42_i64.into())
            .build();
        assert_that!(context.user_id()).contains_value("42".to_string());
    }

    #[test]
    fn looks_up_dot_paths() {
        let context: EvaluationContext = serde_json::from_str(
            r#"{
                "userId": "u-1",
                "device": {"os": {"name": "ios", "version": "17.2"}},
                "a.b": "literal",
                "nothing": null
            }"#,
        )
        .unwrap();

        assert_that!(context.value_of("device.os.name")).contains_value(&AttributeValue::from("ios"));
        assert_that!(context.value_of("a.b")).contains_value(&AttributeValue::from("literal"));
        assert_that!(context.value_of("device.os.build")).is_none();
        assert_that!(context.value_of("nothing")).is_none();
        assert_that!(context.value_of("userId.length")).is_none();
    }

    #[test]
    fn appends_segments_after_caller_supplied_ones() {
        let context: EvaluationContext = hashmap! {
            "segments".to_string() => AttributeValue::from(vec!["vip"]),
        }
        .into();

        let augmented = context.with_segments(vec!["beta_testers".to_string()]);
        assert_that!(augmented.value_of("segments"))
            .contains_value(&AttributeValue::from(vec!["vip", "beta_testers"]));

        let empty = EvaluationContext::empty().with_segments(vec![]);
        assert_that!(empty.value_of("segments")).contains_value(&AttributeValue::Array(vec![]));
    }
}
