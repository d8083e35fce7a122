use std::collections::HashMap;
use std::fmt;

use lazy_static::lazy_static;
use log::warn;
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::attribute_value::{AttributeValue, VersionTuple};
use crate::bucket::{BucketSalt, BucketingVersion};
use crate::context::EvaluationContext;
use crate::error::EvaluationError;

/// One attribute test inside a targeting rule or segment.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Condition {
    /// Attribute name or dot-separated path into the context.
    pub attribute: String,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<AttributeValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<AttributeValue>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    Gt,
    Gte,
    Lt,
    Lte,
    Regex,
    Percentage,
    SemverGt,
    SemverGte,
    SemverLt,
    SemverLte,
    SemverEq,
    Exists,
    NotExists,
    Before,
    After,
}

/// How the conditions of a rule or segment combine.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub enum Logic {
    #[default]
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

/// What a `percentage` condition hashes on besides the attribute itself.
#[derive(Clone, Copy, Debug)]
pub struct ConditionScope<'a> {
    /// Feature being evaluated; part of the bucketing input.
    pub feature_name: &'a str,
    /// Identity to bucket, when the caller knows one. Without it the attribute's own value is
    /// bucketed.
    pub salt: Option<BucketSalt<'a>>,
    pub bucketing: BucketingVersion,
}

impl<'a> ConditionScope<'a> {
    pub fn new(feature_name: &'a str) -> Self {
        Self {
            feature_name,
            salt: None,
            bucketing: BucketingVersion::default(),
        }
    }

    pub fn with_bucketing(mut self, bucketing: BucketingVersion) -> Self {
        self.bucketing = bucketing;
        self
    }

    pub fn with_salt(mut self, salt: BucketSalt<'a>) -> Self {
        self.salt = Some(salt);
        self
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::String(name)) => f.write_str(&name),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl Operator {
    /// Splits negated operators into their positive form and a negation flag.
    fn positive(self) -> (Operator, bool) {
        match self {
            Operator::NotEquals => (Operator::Equals, true),
            Operator::NotContains => (Operator::Contains, true),
            Operator::NotIn => (Operator::In, true),
            op => (op, false),
        }
    }

    fn compare(
        self,
        lhs: &AttributeValue,
        rhs: &AttributeValue,
        pattern: Option<&Regex>,
    ) -> Result<bool, EvaluationError> {
        match self {
            Operator::Equals => Ok(string_op(lhs, rhs, |l, r| l == r)),
            Operator::Contains => Ok(string_op(lhs, rhs, |l, r| l.contains(r))),
            Operator::StartsWith => Ok(string_op(lhs, rhs, |l, r| l.starts_with(r))),
            Operator::EndsWith => Ok(string_op(lhs, rhs, |l, r| l.ends_with(r))),
            Operator::In => Ok(list_op(lhs, rhs)),

            Operator::Gt => numeric_op(lhs, rhs, |l, r| l > r),
            Operator::Gte => numeric_op(lhs, rhs, |l, r| l >= r),
            Operator::Lt => numeric_op(lhs, rhs, |l, r| l < r),
            Operator::Lte => numeric_op(lhs, rhs, |l, r| l <= r),

            Operator::Regex => Ok(match (pattern, lhs.to_comparable_string()) {
                (Some(re), Some(text)) => re.is_match(&text),
                _ => false,
            }),

            Operator::SemverGt => semver_op(lhs, rhs, |l, r| l > r),
            Operator::SemverGte => semver_op(lhs, rhs, |l, r| l >= r),
            Operator::SemverLt => semver_op(lhs, rhs, |l, r| l < r),
            Operator::SemverLte => semver_op(lhs, rhs, |l, r| l <= r),
            Operator::SemverEq => semver_op(lhs, rhs, |l, r| l == r),

            Operator::Before => time_op(lhs, rhs, |l, r| l < r),
            Operator::After => time_op(lhs, rhs, |l, r| l > r),

            Operator::NotEquals
            | Operator::NotContains
            | Operator::NotIn
            | Operator::Percentage
            | Operator::Exists
            | Operator::NotExists => {
                warn!("operator {} should be special-cased, shouldn't get here", self);
                Ok(false)
            }
        }
    }
}

impl Condition {
    /// Evaluates this condition, reporting malformed data as an error.
    ///
    /// A missing attribute only satisfies `not_exists`; every other operator, negated ones
    /// included, is false for it. When the attribute holds an array, a positive operator matches
    /// if any element does, and a negated operator matches only if no element matches.
    pub fn evaluate(
        &self,
        context: &EvaluationContext,
        scope: &ConditionScope,
    ) -> Result<bool, EvaluationError> {
        let actual = context.value_of(&self.attribute);

        match self.operator {
            Operator::Exists => return Ok(actual.is_some()),
            Operator::NotExists => return Ok(actual.is_none()),
            _ => (),
        }

        let actual = match actual {
            Some(v) => v,
            None => return Ok(false),
        };

        if self.operator == Operator::Percentage {
            return self.percentage_matches(actual, scope);
        }

        let (op, negate) = self.operator.positive();
        let matched = match op {
            Operator::In => {
                let expected = self.expected_list();
                if expected.is_empty() {
                    return Err(EvaluationError::MissingExpectedValue(self.operator.to_string()));
                }
                actual
                    .find(|a| expected.iter().any(|e| list_op(a, e)))
                    .is_some()
            }
            _ => {
                let expected = self.expected_value()?;
                let pattern = match op {
                    Operator::Regex => Some(compile_regex(expected)?),
                    _ => None,
                };
                any_element(actual, |a| op.compare(a, expected, pattern.as_ref()))?
            }
        };

        Ok(if negate { !matched } else { matched })
    }

    /// Evaluates this condition; a malformed condition is logged and does not match.
    pub fn matches(&self, context: &EvaluationContext, scope: &ConditionScope) -> bool {
        match self.evaluate(context, scope) {
            Ok(matched) => matched,
            Err(e) => {
                warn!(
                    "condition on '{}' ({}) skipped: {}",
                    self.attribute, self.operator, e
                );
                false
            }
        }
    }

    /// Checks the expected side of the condition without a context, so malformed conditions can
    /// be rejected when rule data is loaded.
    pub fn validate(&self) -> Result<(), EvaluationError> {
        let (op, _) = self.operator.positive();
        match op {
            Operator::Exists | Operator::NotExists => Ok(()),
            Operator::In => {
                if self.expected_list().is_empty() {
                    Err(EvaluationError::MissingExpectedValue(self.operator.to_string()))
                } else {
                    Ok(())
                }
            }
            Operator::Regex => compile_regex(self.expected_value()?).map(|_| ()),
            Operator::Percentage => percentage_of(self.expected_value()?).map(|_| ()),
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                let expected = self.expected_value()?;
                expected
                    .to_f64()
                    .map(|_| ())
                    .ok_or_else(|| EvaluationError::NotNumeric(display(expected)))
            }
            Operator::SemverGt
            | Operator::SemverGte
            | Operator::SemverLt
            | Operator::SemverLte
            | Operator::SemverEq => {
                let expected = self.expected_value()?;
                expected
                    .as_version()
                    .map(|_| ())
                    .ok_or_else(|| EvaluationError::InvalidVersion(display(expected)))
            }
            Operator::Before | Operator::After => {
                let expected = self.expected_value()?;
                expected
                    .to_datetime()
                    .map(|_| ())
                    .ok_or_else(|| EvaluationError::InvalidDatetime(display(expected)))
            }
            _ => self.expected_value().map(|_| ()),
        }
    }

    fn expected_value(&self) -> Result<&AttributeValue, EvaluationError> {
        self.value
            .as_ref()
            .filter(|v| !v.is_null())
            .or_else(|| self.values.first())
            .ok_or_else(|| EvaluationError::MissingExpectedValue(self.operator.to_string()))
    }

    fn expected_list(&self) -> Vec<&AttributeValue> {
        if !self.values.is_empty() {
            return self.values.iter().collect();
        }
        match &self.value {
            Some(AttributeValue::Array(values)) => values.iter().collect(),
            Some(AttributeValue::Null) | None => Vec::new(),
            Some(single) => vec![single],
        }
    }

    fn percentage_matches(
        &self,
        actual: &AttributeValue,
        scope: &ConditionScope,
    ) -> Result<bool, EvaluationError> {
        let percentage = percentage_of(self.expected_value()?)?;
        let bucket = match scope.salt {
            Some(salt) => salt.bucket(scope.bucketing, scope.feature_name),
            None => match actual.to_comparable_string() {
                Some(key) => BucketSalt::User(&key).bucket(scope.bucketing, scope.feature_name),
                None => return Ok(false),
            },
        };
        Ok(crate::bucket::passes_percentage(bucket, percentage))
    }
}

/// Combines the results of `conditions` with `logic`. An empty condition list matches.
pub fn evaluate_conditions(
    conditions: &[Condition],
    logic: Logic,
    context: &EvaluationContext,
    scope: &ConditionScope,
) -> bool {
    if conditions.is_empty() {
        return true;
    }
    match logic {
        Logic::And => conditions.iter().all(|c| c.matches(context, scope)),
        Logic::Or => conditions.iter().any(|c| c.matches(context, scope)),
    }
}

fn any_element<F>(actual: &AttributeValue, f: F) -> Result<bool, EvaluationError>
where
    F: Fn(&AttributeValue) -> Result<bool, EvaluationError>,
{
    match actual {
        AttributeValue::Array(values) => {
            let mut first_error = None;
            for value in values {
                match f(value) {
                    Ok(true) => return Ok(true),
                    Ok(false) => (),
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            first_error.map_or(Ok(false), Err)
        }
        other => f(other),
    }
}

fn display(value: &AttributeValue) -> String {
    value
        .to_comparable_string()
        .unwrap_or_else(|| "null".to_owned())
}

const REGEX_CACHE_LIMIT: usize = 1024;

lazy_static! {
    static ref REGEX_CACHE: Mutex<HashMap<String, Regex>> = Mutex::new(HashMap::new());
}

/// Compiles a case-insensitive pattern, reusing an earlier compilation of the same pattern.
fn compile_regex(expected: &AttributeValue) -> Result<Regex, EvaluationError> {
    let pattern = display(expected);
    if let Some(regex) = REGEX_CACHE.lock().get(&pattern) {
        return Ok(regex.clone());
    }
    let regex = RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| EvaluationError::InvalidRegex {
            pattern: pattern.clone(),
            message: e.to_string(),
        })?;

    let mut cache = REGEX_CACHE.lock();
    if cache.len() >= REGEX_CACHE_LIMIT {
        cache.clear();
    }
    cache.insert(pattern, regex.clone());
    Ok(regex)
}

fn percentage_of(expected: &AttributeValue) -> Result<u8, EvaluationError> {
    match expected.to_f64() {
        Some(p) if (0.0..=100.0).contains(&p) => Ok(p.floor() as u8),
        _ => Err(EvaluationError::InvalidPercentage(display(expected))),
    }
}

fn string_op<F: Fn(&str, &str) -> bool>(lhs: &AttributeValue, rhs: &AttributeValue, f: F) -> bool {
    match (lhs.to_comparable_string(), rhs.to_comparable_string()) {
        (Some(l), Some(r)) => f(&l.to_lowercase(), &r.to_lowercase()),
        _ => false,
    }
}

fn list_op(lhs: &AttributeValue, rhs: &AttributeValue) -> bool {
    string_op(lhs, rhs, |l, r| l == r)
}

fn numeric_op<F: Fn(f64, f64) -> bool>(
    lhs: &AttributeValue,
    rhs: &AttributeValue,
    f: F,
) -> Result<bool, EvaluationError> {
    match (lhs.to_f64(), rhs.to_f64()) {
        (Some(l), Some(r)) => Ok(f(l, r)),
        (None, _) => Err(EvaluationError::NotNumeric(display(lhs))),
        (_, None) => Err(EvaluationError::NotNumeric(display(rhs))),
    }
}

fn time_op<F: Fn(chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>) -> bool>(
    lhs: &AttributeValue,
    rhs: &AttributeValue,
    f: F,
) -> Result<bool, EvaluationError> {
    match (lhs.to_datetime(), rhs.to_datetime()) {
        (Some(l), Some(r)) => Ok(f(l, r)),
        (None, _) => Err(EvaluationError::InvalidDatetime(display(lhs))),
        (_, None) => Err(EvaluationError::InvalidDatetime(display(rhs))),
    }
}

fn semver_op<F: Fn(VersionTuple, VersionTuple) -> bool>(
    lhs: &AttributeValue,
    rhs: &AttributeValue,
    f: F,
) -> Result<bool, EvaluationError> {
    match (lhs.as_version(), rhs.as_version()) {
        (Some(l), Some(r)) => Ok(f(l, r)),
        (None, _) => Err(EvaluationError::InvalidVersion(display(lhs))),
        (_, None) => Err(EvaluationError::InvalidVersion(display(rhs))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextBuilder;
    use maplit::hashmap;
    use spectral::prelude::*;
    use test_case::test_case;

    fn astring(s: &str) -> AttributeValue {
        AttributeValue::String(s.into())
    }
    fn anum(f: f64) -> AttributeValue {
        AttributeValue::Number(f)
    }

    fn condition(attribute: &str, operator: Operator, value: AttributeValue) -> Condition {
        Condition {
            attribute: attribute.into(),
            operator,
            value: Some(value),
            values: vec![],
        }
    }

    fn list_condition(attribute: &str, operator: Operator, values: Vec<&str>) -> Condition {
        Condition {
            attribute: attribute.into(),
            operator,
            value: None,
            values: values.into_iter().map(AttributeValue::from).collect(),
        }
    }

    fn context_with(attribute: &str, value: AttributeValue) -> EvaluationContext {
        ContextBuilder::new()
            .user_id("user-1")
            .set_value(attribute, value)
            .build()
    }

    fn check(op: Operator, actual: AttributeValue, expected: AttributeValue) -> bool {
        condition("a", op, expected).matches(&context_with("a", actual), &ConditionScope::new("f"))
    }

    #[test]
    fn test_op_equals() {
        assert!(check(Operator::Equals, astring("foo"), astring("foo")));
        assert!(check(Operator::Equals, astring("Foo"), astring("fOO")), "case insensitive");
        assert!(!check(Operator::Equals, astring("foo"), astring("bar")));
        assert!(check(Operator::Equals, anum(42.0), astring("42")), "compared as strings");
        assert!(check(Operator::Equals, AttributeValue::Bool(true), astring("TRUE")));

        assert!(check(Operator::NotEquals, astring("foo"), astring("bar")));
        assert!(!check(Operator::NotEquals, astring("foo"), astring("FOO")));
    }

    #[test]
    fn test_op_string_fragments() {
        assert!(check(Operator::Contains, astring("food"), astring("OO")));
        assert!(!check(Operator::Contains, astring("oo"), astring("food")));
        assert!(check(Operator::NotContains, astring("food"), astring("x")));
        assert!(!check(Operator::NotContains, astring("food"), astring("foo")));

        assert!(check(Operator::StartsWith, astring("Food"), astring("foo")));
        assert!(!check(Operator::StartsWith, astring("foo"), astring("food")));
        assert!(check(Operator::EndsWith, astring("FOOD"), astring("ood")));
        assert!(!check(Operator::EndsWith, astring("ood"), astring("food")));
    }

    #[test]
    fn test_op_in() {
        let scope = ConditionScope::new("f");
        let in_north_america = list_condition("country", Operator::In, vec!["US", "CA"]);
        let outside_north_america = list_condition("country", Operator::NotIn, vec!["US", "CA"]);

        let us = context_with("country", astring("us"));
        let fr = context_with("country", astring("FR"));

        assert!(in_north_america.matches(&us, &scope));
        assert!(!in_north_america.matches(&fr, &scope));
        assert!(!outside_north_america.matches(&us, &scope));
        assert!(outside_north_america.matches(&fr, &scope));

        let from_value = condition("country", Operator::In, AttributeValue::from(vec!["FR"]));
        assert!(from_value.matches(&fr, &scope), "list may be given as value");
    }

    #[test]
    fn test_op_in_against_array_attribute() {
        let scope = ConditionScope::new("f");
        let context = context_with("segments", AttributeValue::from(vec!["beta_testers", "vip"]));

        assert!(list_condition("segments", Operator::In, vec!["VIP"]).matches(&context, &scope));
        assert!(!list_condition("segments", Operator::In, vec!["staff"]).matches(&context, &scope));
        assert!(
            !list_condition("segments", Operator::NotIn, vec!["vip"]).matches(&context, &scope),
            "negation requires that no element matches"
        );
        assert!(list_condition("segments", Operator::NotIn, vec!["staff"]).matches(&context, &scope));
        assert!(condition("segments", Operator::Contains, astring("beta")).matches(&context, &scope));
    }

    #[test]
    fn test_ops_numeric() {
        assert!(check(Operator::Lt, anum(0.0), anum(1.0)));
        assert!(!check(Operator::Lt, anum(0.0), anum(0.0)));
        assert!(check(Operator::Lte, anum(0.0), anum(0.0)));
        assert!(check(Operator::Gt, anum(1.0), anum(0.0)));
        assert!(!check(Operator::Gt, anum(0.0), anum(0.0)));
        assert!(check(Operator::Gte, anum(0.0), anum(0.0)));

        assert!(
            check(Operator::Lt, astring("0"), anum(1.0)),
            "should convert numeric string on LHS"
        );
        assert!(
            check(Operator::Gt, anum(2.0), astring("1")),
            "should convert numeric string on RHS"
        );
    }

    #[test]
    fn non_numeric_comparison_is_an_error() {
        let c = condition("a", Operator::Gt, anum(7.0));
        let context = context_with("a", astring("Tuesday"));
        assert_that!(c.evaluate(&context, &ConditionScope::new("f")))
            .is_err_containing(EvaluationError::NotNumeric("Tuesday".into()));
        assert!(!c.matches(&context, &ConditionScope::new("f")));
    }

    #[test]
    fn test_op_regex() {
        fn should_match(text: &str, pattern: &str) {
            assert!(
                check(Operator::Regex, astring(text), astring(pattern)),
                "`{}` should match `{}`",
                text,
                pattern
            );
        }

        fn should_not_match(text: &str, pattern: &str) {
            assert!(
                !check(Operator::Regex, astring(text), astring(pattern)),
                "`{}` should not match `{}`",
                text,
                pattern
            );
        }

        should_match("hello world", "hello.*rld");
        should_match("hello world", "l+");
        should_match("hello world", "(world|planet)");
        should_match("Hello World", "^hello"); // case insensitive
        should_match("user@example.com", r"@example\.com$");

        should_not_match("hello world", "aloha");
        should_not_match("hello world", "***bad regex");
    }

    #[test]
    fn regex_compiles_once_per_pattern() {
        let pattern = astring("^cached-[0-9]+$");
        let first = compile_regex(&pattern).unwrap();
        assert!(REGEX_CACHE.lock().contains_key("^cached-[0-9]+$"));
        let second = compile_regex(&pattern).unwrap();
        assert_eq!(first.as_str(), second.as_str());
        assert!(second.is_match("CACHED-42"));

        assert!(compile_regex(&astring("(unclosed")).is_err());
        assert!(!REGEX_CACHE.lock().contains_key("(unclosed"));
    }

    #[test]
    fn invalid_regex_is_reported() {
        let c = condition("a", Operator::Regex, astring("(unclosed"));
        let result = c.evaluate(&context_with("a", astring("x")), &ConditionScope::new("f"));
        assert!(matches!(result, Err(EvaluationError::InvalidRegex { .. })));
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_semver_ops() {
        assert!(check(Operator::SemverEq, astring("2.0.0"), astring("2.0.0")));
        assert!(
            check(Operator::SemverEq, astring("2.0"), astring("2.0.0")),
            "we allow missing components (filled in with zeroes)"
        );
        assert!(check(Operator::SemverEq, astring("v2"), astring("2.0.0")));
        assert!(!check(Operator::SemverEq, astring("2.0.0"), astring("2.0.1")));

        assert!(check(Operator::SemverGt, astring("3.0.0"), astring("2.0.0")));
        assert!(check(Operator::SemverGt, astring("2.1.0"), astring("2.0.9")));
        assert!(check(Operator::SemverGt, astring("10.0.0"), astring("9.9.9")));
        assert!(!check(Operator::SemverGt, astring("2.0.0"), astring("2.0.0")));
        assert!(check(Operator::SemverGte, astring("2.0.0"), astring("2.0.0")));
        assert!(check(Operator::SemverLt, astring("1.9.0"), astring("2.0.0")));
        assert!(check(Operator::SemverLte, astring("2.0.0-rc.1"), astring("2.0.0")));
        assert!(
            !check(Operator::SemverLt, astring("2.0.0-rc.1"), astring("2.0.0")),
            "only the numeric components are compared"
        );

        assert!(!check(Operator::SemverEq, astring("2.0.0"), anum(2.0)));
    }

    #[test]
    fn test_ops_time() {
        assert!(check(
            Operator::Before,
            astring("2024-12-31T23:59:59Z"),
            astring("2025-01-01T00:00:00Z")
        ));
        assert!(!check(
            Operator::Before,
            astring("2025-01-01T00:00:00Z"),
            astring("2025-01-01T00:00:00Z")
        ));
        assert!(check(
            Operator::After,
            astring("2025-06-01"),
            astring("2025-01-01T00:00:00+02:00")
        ));
        assert!(!check(Operator::After, astring("fish"), astring("2025-01-01")));
    }

    #[test_case(Operator::Exists, true, false)]
    #[test_case(Operator::NotExists, false, true)]
    fn test_existence(op: Operator, when_present: bool, when_missing: bool) {
        let c = Condition {
            attribute: "plan".into(),
            operator: op,
            value: None,
            values: vec![],
        };
        let scope = ConditionScope::new("f");
        assert_eq!(c.matches(&context_with("plan", astring("pro")), &scope), when_present);
        assert_eq!(c.matches(&EvaluationContext::empty(), &scope), when_missing);
        assert_eq!(
            c.matches(&context_with("plan", AttributeValue::Null), &scope),
            when_missing,
            "null counts as missing"
        );
    }

    #[test_case(Operator::Equals)]
    #[test_case(Operator::NotEquals)]
    #[test_case(Operator::NotIn)]
    #[test_case(Operator::NotContains)]
    #[test_case(Operator::Gt)]
    #[test_case(Operator::Regex)]
    fn missing_attribute_never_matches(op: Operator) {
        let c = condition("missing", op, astring("1"));
        assert!(!c.matches(&context_with("a", astring("1")), &ConditionScope::new("f")));
    }

    #[test]
    fn test_dot_path_attribute() {
        let context: EvaluationContext = hashmap! {
            "user".to_string() => AttributeValue::from(hashmap! { "country" => "NZ" }),
        }
        .into();
        let c = condition("user.country", Operator::Equals, astring("nz"));
        assert!(c.matches(&context, &ConditionScope::new("f")));
    }

    #[test]
    fn test_op_percentage() {
        // "user-1" lands in bucket 90 for "beta", "user-2" in bucket 55
        let fifty = condition("userId", Operator::Percentage, anum(50.0));
        let ninety = condition("userId", Operator::Percentage, anum(90.0));
        let user_1 = ContextBuilder::new().user_id("user-1").build();
        let user_2 = ContextBuilder::new().user_id("user-2").build();
        let scope = ConditionScope::new("beta").with_bucketing(BucketingVersion::V1);

        assert!(!fifty.matches(&user_1, &scope));
        assert!(!fifty.matches(&user_2, &scope));
        assert!(ninety.matches(&user_1, &scope));
        assert!(ninety.matches(&user_2, &scope));

        // with an explicit salt the identity, not the attribute, is hashed; bucket 39
        let salted = scope.with_salt(BucketSalt::ClientAndUser("acme", "user-2"));
        assert!(fifty.matches(&user_1, &salted));
    }

    #[test]
    fn out_of_range_percentage_is_an_error() {
        let c = condition("userId", Operator::Percentage, anum(150.0));
        assert!(c.validate().is_err());
        assert!(!c.matches(
            &ContextBuilder::new().user_id("u").build(),
            &ConditionScope::new("f")
        ));
    }

    #[test]
    fn test_logic() {
        let scope = ConditionScope::new("f");
        let context = ContextBuilder::new()
            .set_string("country", "US")
            .set_string("plan", "free")
            .build();
        let conditions = vec![
            condition("country", Operator::Equals, astring("US")),
            condition("plan", Operator::Equals, astring("pro")),
        ];

        assert!(!evaluate_conditions(&conditions, Logic::And, &context, &scope));
        assert!(evaluate_conditions(&conditions, Logic::Or, &context, &scope));
        assert!(evaluate_conditions(&[], Logic::And, &context, &scope));
    }

    #[test]
    fn parses_condition_json() {
        let c: Condition = serde_json::from_str(
            r#"{"attribute": "country", "operator": "not_in", "values": ["US", "CA"]}"#,
        )
        .unwrap();
        assert_eq!(c, list_condition("country", Operator::NotIn, vec!["US", "CA"]));

        let c: Condition =
            serde_json::from_str(r#"{"attribute": "app", "operator": "semver_gte", "value": "2.1"}"#)
                .unwrap();
        assert_eq!(c.operator, Operator::SemverGte);
        assert_eq!(Operator::SemverGte.to_string(), "semver_gte");

        let logic: Logic = serde_json::from_str(r#""or""#).unwrap();
        assert_eq!(logic, Logic::Or);
    }
}
