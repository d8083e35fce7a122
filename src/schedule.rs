use std::cmp::Reverse;
use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::cron::CronExpression;
use crate::error::ConfigurationError;
use crate::util::default_true;

/// Half-width of the acceptance window of a one-time schedule.
pub const ONE_TIME_WINDOW_SECONDS: i64 = 60;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// Active for one minute either side of `startAt`.
    OneTime,
    /// Active from `startAt` to `endAt` inclusive; a missing bound is open.
    DateRange,
    /// Active whenever the cron expression matches, within the optional bounds.
    Recurring,
}

/// A time window during which a feature is forced into a given state.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    pub feature_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ruleset_id: Option<String>,
    #[serde(rename = "type")]
    pub schedule_type: ScheduleType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    pub enabled_during_schedule: bool,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Schedule {
    /// A schedule scoped to a client or ruleset only applies to that one; an unscoped schedule
    /// applies to everybody.
    pub fn applies_to(&self, client_id: Option<&str>, ruleset_id: Option<&str>) -> bool {
        let client_ok = match &self.client_id {
            Some(scope) => client_id == Some(scope.as_str()),
            None => true,
        };
        let ruleset_ok = match &self.ruleset_id {
            Some(scope) => ruleset_id == Some(scope.as_str()),
            None => true,
        };
        client_ok && ruleset_ok
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |message: &str| ConfigurationError::invalid("schedule", &self.id, message);
        match self.schedule_type {
            ScheduleType::OneTime if self.start_at.is_none() => {
                return Err(invalid("one_time schedules need startAt"))
            }
            ScheduleType::DateRange if self.start_at.is_none() && self.end_at.is_none() => {
                return Err(invalid("date_range schedules need startAt or endAt"))
            }
            ScheduleType::Recurring => match &self.cron_expression {
                None => return Err(invalid("recurring schedules need cronExpression")),
                Some(expr) => {
                    expr.parse::<CronExpression>()
                        .map_err(|e| ConfigurationError::invalid("schedule", &self.id, e))?;
                }
            },
            _ => (),
        }
        match (self.start_at, self.end_at) {
            (Some(start), Some(end)) if start > end => Err(invalid("startAt is after endAt")),
            _ => Ok(()),
        }
    }

    fn within_bounds(&self, now: &DateTime<Utc>) -> bool {
        self.start_at.map_or(true, |start| start <= *now)
            && self.end_at.map_or(true, |end| *now <= end)
    }
}

#[derive(Clone, Debug)]
struct CompiledSchedule {
    schedule: Schedule,
    cron: Option<CronExpression>,
}

impl CompiledSchedule {
    fn new(schedule: Schedule) -> Self {
        let cron = match (&schedule.schedule_type, &schedule.cron_expression) {
            (ScheduleType::Recurring, Some(expr)) => match expr.parse() {
                Ok(cron) => Some(cron),
                Err(e) => {
                    warn!("schedule {} has an unusable cron expression: {}", schedule.id, e);
                    None
                }
            },
            _ => None,
        };
        Self { schedule, cron }
    }

    fn is_active_at(&self, now: &DateTime<Utc>) -> bool {
        let schedule = &self.schedule;
        if !schedule.active {
            return false;
        }
        match schedule.schedule_type {
            ScheduleType::OneTime => schedule.start_at.map_or(false, |start| {
                (*now - start).num_milliseconds().abs() <= ONE_TIME_WINDOW_SECONDS * 1000
            }),
            ScheduleType::DateRange => schedule.within_bounds(now),
            ScheduleType::Recurring => match &self.cron {
                Some(cron) => schedule.within_bounds(now) && cron.matches(now),
                None => false,
            },
        }
    }
}

/// Holds the schedules of every feature, ordered by descending priority.
#[derive(Clone, Debug, Default)]
pub struct ScheduleEngine {
    schedules: HashMap<String, Vec<CompiledSchedule>>,
}

impl ScheduleEngine {
    /// Groups `schedules` by feature and parses their cron expressions once. Schedules with equal
    /// priority keep their relative order.
    pub fn new(schedules: Vec<Schedule>) -> Self {
        let schedules = schedules
            .into_iter()
            .sorted_by_key(|s| Reverse(s.priority))
            .map(CompiledSchedule::new)
            .into_group_map_by(|c| c.schedule.feature_name.clone());
        Self { schedules }
    }

    /// The first schedule, by descending priority, that applies to the given scope and whose
    /// window contains `now`. None means schedules do not decide this evaluation.
    pub fn evaluate(
        &self,
        feature_name: &str,
        client_id: Option<&str>,
        ruleset_id: Option<&str>,
        now: &DateTime<Utc>,
    ) -> Option<&Schedule> {
        self.schedules
            .get(feature_name)?
            .iter()
            .filter(|c| c.schedule.applies_to(client_id, ruleset_id))
            .find(|c| c.is_active_at(now))
            .map(|c| &c.schedule)
    }

    /// Every schedule for `feature_name`, by descending priority.
    pub fn schedules_for(&self, feature_name: &str) -> Vec<&Schedule> {
        self.schedules
            .get(feature_name)
            .into_iter()
            .flatten()
            .map(|c| &c.schedule)
            .collect()
    }

    pub fn schedules(&self) -> impl Iterator<Item = &Schedule> {
        self.schedules.values().flatten().map(|c| &c.schedule)
    }

    /// Active schedules starting within the next `hours` hours, earliest first.
    pub fn upcoming_schedules(&self, now: &DateTime<Utc>, hours: i64) -> Vec<&Schedule> {
        let horizon = *now + Duration::hours(hours);
        self.schedules()
            .filter(|s| s.active)
            .filter(|s| matches!(s.start_at, Some(start) if *now <= start && start <= horizon))
            .sorted_by_key(|s| (s.start_at, s.id.clone()))
            .collect()
    }
}
