use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Timelike, Utc};
use thiserror::Error;

/// A cron expression could not be parsed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CronError {
    #[error("cron expression needs 5 fields, found {0}")]
    FieldCount(usize),

    #[error("invalid {field} field '{value}'")]
    Malformed { field: &'static str, value: String },

    #[error("{field} value {value} is outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("{field} step must be positive")]
    ZeroStep { field: &'static str },
}

struct FieldDef {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const MINUTE: FieldDef = FieldDef {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
};
const HOUR: FieldDef = FieldDef {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
};
const DAY_OF_MONTH: FieldDef = FieldDef {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
};
const MONTH: FieldDef = FieldDef {
    name: "month",
    min: 1,
    max: 12,
    names: &[
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ],
};
// 7 is accepted as an alias for Sunday and folded onto 0 after parsing.
const DAY_OF_WEEK: FieldDef = FieldDef {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &["sun", "mon", "tue", "wed", "thu", "fri", "sat"],
};

/// A parsed five-field cron expression: `minute hour day-of-month month day-of-week`.
///
/// Days of the week are numbered from Sunday = 0 to Saturday = 6 (7 also means Sunday). Unlike
/// classic cron, a restricted day-of-month and a restricted day-of-week must both match.
#[derive(Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
}

impl CronExpression {
    /// True when `time` (to the minute) is selected by every field.
    pub fn matches(&self, time: &DateTime<Utc>) -> bool {
        bit_set(self.minutes, time.minute())
            && bit_set(self.hours, time.hour())
            && bit_set(self.days_of_month, time.day())
            && bit_set(self.months, time.month())
            && bit_set(self.days_of_week, time.weekday().num_days_from_sunday())
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl FromStr for CronExpression {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        let mut days_of_week = parse_field(fields[4], &DAY_OF_WEEK)?;
        if bit_set(days_of_week, 7) {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(CronExpression {
            source: fields.join(" "),
            minutes: parse_field(fields[0], &MINUTE)?,
            hours: parse_field(fields[1], &HOUR)?,
            days_of_month: parse_field(fields[2], &DAY_OF_MONTH)?,
            months: parse_field(fields[3], &MONTH)?,
            days_of_week,
        })
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl fmt::Debug for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CronExpression({:?})", self.source)
    }
}

fn bit_set(bits: u64, value: u32) -> bool {
    value < 64 && bits & (1 << value) != 0
}

fn parse_field(field: &str, def: &FieldDef) -> Result<u64, CronError> {
    let malformed = || CronError::Malformed {
        field: def.name,
        value: field.to_owned(),
    };

    let mut bits = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| malformed())?;
                if step == 0 {
                    return Err(CronError::ZeroStep { field: def.name });
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = match range {
            "*" => (def.min, def.max),
            _ => match range.split_once('-') {
                Some((a, b)) => (parse_value(a, def)?, parse_value(b, def)?),
                // `a/n` runs from a to the end of the field
                None if step > 1 => (parse_value(range, def)?, def.max),
                None => {
                    let v = parse_value(range, def)?;
                    (v, v)
                }
            },
        };
        if start > end {
            return Err(malformed());
        }

        for value in (start..=end).step_by(step as usize) {
            bits |= 1 << value;
        }
    }
    Ok(bits)
}

fn parse_value(token: &str, def: &FieldDef) -> Result<u32, CronError> {
    let lowered = token.to_ascii_lowercase();
    let value = match def.names.iter().position(|name| *name == lowered) {
        Some(index) => index as u32 + def.min,
        None => token.parse::<u32>().map_err(|_| CronError::Malformed {
            field: def.name,
            value: token.to_owned(),
        })?,
    };
    if value < def.min || value > def.max {
        return Err(CronError::OutOfRange {
            field: def.name,
            value,
            min: def.min,
            max: def.max,
        });
    }
    Ok(value)
}
