//! # Recurring Rule Expander
//!
//! Turns weekly rules (weekday + time of day) into concrete occurrences.
//! Expansion is a pure function of the rules, the start date and the
//! horizon: it never reads the clock.
//!
//! ```text
//! rules: [Mon 08:00-10:00, Thu 14:00-15:30]   start: Wed 2025-01-01
//!
//!   Thu 01-02 14:00  Mon 01-06 08:00  Thu 01-09 14:00  Mon 01-13 08:00 ...
//!   └─ first Thu on/after start        └─ every 7 days, up to N per rule
//! ```

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::db::RecurringRule;
use crate::errors::CoreError;

/// How far ahead rules are expanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HorizonPolicy {
    /// Maximum occurrences generated per rule.
    pub occurrences_per_rule: u32,
    /// Occurrences must fall on a date before `start_date + horizon_days`.
    pub horizon_days: u32,
}

impl Default for HorizonPolicy {
    fn default() -> Self {
        Self {
            occurrences_per_rule: 4,
            horizon_days: 50,
        }
    }
}

/// One concrete occurrence of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Occurrence {
    /// Index of the rule that produced it.
    pub rule_index: usize,
    pub date: NaiveDate,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Reject malformed rules before anything is generated: empty windows and
/// two rules overlapping on the same weekday.
pub fn validate_rules(rules: &[RecurringRule]) -> Result<(), CoreError> {
    if rules.is_empty() {
        return Err(CoreError::Validation("at least one schedule rule is required".into()));
    }

    for (i, rule) in rules.iter().enumerate() {
        if rule.end_time <= rule.start_time {
            return Err(CoreError::Validation(format!(
                "rule {} on {}: end time {} must be after start time {}",
                i, rule.day_of_week, rule.end_time, rule.start_time
            )));
        }
    }

    for (i, a) in rules.iter().enumerate() {
        for (j, b) in rules.iter().enumerate().skip(i + 1) {
            if a.day_of_week == b.day_of_week
                && a.start_time < b.end_time
                && a.end_time > b.start_time
            {
                return Err(CoreError::Validation(format!(
                    "rules {} and {} overlap on {}",
                    i, j, a.day_of_week
                )));
            }
        }
    }

    Ok(())
}

/// Expand `rules` from `start_date` under `policy`.
///
/// Occurrences are ordered by start time, ties broken by rule order.
pub fn expand(
    rules: &[RecurringRule],
    start_date: NaiveDate,
    policy: HorizonPolicy,
) -> Result<Vec<Occurrence>, CoreError> {
    validate_rules(rules)?;
    if policy.occurrences_per_rule == 0 || policy.horizon_days == 0 {
        return Err(CoreError::Validation("horizon must allow at least one occurrence".into()));
    }

    let horizon_end = start_date + Duration::days(i64::from(policy.horizon_days));
    let mut occurrences = Vec::new();

    for (rule_index, rule) in rules.iter().enumerate() {
        let offset = (7 + rule.day_of_week.num_days_from_monday()
            - start_date.weekday().num_days_from_monday())
            % 7;
        let mut date = start_date + Duration::days(i64::from(offset));
        let mut generated = 0;

        while generated < policy.occurrences_per_rule && date < horizon_end {
            occurrences.push(Occurrence {
                rule_index,
                date,
                start: Utc.from_utc_datetime(&date.and_time(rule.start_time)),
                end: Utc.from_utc_datetime(&date.and_time(rule.end_time)),
            });
            generated += 1;
            date += Duration::days(7);
        }
    }

    occurrences.sort_by_key(|o| (o.start, o.rule_index));
    Ok(occurrences)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, Weekday};

    fn rule(day: Weekday, start: (u32, u32), end: (u32, u32)) -> RecurringRule {
        RecurringRule {
            day_of_week: day,
            start_time: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_default_policy_gives_four_per_rule() {
        // 2025-01-06 is a Monday.
        let rules = [rule(Weekday::Mon, (8, 0), (10, 0)), rule(Weekday::Wed, (18, 0), (19, 30))];
        let occurrences = expand(&rules, date(2025, 1, 6), HorizonPolicy::default()).unwrap();

        assert_eq!(occurrences.len(), 8);
        assert_eq!(occurrences[0].date, date(2025, 1, 6));
        assert_eq!(occurrences[1].date, date(2025, 1, 8));
        assert_eq!(occurrences.last().unwrap().date, date(2025, 1, 29));
        assert!(occurrences.windows(2).all(|w| w[0].start <= w[1].start));
    }

    #[test]
    fn test_weekday_before_start_rolls_to_next_week() {
        // Start on a Wednesday; the Monday rule starts the following Monday.
        let rules = [rule(Weekday::Mon, (8, 0), (10, 0))];
        let occurrences = expand(&rules, date(2025, 1, 8), HorizonPolicy::default()).unwrap();
        assert_eq!(occurrences[0].date, date(2025, 1, 13));
        assert_eq!(occurrences[0].start.to_rfc3339(), "2025-01-13T08:00:00+00:00");
    }

    #[test]
    fn test_horizon_caps_occurrences() {
        let rules = [rule(Weekday::Fri, (9, 0), (10, 0))];
        let policy = HorizonPolicy {
            occurrences_per_rule: 10,
            horizon_days: 15,
        };
        // 2025-01-03 is a Friday: 01-03, 01-10, 01-17 fall inside 15 days.
        let occurrences = expand(&rules, date(2025, 1, 3), policy).unwrap();
        assert_eq!(occurrences.len(), 3);
    }

    #[test]
    fn test_expansion_is_deterministic() {
        let rules = [rule(Weekday::Tue, (7, 0), (8, 0)), rule(Weekday::Sat, (10, 0), (12, 0))];
        let a = expand(&rules, date(2025, 3, 1), HorizonPolicy::default()).unwrap();
        let b = expand(&rules, date(2025, 3, 1), HorizonPolicy::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_end_not_after_start_is_rejected() {
        let rules = [rule(Weekday::Mon, (10, 0), (10, 0))];
        let err = expand(&rules, date(2025, 1, 6), HorizonPolicy::default()).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        let rules = [rule(Weekday::Mon, (11, 0), (9, 0))];
        assert!(expand(&rules, date(2025, 1, 6), HorizonPolicy::default()).is_err());
    }

    #[test]
    fn test_overlapping_rules_are_rejected() {
        let rules = [rule(Weekday::Mon, (8, 0), (10, 0)), rule(Weekday::Mon, (9, 0), (11, 0))];
        assert!(matches!(validate_rules(&rules), Err(CoreError::Validation(_))));

        let touching = [rule(Weekday::Mon, (8, 0), (10, 0)), rule(Weekday::Mon, (10, 0), (11, 0))];
        assert!(validate_rules(&touching).is_ok());
    }
}
