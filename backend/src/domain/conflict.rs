//! # Conflict Checker
//!
//! Overlap rules for half-open intervals `[start, end)`. Two intervals
//! conflict iff `existing.start < candidate.end && existing.end > candidate.start`,
//! so back-to-back lessons (one ending at 10:00, the next starting at 10:00)
//! never collide.

use chrono::{DateTime, Utc};

use crate::db::ScheduleEntry;
use crate::errors::CoreError;

/// Half-open overlap test.
pub fn overlaps(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> bool {
    a_start < b_end && a_end > b_start
}

/// Reject an interval whose end is not after its start.
pub fn validate_window(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), CoreError> {
    if end <= start {
        return Err(CoreError::Validation(format!(
            "end {} must be after start {}",
            end.to_rfc3339(),
            start.to_rfc3339()
        )));
    }
    Ok(())
}

/// First live entry of `tutor_id` colliding with the candidate, skipping
/// `ignore_entry_id` (the entry being moved, for reschedules).
pub fn find_conflict<'a>(
    entries: &'a [ScheduleEntry],
    tutor_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    ignore_entry_id: Option<&str>,
) -> Option<&'a ScheduleEntry> {
    entries.iter().find(|entry| {
        entry.tutor_id == tutor_id
            && !entry.is_deleted
            && Some(entry.id.as_str()) != ignore_entry_id
            && overlaps(entry.start, entry.end, start, end)
    })
}

/// Build the conflict error for a candidate colliding with `existing`.
pub fn conflict_error(start: DateTime<Utc>, end: DateTime<Utc>, existing: &ScheduleEntry) -> CoreError {
    CoreError::ScheduleConflict {
        candidate_start: start,
        candidate_end: end,
        existing_entry_id: existing.id.clone(),
        existing_start: existing.start,
        existing_end: existing.end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::EntryKind;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 6, h, 0, 0).unwrap()
    }

    fn entry(id: &str, tutor: &str, start: u32, end: u32) -> ScheduleEntry {
        ScheduleEntry {
            id: id.into(),
            tutor_id: tutor.into(),
            start: at(start),
            end: at(end),
            kind: EntryKind::Lesson { lesson_id: format!("lesson-{}", id) },
            is_deleted: false,
            created_at: at(0),
            updated_at: at(0),
        }
    }

    #[test]
    fn test_half_open_boundaries() {
        assert!(overlaps(at(8), at(10), at(9), at(11)));
        assert!(!overlaps(at(8), at(10), at(10), at(11)));
        assert!(!overlaps(at(8), at(10), at(6), at(8)));
        assert!(overlaps(at(8), at(12), at(9), at(10)));
    }

    #[test]
    fn test_find_conflict_scopes_to_tutor_and_skips_ignored() {
        let entries = vec![entry("e1", "t1", 8, 10), entry("e2", "t2", 9, 11)];

        let hit = find_conflict(&entries, "t1", at(9), at(11), None).unwrap();
        assert_eq!(hit.id, "e1");

        assert!(find_conflict(&entries, "t1", at(9), at(11), Some("e1")).is_none());
        assert!(find_conflict(&entries, "t3", at(9), at(11), None).is_none());
    }

    #[test]
    fn test_deleted_entries_never_conflict() {
        let mut e = entry("e1", "t1", 8, 10);
        e.is_deleted = true;
        assert!(find_conflict(&[e], "t1", at(8), at(10), None).is_none());
    }

    #[test]
    fn test_validate_window() {
        assert!(validate_window(at(8), at(9)).is_ok());
        assert!(validate_window(at(9), at(9)).is_err());
    }
}
