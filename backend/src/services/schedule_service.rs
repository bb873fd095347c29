//! # Schedule Service
//!
//! Owns a tutor's calendar: the conflict check, lesson generation,
//! availability blocks and their materialization into busy entries.
//!
//! Every write to a tutor's calendar runs with the `tutor:<id>` lock held,
//! so the conflict check and the insert that follows it cannot interleave
//! with another writer for the same tutor.
//!
//! ## Generation
//!
//! ```text
//! rules + start date ──expand──> occurrences
//!                                    │  for each, in order
//!                                    ▼
//!                      conflict with a live entry? ──yes──> ScheduleConflict,
//!                                    │                       nothing written
//!                                    no
//!                                    ▼
//!                      ScheduleEntry(Lesson) + Lesson
//! ```

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use serde::Serialize;
use tracing::{debug, info};

use crate::db::{
    new_id, AvailabilityBlock, AvailabilityKind, Class, EntryKind, Lesson, LessonStatus, LockKey,
    ScheduleEntry, Store, StoreTx,
};
use crate::domain::conflict::{conflict_error, find_conflict, validate_window};
use crate::domain::expander::{expand, validate_rules, HorizonPolicy, Occurrence};
use crate::errors::CoreError;

use super::identity::Actor;

/// One generated lesson and its calendar entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedLesson {
    pub lesson_id: String,
    pub schedule_entry_id: String,
    pub sequence: i32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ScheduleService {
    store: Arc<dyn Store>,
    horizon: HorizonPolicy,
}

impl ScheduleService {
    pub fn new(store: Arc<dyn Store>, horizon: HorizonPolicy) -> Self {
        Self { store, horizon }
    }

    pub fn horizon(&self) -> HorizonPolicy {
        self.horizon
    }

    /// The first live entry of the tutor overlapping `[start, end)`, if any.
    pub async fn check_conflict(
        &self,
        tutor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        ignore_entry_id: Option<&str>,
    ) -> Result<Option<ScheduleEntry>, CoreError> {
        validate_window(start, end)?;
        let mut tx = self.store.begin(vec![]).await?;
        check_conflict_in(tx.as_mut(), tutor_id, start, end, ignore_entry_id).await
    }

    /// Live entries of a tutor overlapping `[from, to)`.
    pub async fn tutor_schedule(
        &self,
        tutor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ScheduleEntry>, CoreError> {
        validate_window(from, to)?;
        debug!("Fetching schedule of {} from {} to {}", tutor_id, from, to);
        let mut tx = self.store.begin(vec![]).await?;
        Ok(tx.entries_for_tutor(tutor_id, from, to).await?)
    }

    /// Expand the class rules and write one Lesson and one ScheduleEntry per
    /// occurrence. The caller holds the tutor lock and owns the unit of work;
    /// on a conflict nothing from this batch is written.
    pub async fn generate_lessons(
        &self,
        tx: &mut dyn StoreTx,
        class: &Class,
        now: DateTime<Utc>,
    ) -> Result<Vec<GeneratedLesson>, CoreError> {
        let occurrences = expand(&class.rules, class.start_date, self.horizon)?;
        ensure_free(tx, &class.tutor_id, &occurrences).await?;

        let mut generated = Vec::with_capacity(occurrences.len());
        for (index, occurrence) in occurrences.iter().enumerate() {
            let entry_id = new_id();
            let lesson_id = new_id();
            let sequence = index as i32 + 1;

            tx.upsert_schedule_entry(&ScheduleEntry {
                id: entry_id.clone(),
                tutor_id: class.tutor_id.clone(),
                start: occurrence.start,
                end: occurrence.end,
                kind: EntryKind::Lesson { lesson_id: lesson_id.clone() },
                is_deleted: false,
                created_at: now,
                updated_at: now,
            })
            .await?;
            tx.upsert_lesson(&Lesson {
                id: lesson_id.clone(),
                class_id: class.id.clone(),
                schedule_entry_id: entry_id.clone(),
                sequence,
                status: LessonStatus::Scheduled,
                created_at: now,
                updated_at: now,
            })
            .await?;

            generated.push(GeneratedLesson {
                lesson_id,
                schedule_entry_id: entry_id,
                sequence,
                start: occurrence.start,
                end: occurrence.end,
            });
        }

        info!("Generated {} lessons for class {}", generated.len(), class.id);
        Ok(generated)
    }

    // ==========================================
    // AVAILABILITY
    // ==========================================

    pub async fn add_block(
        &self,
        actor: &Actor,
        day_of_week: Weekday,
        start_time: NaiveTime,
        end_time: NaiveTime,
        kind: AvailabilityKind,
        now: DateTime<Utc>,
    ) -> Result<AvailabilityBlock, CoreError> {
        if end_time <= start_time {
            return Err(CoreError::Validation(format!(
                "end time {} must be after start time {}",
                end_time, start_time
            )));
        }

        let block = AvailabilityBlock {
            id: new_id(),
            tutor_id: actor.user_id.clone(),
            day_of_week,
            start_time,
            end_time,
            kind,
            created_at: now,
        };

        let mut tx = self.store.begin(vec![LockKey::Tutor(actor.user_id.clone())]).await?;
        tx.insert_availability_block(&block).await?;
        tx.commit().await?;

        info!("Tutor {} added {} block {} on {}", block.tutor_id, kind, block.id, day_of_week);
        Ok(block)
    }

    pub async fn list_blocks(&self, tutor_id: &str) -> Result<Vec<AvailabilityBlock>, CoreError> {
        let mut tx = self.store.begin(vec![]).await?;
        Ok(tx.availability_blocks(tutor_id).await?)
    }

    /// Delete a block together with its future calendar entries.
    pub async fn remove_block(&self, actor: &Actor, block_id: &str, now: DateTime<Utc>) -> Result<usize, CoreError> {
        let tutor_id = self.block_owner(block_id).await?;
        actor.require_owner(&tutor_id, "the availability block")?;

        let mut tx = self.store.begin(vec![LockKey::Tutor(tutor_id)]).await?;
        let released = release_entries(tx.as_mut(), block_id, now).await?;
        tx.delete_availability_block(block_id).await?;
        tx.commit().await?;

        info!("Removed block {} ({} future entries released)", block_id, released);
        Ok(released)
    }

    /// Materialize a Busy block into calendar entries, all or nothing.
    pub async fn commit_busy_block(
        &self,
        actor: &Actor,
        block_id: &str,
        start_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleEntry>, CoreError> {
        info!("Committing block {} from {}", block_id, start_date);

        let tutor_id = self.block_owner(block_id).await?;
        actor.require_owner(&tutor_id, "the availability block")?;

        let mut tx = self.store.begin(vec![LockKey::Tutor(tutor_id)]).await?;
        let block = load_block(tx.as_mut(), block_id).await?;
        if block.kind != AvailabilityKind::Busy {
            return Err(CoreError::Validation(format!("block {} is not a busy block", block_id)));
        }

        let rules = [block.as_rule()];
        validate_rules(&rules)?;
        let occurrences = expand(&rules, start_date, self.horizon)?;
        ensure_free(tx.as_mut(), &block.tutor_id, &occurrences).await?;

        let mut entries = Vec::with_capacity(occurrences.len());
        for occurrence in &occurrences {
            let entry = ScheduleEntry {
                id: new_id(),
                tutor_id: block.tutor_id.clone(),
                start: occurrence.start,
                end: occurrence.end,
                kind: EntryKind::Block { block_id: block.id.clone() },
                is_deleted: false,
                created_at: now,
                updated_at: now,
            };
            tx.upsert_schedule_entry(&entry).await?;
            entries.push(entry);
        }
        tx.commit().await?;

        info!("Block {} committed as {} entries", block_id, entries.len());
        Ok(entries)
    }

    /// Soft-delete the block's entries that have not started yet.
    pub async fn release_block(&self, actor: &Actor, block_id: &str, now: DateTime<Utc>) -> Result<usize, CoreError> {
        let tutor_id = self.block_owner(block_id).await?;
        actor.require_owner(&tutor_id, "the availability block")?;

        let mut tx = self.store.begin(vec![LockKey::Tutor(tutor_id)]).await?;
        let released = release_entries(tx.as_mut(), block_id, now).await?;
        tx.commit().await?;

        info!("Released {} entries of block {}", released, block_id);
        Ok(released)
    }

    async fn block_owner(&self, block_id: &str) -> Result<String, CoreError> {
        let mut tx = self.store.begin(vec![]).await?;
        Ok(load_block(tx.as_mut(), block_id).await?.tutor_id)
    }
}

pub(crate) async fn check_conflict_in(
    tx: &mut dyn StoreTx,
    tutor_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    ignore_entry_id: Option<&str>,
) -> Result<Option<ScheduleEntry>, CoreError> {
    let entries = tx.entries_for_tutor(tutor_id, start, end).await?;
    Ok(find_conflict(&entries, tutor_id, start, end, ignore_entry_id).cloned())
}

/// Fail with the first occurrence that collides with a live entry.
async fn ensure_free(tx: &mut dyn StoreTx, tutor_id: &str, occurrences: &[Occurrence]) -> Result<(), CoreError> {
    let (Some(first), Some(last)) = (occurrences.first(), occurrences.last()) else {
        return Ok(());
    };
    let window_end = occurrences.iter().map(|o| o.end).max().unwrap_or(last.end);
    let existing = tx.entries_for_tutor(tutor_id, first.start, window_end).await?;

    for occurrence in occurrences {
        if let Some(hit) = find_conflict(&existing, tutor_id, occurrence.start, occurrence.end, None) {
            return Err(conflict_error(occurrence.start, occurrence.end, hit));
        }
    }
    Ok(())
}

async fn load_block(tx: &mut dyn StoreTx, block_id: &str) -> Result<AvailabilityBlock, CoreError> {
    tx.availability_block(block_id)
        .await?
        .ok_or_else(|| CoreError::not_found("AvailabilityBlock", block_id))
}

async fn release_entries(tx: &mut dyn StoreTx, block_id: &str, now: DateTime<Utc>) -> Result<usize, CoreError> {
    let mut released = 0;
    for mut entry in tx.entries_for_block(block_id).await? {
        if entry.start < now {
            continue;
        }
        entry.is_deleted = true;
        entry.updated_at = now;
        tx.upsert_schedule_entry(&entry).await?;
        released += 1;
    }
    Ok(released)
}
