//! # Reschedule Negotiation
//!
//! Either party of a lesson may propose a new window; the other side
//! accepts or rejects. One Pending request per lesson at a time.
//!
//! ```text
//! propose ──> Pending ──accept──> Accepted   (entry moved to the new window)
//!                └──────reject──> Rejected   (calendar untouched)
//! ```
//!
//! Proposal and acceptance both run the conflict check with the lesson's
//! own entry ignored, under the tutor lock. The check on accept catches
//! anything committed to the calendar since the proposal.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::db::{
    new_id, ClassStatus, DatabaseError, Lesson, LessonStatus, LockKey, RescheduleRequest,
    RescheduleStatus, ScheduleEntry, Store, StoreTx,
};
use crate::domain::conflict::{conflict_error, validate_window};
use crate::errors::CoreError;

use super::escrow_manager::load_class;
use super::identity::Actor;
use super::notifications::{CoreEvent, NotificationSink};
use super::schedule_service::check_conflict_in;

#[derive(Clone)]
pub struct RescheduleService {
    store: Arc<dyn Store>,
    notifier: Arc<dyn NotificationSink>,
}

impl RescheduleService {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self { store, notifier }
    }

    pub async fn propose(
        &self,
        actor: &Actor,
        lesson_id: &str,
        new_start: DateTime<Utc>,
        new_end: DateTime<Utc>,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<RescheduleRequest, CoreError> {
        info!("{} proposes moving lesson {} to {}..{}", actor.user_id, lesson_id, new_start, new_end);
        validate_window(new_start, new_end)?;
        if new_start <= now {
            return Err(CoreError::Validation(format!("new start {} is not in the future", new_start)));
        }

        let tutor_id = self.lesson_tutor(lesson_id).await?;
        let mut tx = self
            .store
            .begin(vec![LockKey::Lesson(lesson_id.to_string()), LockKey::Tutor(tutor_id.clone())])
            .await?;

        let lesson = load_lesson(tx.as_mut(), lesson_id).await?;
        let class = load_class(tx.as_mut(), &lesson.class_id).await?;
        if !matches!(class.status, ClassStatus::Active | ClassStatus::Ongoing) {
            return Err(CoreError::invalid_transition("Class", &class.id, class.status, "reschedule a lesson of"));
        }
        ensure_lesson_movable(&lesson)?;
        let entry = load_entry(tx.as_mut(), &lesson).await?;
        if entry.start <= now {
            return Err(CoreError::invalid_transition("Lesson", &lesson.id, "started", "reschedule"));
        }

        if let Some(pending) = tx.pending_reschedule_for_lesson(lesson_id).await? {
            return Err(CoreError::RescheduleConflict {
                lesson_id: lesson_id.to_string(),
                pending_request_id: pending.id,
            });
        }

        let responder_id = if actor.user_id == class.tutor_id {
            tx.assigns_for_class(&class.id)
                .await?
                .into_iter()
                .find(|a| a.counts_toward_roster())
                .map(|a| a.student_id)
                .ok_or_else(|| CoreError::Validation(format!("class {} has no student to respond", class.id)))?
        } else {
            let enrolled = tx
                .class_assign(&class.id, &actor.user_id)
                .await?
                .map_or(false, |a| a.counts_toward_roster());
            if !enrolled {
                return Err(CoreError::Forbidden(format!(
                    "{} is not a participant of lesson {}",
                    actor.user_id, lesson_id
                )));
            }
            class.tutor_id.clone()
        };

        if let Some(hit) = check_conflict_in(tx.as_mut(), &tutor_id, new_start, new_end, Some(&entry.id)).await? {
            return Err(conflict_error(new_start, new_end, &hit));
        }

        let request = RescheduleRequest {
            id: new_id(),
            lesson_id: lesson.id.clone(),
            requester_id: actor.user_id.clone(),
            responder_id,
            old_start: entry.start,
            old_end: entry.end,
            new_start,
            new_end,
            reason,
            status: RescheduleStatus::Pending,
            created_at: now,
            responded_at: None,
        };
        if let Err(e) = tx.upsert_reschedule_request(&request).await {
            // A failed statement poisons the unit; read the winner from a new one.
            drop(tx);
            return Err(match e {
                DatabaseError::UniqueViolation(_) => self.pending_conflict(lesson_id).await,
                other => other.into(),
            });
        }
        tx.commit().await?;

        self.notifier.dispatch(CoreEvent::RescheduleProposed {
            reschedule_id: request.id.clone(),
            lesson_id: request.lesson_id.clone(),
            requester_id: request.requester_id.clone(),
            responder_id: request.responder_id.clone(),
        });
        Ok(request)
    }

    /// Move the lesson to the proposed window.
    pub async fn accept(&self, actor: &Actor, reschedule_id: &str, now: DateTime<Utc>) -> Result<RescheduleRequest, CoreError> {
        info!("Accepting reschedule {}", reschedule_id);
        let (lesson_id, tutor_id) = self.request_scope(actor, reschedule_id).await?;

        let mut tx = self
            .store
            .begin(vec![LockKey::Lesson(lesson_id.clone()), LockKey::Tutor(tutor_id.clone())])
            .await?;
        let mut request = load_request(tx.as_mut(), reschedule_id).await?;
        ensure_pending(&request, "accept")?;
        if request.new_start <= now {
            return Err(CoreError::Validation(format!(
                "proposed start {} has already passed",
                request.new_start
            )));
        }

        let lesson = load_lesson(tx.as_mut(), &lesson_id).await?;
        ensure_lesson_movable(&lesson)?;
        let mut entry = load_entry(tx.as_mut(), &lesson).await?;

        if let Some(hit) =
            check_conflict_in(tx.as_mut(), &tutor_id, request.new_start, request.new_end, Some(&entry.id)).await?
        {
            return Err(conflict_error(request.new_start, request.new_end, &hit));
        }

        entry.start = request.new_start;
        entry.end = request.new_end;
        entry.updated_at = now;
        tx.upsert_schedule_entry(&entry).await?;

        request.status = RescheduleStatus::Accepted;
        request.responded_at = Some(now);
        tx.upsert_reschedule_request(&request).await?;
        tx.commit().await?;

        info!("Lesson {} moved to {}..{}", lesson_id, entry.start, entry.end);
        self.notifier.dispatch(resolved_event(&request));
        Ok(request)
    }

    pub async fn reject(&self, actor: &Actor, reschedule_id: &str, now: DateTime<Utc>) -> Result<RescheduleRequest, CoreError> {
        let (lesson_id, _) = self.request_scope(actor, reschedule_id).await?;

        let mut tx = self.store.begin(vec![LockKey::Lesson(lesson_id)]).await?;
        let mut request = load_request(tx.as_mut(), reschedule_id).await?;
        ensure_pending(&request, "reject")?;
        request.status = RescheduleStatus::Rejected;
        request.responded_at = Some(now);
        tx.upsert_reschedule_request(&request).await?;
        tx.commit().await?;

        debug!("Reschedule {} rejected", reschedule_id);
        self.notifier.dispatch(resolved_event(&request));
        Ok(request)
    }

    pub async fn get(&self, reschedule_id: &str) -> Result<RescheduleRequest, CoreError> {
        let mut tx = self.store.begin(vec![]).await?;
        load_request(tx.as_mut(), reschedule_id).await
    }

    /// Conflict naming the proposal that won a concurrent insert.
    async fn pending_conflict(&self, lesson_id: &str) -> CoreError {
        let pending = match self.store.begin(vec![]).await {
            Ok(mut tx) => tx.pending_reschedule_for_lesson(lesson_id).await,
            Err(e) => Err(e),
        };
        match pending {
            Ok(Some(pending)) => CoreError::RescheduleConflict {
                lesson_id: lesson_id.to_string(),
                pending_request_id: pending.id,
            },
            Ok(None) => CoreError::Validation(format!(
                "a concurrent reschedule of lesson {} was already answered, propose again",
                lesson_id
            )),
            Err(e) => e.into(),
        }
    }

    async fn lesson_tutor(&self, lesson_id: &str) -> Result<String, CoreError> {
        let mut tx = self.store.begin(vec![]).await?;
        let lesson = load_lesson(tx.as_mut(), lesson_id).await?;
        Ok(load_class(tx.as_mut(), &lesson.class_id).await?.tutor_id)
    }

    /// Check the actor answers the request and return (lesson id, tutor id).
    async fn request_scope(&self, actor: &Actor, reschedule_id: &str) -> Result<(String, String), CoreError> {
        let mut tx = self.store.begin(vec![]).await?;
        let request = load_request(tx.as_mut(), reschedule_id).await?;
        actor.require_owner(&request.responder_id, "the reschedule request")?;
        let lesson = load_lesson(tx.as_mut(), &request.lesson_id).await?;
        let tutor_id = load_class(tx.as_mut(), &lesson.class_id).await?.tutor_id;
        Ok((lesson.id, tutor_id))
    }
}

fn ensure_pending(request: &RescheduleRequest, action: &'static str) -> Result<(), CoreError> {
    if request.status != RescheduleStatus::Pending {
        return Err(CoreError::invalid_transition("RescheduleRequest", &request.id, request.status, action));
    }
    Ok(())
}

fn ensure_lesson_movable(lesson: &Lesson) -> Result<(), CoreError> {
    if lesson.status != LessonStatus::Scheduled {
        return Err(CoreError::invalid_transition("Lesson", &lesson.id, lesson.status, "reschedule"));
    }
    Ok(())
}

fn resolved_event(request: &RescheduleRequest) -> CoreEvent {
    CoreEvent::RescheduleResolved {
        reschedule_id: request.id.clone(),
        lesson_id: request.lesson_id.clone(),
        requester_id: request.requester_id.clone(),
        responder_id: request.responder_id.clone(),
        status: request.status,
    }
}

async fn load_lesson(tx: &mut dyn StoreTx, lesson_id: &str) -> Result<Lesson, CoreError> {
    tx.lesson(lesson_id).await?.ok_or_else(|| CoreError::not_found("Lesson", lesson_id))
}

async fn load_entry(tx: &mut dyn StoreTx, lesson: &Lesson) -> Result<ScheduleEntry, CoreError> {
    tx.schedule_entry(&lesson.schedule_entry_id)
        .await?
        .ok_or_else(|| CoreError::not_found("ScheduleEntry", &lesson.schedule_entry_id))
}

async fn load_request(tx: &mut dyn StoreTx, reschedule_id: &str) -> Result<RescheduleRequest, CoreError> {
    tx.reschedule_request(reschedule_id)
        .await?
        .ok_or_else(|| CoreError::not_found("RescheduleRequest", reschedule_id))
}
