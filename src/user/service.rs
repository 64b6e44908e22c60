//! User manager orchestrating the study pipeline.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Result, ServerError};
use crate::study::{engine, schedule::apply_session_to_schedule};
use crate::user::{AchievementKind, StudySchedule, StudySession, User, UserRepository};

/// Attempts before a concurrent-update conflict is surfaced to the caller.
const MAX_RETRIES: usize = 3;

/// Everything the stop-session endpoint needs to shape its response.
#[derive(Debug)]
pub struct SessionOutcome {
    pub user: User,
    pub session: StudySession,
    pub new_achievements: Vec<AchievementKind>,
    pub schedule: Option<StudySchedule>,
}

/// User manager.
#[derive(Clone)]
pub struct UserService {
    pub repo: UserRepository,
}

impl UserService {
    /// Create a new [`UserService`].
    pub fn new(pool: PgPool) -> Self {
        Self {
            repo: UserRepository::new(pool),
        }
    }

    /// Persist a completed session: ledger append, counters, streak,
    /// achievements and optional schedule progress, as one transaction.
    ///
    /// The load-compute-store cycle is guarded by the user's `version`
    /// column; on a concurrent update the whole cycle retries from a fresh
    /// read.
    pub async fn record_session(
        &self,
        user_id: Uuid,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        subject: String,
        notes: String,
        schedule_id: Option<Uuid>,
    ) -> Result<SessionOutcome> {
        let now = Utc::now();
        let duration = (end_time - start_time).num_milliseconds();

        for attempt in 0..MAX_RETRIES {
            let mut user = self.repo.find_by_id(user_id).await?;
            let expected_version = user.version;

            let ctx = engine::EngineContext {
                total_sessions: self.repo.count_sessions(user_id).await?,
                recent_sessions: self
                    .repo
                    .sessions_since(user_id, now - chrono::Duration::days(7))
                    .await?,
                unlocked: self.repo.achievement_kinds(user_id).await?,
            };

            let session = StudySession {
                id: Uuid::new_v4(),
                user_id,
                start_time,
                end_time,
                duration,
                subject: subject.clone(),
                notes: notes.clone(),
                created_at: now,
            };

            let new_achievements = engine::record_session(&mut user, &ctx, &session, now)?;

            let mut schedule = match schedule_id {
                Some(schedule_id) => Some(
                    self.repo
                        .find_schedule(user_id, schedule_id)
                        .await?
                        .ok_or(ServerError::NotFound("schedule"))?,
                ),
                None => None,
            };

            let mut tx = self.repo.pool().begin().await?;

            if !self
                .repo
                .update_study_state_tx(&mut tx, &user, expected_version)
                .await?
            {
                tx.rollback().await?;
                tracing::debug!(%user_id, attempt, "version conflict, retrying");
                continue;
            }

            self.repo.insert_session_tx(&mut tx, &session).await?;
            self.repo
                .insert_achievements_tx(&mut tx, user_id, &new_achievements, now)
                .await?;

            if let Some(schedule) = schedule.as_mut() {
                let was_completed = schedule.completed;
                let record =
                    apply_session_to_schedule(schedule, duration, start_time, end_time, now);

                self.repo.insert_schedule_session_tx(&mut tx, &record).await?;
                if schedule.completed && !was_completed {
                    self.repo
                        .mark_schedule_completed_tx(&mut tx, schedule.id)
                        .await?;
                }
            }

            tx.commit().await?;

            return Ok(SessionOutcome {
                user,
                session,
                new_achievements,
                schedule,
            });
        }

        Err(ServerError::Conflict(
            "Too many concurrent updates, please retry.".into(),
        ))
    }

    /// Delete one session from the ledger, reversing its contribution to the
    /// aggregate counters.
    pub async fn delete_session(&self, user_id: Uuid, session_id: Uuid) -> Result<StudySession> {
        let now = Utc::now();

        let session = self
            .repo
            .find_session(user_id, session_id)
            .await?
            .ok_or(ServerError::NotFound("session"))?;

        for attempt in 0..MAX_RETRIES {
            let mut user = self.repo.find_by_id(user_id).await?;
            let expected_version = user.version;

            engine::reverse_session(&mut user, &session, now);

            let mut tx = self.repo.pool().begin().await?;

            if !self
                .repo
                .update_study_state_tx(&mut tx, &user, expected_version)
                .await?
            {
                tx.rollback().await?;
                tracing::debug!(%user_id, attempt, "version conflict, retrying");
                continue;
            }

            if !self.repo.delete_session_tx(&mut tx, user_id, session_id).await? {
                tx.rollback().await?;
                return Err(ServerError::NotFound("session"));
            }

            tx.commit().await?;
            return Ok(session);
        }

        Err(ServerError::Conflict(
            "Too many concurrent updates, please retry.".into(),
        ))
    }
}
