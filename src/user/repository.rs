//! Handle database requests.

use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::Result;
use crate::user::{Achievement, AchievementKind, ScheduleSession, StudySchedule, StudySession, User};

#[derive(Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    /// Create a new [`UserRepository`].
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool, for callers composing their own transactions.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert [`User`] into database.
    pub async fn insert(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO users
                (id, username, email, password, invite_code, is_email_verified,
                 otp, otp_expires_at, daily_goal, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password)
        .bind(&user.invite_code)
        .bind(user.is_email_verified)
        .bind(&user.otp)
        .bind(user.otp_expires_at)
        .bind(user.daily_goal)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Hard-delete a user. Only used as a compensating action when
    /// registration cannot deliver the verification mail.
    pub async fn delete(&self, user_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Find current user using `id` field.
    pub async fn find_by_id(&self, user_id: Uuid) -> Result<User> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(user)
    }

    /// Find a user using `email` field.
    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    /// Find a user using `username` field.
    pub async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    /// Find a user using `invite_code` field.
    pub async fn find_by_invite_code(&self, code: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE invite_code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    /// Reissue the email-verification code.
    pub async fn set_otp(
        &self,
        user_id: Uuid,
        otp: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE users SET otp = $1, otp_expires_at = $2 WHERE id = $3")
            .bind(otp)
            .bind(expires_at)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Flip `is_email_verified` and drop the consumed code.
    pub async fn mark_verified(&self, user_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"UPDATE users
                SET is_email_verified = TRUE, otp = NULL, otp_expires_at = NULL
                WHERE id = $1"#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Update the daily study goal, in milliseconds.
    pub async fn update_goal(&self, user_id: Uuid, daily_goal: i64) -> Result<()> {
        sqlx::query("UPDATE users SET daily_goal = $1 WHERE id = $2")
            .bind(daily_goal)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Persist the user's aggregate/streak state computed by the engine.
    ///
    /// Guarded by optimistic concurrency: returns `false` when another writer
    /// advanced `version` since the state was loaded.
    pub async fn update_study_state_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user: &User,
        expected_version: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE users
                SET total_study_time = $1,
                    weekly_study_time = $2,
                    monthly_study_time = $3,
                    current_streak = $4,
                    last_study_date = $5,
                    version = version + 1
                WHERE id = $6 AND version = $7"#,
        )
        .bind(user.total_study_time)
        .bind(user.weekly_study_time)
        .bind(user.monthly_study_time)
        .bind(user.current_streak)
        .bind(user.last_study_date)
        .bind(user.id)
        .bind(expected_version)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // ------------------------------------------------------------------
    // Session ledger.

    pub async fn insert_session_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        session: &StudySession,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO study_sessions
                (id, user_id, start_time, end_time, duration, subject, notes, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(session.id)
        .bind(session.user_id)
        .bind(session.start_time)
        .bind(session.end_time)
        .bind(session.duration)
        .bind(&session.subject)
        .bind(&session.notes)
        .bind(session.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    pub async fn find_session(
        &self,
        user_id: Uuid,
        session_id: Uuid,
    ) -> Result<Option<StudySession>> {
        let session = sqlx::query_as::<_, StudySession>(
            "SELECT * FROM study_sessions WHERE id = $1 AND user_id = $2",
        )
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(session)
    }

    pub async fn delete_session_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        session_id: Uuid,
    ) -> Result<bool> {
        let result = sqlx::query("DELETE FROM study_sessions WHERE id = $1 AND user_id = $2")
            .bind(session_id)
            .bind(user_id)
            .execute(&mut **tx)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Most recent sessions first.
    pub async fn recent_sessions(&self, user_id: Uuid, limit: i64) -> Result<Vec<StudySession>> {
        let sessions = sqlx::query_as::<_, StudySession>(
            r#"SELECT * FROM study_sessions
                WHERE user_id = $1
                ORDER BY start_time DESC
                LIMIT $2"#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(sessions)
    }

    /// Every session on the ledger, oldest first. Used by the statistics
    /// endpoint for the per-subject breakdown.
    pub async fn all_sessions(&self, user_id: Uuid) -> Result<Vec<StudySession>> {
        let sessions = sqlx::query_as::<_, StudySession>(
            "SELECT * FROM study_sessions WHERE user_id = $1 ORDER BY start_time",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(sessions)
    }

    /// (start, duration) pairs for sessions starting at or after `since`.
    pub async fn sessions_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, i64)>> {
        let rows = sqlx::query(
            r#"SELECT start_time, duration FROM study_sessions
                WHERE user_id = $1 AND start_time >= $2"#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Ok((row.try_get("start_time")?, row.try_get("duration")?)))
            .collect()
    }

    pub async fn count_sessions(&self, user_id: Uuid) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM study_sessions WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    // ------------------------------------------------------------------
    // Achievements.

    pub async fn achievements(&self, user_id: Uuid) -> Result<Vec<Achievement>> {
        let rows = sqlx::query(
            "SELECT kind, unlocked_at FROM achievements WHERE user_id = $1 ORDER BY unlocked_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let kind: String = row.try_get("kind").ok()?;
                Some(Achievement {
                    kind: AchievementKind::from_str(&kind).ok()?,
                    unlocked_at: row.try_get("unlocked_at").ok()?,
                })
            })
            .collect())
    }

    pub async fn achievement_kinds(&self, user_id: Uuid) -> Result<HashSet<AchievementKind>> {
        let kinds: Vec<String> =
            sqlx::query_scalar("SELECT kind FROM achievements WHERE user_id = $1")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(kinds
            .iter()
            .filter_map(|kind| AchievementKind::from_str(kind).ok())
            .collect())
    }

    /// Unlocks are idempotent: the primary key swallows duplicates.
    pub async fn insert_achievements_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        kinds: &[AchievementKind],
        now: DateTime<Utc>,
    ) -> Result<()> {
        for kind in kinds {
            sqlx::query(
                r#"INSERT INTO achievements (user_id, kind, unlocked_at)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (user_id, kind) DO NOTHING"#,
            )
            .bind(user_id)
            .bind(kind.as_str())
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Friend graph. Both orientations live in the table, so mutations run
    // inside one transaction: both sides or neither.

    pub async fn are_friends(&self, user_id: Uuid, friend_id: Uuid) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM friends WHERE user_id = $1 AND friend_id = $2)",
        )
        .bind(user_id)
        .bind(friend_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    pub async fn add_friendship(&self, user_id: Uuid, friend_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO friends (user_id, friend_id) VALUES ($1, $2)")
            .bind(user_id)
            .bind(friend_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO friends (user_id, friend_id) VALUES ($1, $2)")
            .bind(friend_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_friendship(&self, user_id: Uuid, friend_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"DELETE FROM friends
                WHERE (user_id = $1 AND friend_id = $2)
                   OR (user_id = $2 AND friend_id = $1)"#,
        )
        .bind(user_id)
        .bind(friend_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn friend_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar("SELECT friend_id FROM friends WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(ids)
    }

    pub async fn friends(&self, user_id: Uuid) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(
            r#"SELECT u.* FROM users u
                JOIN friends f ON f.friend_id = u.id
                WHERE f.user_id = $1
                ORDER BY u.username"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(users)
    }

    // ------------------------------------------------------------------
    // Schedules.

    pub async fn insert_schedule(&self, schedule: &StudySchedule) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO study_schedules
                (id, user_id, title, subject, start_time, end_time, recurring, completed, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
        )
        .bind(schedule.id)
        .bind(schedule.user_id)
        .bind(&schedule.title)
        .bind(&schedule.subject)
        .bind(schedule.start_time)
        .bind(schedule.end_time)
        .bind(schedule.recurring.as_str())
        .bind(schedule.completed)
        .bind(schedule.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Schedule owned by `user_id`, with its completed sub-sessions loaded.
    pub async fn find_schedule(
        &self,
        user_id: Uuid,
        schedule_id: Uuid,
    ) -> Result<Option<StudySchedule>> {
        let schedule = sqlx::query_as::<_, StudySchedule>(
            "SELECT * FROM study_schedules WHERE id = $1 AND user_id = $2",
        )
        .bind(schedule_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(mut schedule) = schedule else {
            return Ok(None);
        };

        schedule.completed_sessions = self.schedule_sessions(schedule.id).await?;
        Ok(Some(schedule))
    }

    pub async fn schedules(&self, user_id: Uuid) -> Result<Vec<StudySchedule>> {
        let mut schedules = sqlx::query_as::<_, StudySchedule>(
            "SELECT * FROM study_schedules WHERE user_id = $1 ORDER BY start_time",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        for schedule in &mut schedules {
            schedule.completed_sessions = self.schedule_sessions(schedule.id).await?;
        }

        Ok(schedules)
    }

    async fn schedule_sessions(&self, schedule_id: Uuid) -> Result<Vec<ScheduleSession>> {
        let sessions = sqlx::query_as::<_, ScheduleSession>(
            "SELECT * FROM schedule_sessions WHERE schedule_id = $1 ORDER BY date",
        )
        .bind(schedule_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(sessions)
    }

    pub async fn update_schedule(&self, schedule: &StudySchedule) -> Result<()> {
        sqlx::query(
            r#"UPDATE study_schedules
                SET title = $1, subject = $2, start_time = $3, end_time = $4,
                    recurring = $5, completed = $6
                WHERE id = $7 AND user_id = $8"#,
        )
        .bind(&schedule.title)
        .bind(&schedule.subject)
        .bind(schedule.start_time)
        .bind(schedule.end_time)
        .bind(schedule.recurring.as_str())
        .bind(schedule.completed)
        .bind(schedule.id)
        .bind(schedule.user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete_schedule(&self, user_id: Uuid, schedule_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM study_schedules WHERE id = $1 AND user_id = $2")
            .bind(schedule_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn insert_schedule_session_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        session: &ScheduleSession,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO schedule_sessions
                (id, schedule_id, date, duration, actual_start_time, actual_end_time)
                VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(session.id)
        .bind(session.schedule_id)
        .bind(session.date)
        .bind(session.duration)
        .bind(session.actual_start_time)
        .bind(session.actual_end_time)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Completion is monotonic: this only ever sets the flag.
    pub async fn mark_schedule_completed_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        schedule_id: Uuid,
    ) -> Result<()> {
        sqlx::query("UPDATE study_schedules SET completed = TRUE WHERE id = $1")
            .bind(schedule_id)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }
}
