//! Streak and achievement engine.
//!
//! Pure functions over a user's accumulated state and one new session. All
//! persistence is the caller's concern; this module never touches the
//! database, so every rule here is unit-testable with plain values.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use validator::{ValidationError, ValidationErrors};

use crate::error::{Result, ServerError};
use crate::user::{AchievementKind, StudySession, User};

/// Days grouped for the `goal_achiever` window, today included.
const GOAL_WINDOW_DAYS: u64 = 7;

/// Accumulated facts about the user needed to evaluate achievements.
///
/// `total_sessions` and `recent_sessions` describe the ledger BEFORE the new
/// session; the engine accounts for the new one itself.
#[derive(Debug, Default)]
pub struct EngineContext {
    /// Number of sessions already on the ledger.
    pub total_sessions: i64,
    /// (start, duration) of sessions started within the trailing 7 days.
    pub recent_sessions: Vec<(DateTime<Utc>, i64)>,
    /// Achievement kinds already unlocked.
    pub unlocked: HashSet<AchievementKind>,
}

/// First day of the week bucket containing `now` (Sunday-based, midnight).
pub fn week_start(now: DateTime<Utc>) -> NaiveDate {
    let today = now.date_naive();
    today - Days::new(u64::from(now.weekday().num_days_from_sunday()))
}

/// First day of the calendar month containing `now`.
pub fn month_start(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive().with_day(1).unwrap_or(now.date_naive())
}

fn invalid_session(message: &'static str) -> ServerError {
    let mut errors = ValidationErrors::new();
    errors.add(
        "session",
        ValidationError::new("invalid_session").with_message(message.into()),
    );
    ServerError::Validation(errors)
}

/// Record one completed session against the user's aggregate state.
///
/// Appends to the counters, advances the streak, and returns the newly
/// unlocked achievement kinds, in the order they qualified.
pub fn record_session(
    user: &mut User,
    ctx: &EngineContext,
    session: &StudySession,
    now: DateTime<Utc>,
) -> Result<Vec<AchievementKind>> {
    if session.duration < 0 {
        return Err(invalid_session("Session duration must not be negative."));
    }
    if session.end_time < session.start_time {
        return Err(invalid_session("Session must end after it starts."));
    }

    // Aggregate counters.
    user.total_study_time += session.duration;
    if session.start_time.date_naive() >= week_start(now) {
        user.weekly_study_time += session.duration;
    }
    if session.start_time.date_naive() >= month_start(now) {
        user.monthly_study_time += session.duration;
    }

    // Streak only moves when the session belongs to "today"; sessions logged
    // for past days leave it untouched.
    let today = now.date_naive();
    let session_day = session.start_time.date_naive();
    if session_day == today {
        let yesterday = today - Days::new(1);
        match user.last_study_date {
            Some(date) if date == today => {}, // already counted today.
            Some(date) if date == yesterday => user.current_streak += 1,
            _ => user.current_streak = 1,
        }
        user.last_study_date = Some(today);
    }

    Ok(evaluate_achievements(user, ctx, session, now))
}

/// Subtract a deleted session from the aggregate counters.
///
/// Counters never go below zero; the streak is deliberately left alone (the
/// ledger is append-only from the engine's perspective).
pub fn reverse_session(user: &mut User, session: &StudySession, now: DateTime<Utc>) {
    user.total_study_time = (user.total_study_time - session.duration).max(0);
    if session.start_time.date_naive() >= week_start(now) {
        user.weekly_study_time = (user.weekly_study_time - session.duration).max(0);
    }
    if session.start_time.date_naive() >= month_start(now) {
        user.monthly_study_time = (user.monthly_study_time - session.duration).max(0);
    }
}

fn evaluate_achievements(
    user: &User,
    ctx: &EngineContext,
    session: &StudySession,
    now: DateTime<Utc>,
) -> Vec<AchievementKind> {
    let total_sessions = ctx.total_sessions + 1;
    let mut qualifying = Vec::new();

    if total_sessions == 1 {
        qualifying.push(AchievementKind::FirstSession);
    }
    if total_sessions >= 5 {
        qualifying.push(AchievementKind::FiveSessions);
    }
    if total_sessions >= 25 {
        qualifying.push(AchievementKind::TwentyFiveSessions);
    }
    if user.current_streak >= 3 {
        qualifying.push(AchievementKind::Streak3);
    }
    if user.current_streak >= 7 {
        qualifying.push(AchievementKind::Streak7);
    }
    if user.current_streak >= 30 {
        qualifying.push(AchievementKind::Streak30);
    }
    if daily_goal_days(user, ctx, session, now) >= GOAL_WINDOW_DAYS as usize {
        qualifying.push(AchievementKind::GoalAchiever);
    }

    qualifying
        .into_iter()
        .filter(|kind| !ctx.unlocked.contains(kind))
        .collect()
}

/// Count days in the trailing window whose summed study time met the goal.
fn daily_goal_days(
    user: &User,
    ctx: &EngineContext,
    session: &StudySession,
    now: DateTime<Utc>,
) -> usize {
    let window_start = now.date_naive() - Days::new(GOAL_WINDOW_DAYS - 1);

    let mut per_day: HashMap<NaiveDate, i64> = HashMap::new();
    for (start, duration) in ctx
        .recent_sessions
        .iter()
        .copied()
        .chain(std::iter::once((session.start_time, session.duration)))
    {
        let day = start.date_naive();
        if day >= window_start {
            *per_day.entry(day).or_default() += duration;
        }
    }

    per_day
        .values()
        .filter(|total| **total >= user.daily_goal)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    const HOUR: i64 = 60 * 60 * 1000;

    fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
    }

    fn session(start: DateTime<Utc>, duration: i64) -> StudySession {
        StudySession {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            start_time: start,
            end_time: start + chrono::Duration::milliseconds(duration),
            duration,
            subject: "Math".into(),
            notes: String::new(),
            created_at: start,
        }
    }

    #[test]
    fn test_counters_accumulate() {
        let mut user = User::default();
        let now = at(2025, 6, 18, 12); // a Wednesday.

        let first = session(at(2025, 6, 18, 10), 2 * HOUR);
        record_session(&mut user, &EngineContext::default(), &first, now).unwrap();

        assert_eq!(user.total_study_time, 2 * HOUR);
        assert_eq!(user.weekly_study_time, 2 * HOUR);
        assert_eq!(user.monthly_study_time, 2 * HOUR);
    }

    #[test]
    fn test_old_session_only_counts_toward_total() {
        let mut user = User::default();
        let now = at(2025, 6, 18, 12);

        // Started in May: outside both the week and the month windows.
        let old = session(at(2025, 5, 2, 10), HOUR);
        record_session(&mut user, &EngineContext::default(), &old, now).unwrap();

        assert_eq!(user.total_study_time, HOUR);
        assert_eq!(user.weekly_study_time, 0);
        assert_eq!(user.monthly_study_time, 0);
    }

    #[test]
    fn test_rejects_negative_duration() {
        let mut user = User::default();
        let now = at(2025, 6, 18, 12);

        let mut bad = session(at(2025, 6, 18, 10), HOUR);
        bad.duration = -1;

        assert!(record_session(&mut user, &EngineContext::default(), &bad, now).is_err());
    }

    #[test]
    fn test_rejects_end_before_start() {
        let mut user = User::default();
        let now = at(2025, 6, 18, 12);

        let mut bad = session(at(2025, 6, 18, 10), HOUR);
        bad.end_time = bad.start_time - chrono::Duration::seconds(1);

        assert!(record_session(&mut user, &EngineContext::default(), &bad, now).is_err());
    }

    #[test]
    fn test_streak_over_consecutive_days() {
        let mut user = User::default();
        let mut unlocked = HashSet::new();

        for (i, day) in [16, 17, 18].iter().enumerate() {
            let now = at(2025, 6, *day, 20);
            let ctx = EngineContext {
                total_sessions: i as i64,
                recent_sessions: Vec::new(),
                unlocked: unlocked.clone(),
            };
            let new = record_session(&mut user, &ctx, &session(at(2025, 6, *day, 19), HOUR), now)
                .unwrap();
            unlocked.extend(new);
        }

        assert_eq!(user.current_streak, 3);
        assert!(unlocked.contains(&AchievementKind::Streak3));
    }

    #[test]
    fn test_streak_unchanged_twice_same_day() {
        let mut user = User::default();
        let now = at(2025, 6, 18, 20);

        for _ in 0..2 {
            record_session(
                &mut user,
                &EngineContext::default(),
                &session(at(2025, 6, 18, 10), HOUR),
                now,
            )
            .unwrap();
        }

        assert_eq!(user.current_streak, 1);
    }

    #[test]
    fn test_streak_resets_after_gap() {
        let mut user = User::default();

        record_session(
            &mut user,
            &EngineContext::default(),
            &session(at(2025, 6, 16, 10), HOUR),
            at(2025, 6, 16, 12),
        )
        .unwrap();
        assert_eq!(user.current_streak, 1);

        // Skip June 17 entirely.
        record_session(
            &mut user,
            &EngineContext::default(),
            &session(at(2025, 6, 18, 10), HOUR),
            at(2025, 6, 18, 12),
        )
        .unwrap();

        assert_eq!(user.current_streak, 1);
    }

    #[test]
    fn test_past_day_session_leaves_streak_alone() {
        let mut user = User::default();
        user.current_streak = 4;
        user.last_study_date = Some(at(2025, 6, 17, 0).date_naive());

        // Logged on June 18 for June 10.
        record_session(
            &mut user,
            &EngineContext::default(),
            &session(at(2025, 6, 10, 10), HOUR),
            at(2025, 6, 18, 12),
        )
        .unwrap();

        assert_eq!(user.current_streak, 4);
        assert_eq!(user.last_study_date, Some(at(2025, 6, 17, 0).date_naive()));
    }

    #[test]
    fn test_first_session_achievement() {
        let mut user = User::default();
        let now = at(2025, 6, 18, 12);

        let new = record_session(
            &mut user,
            &EngineContext::default(),
            &session(at(2025, 6, 18, 10), HOUR),
            now,
        )
        .unwrap();

        assert!(new.contains(&AchievementKind::FirstSession));
    }

    #[test]
    fn test_achievements_are_idempotent() {
        let mut user = User::default();
        let now = at(2025, 6, 18, 12);

        let ctx = EngineContext {
            total_sessions: 6,
            recent_sessions: Vec::new(),
            unlocked: HashSet::from([AchievementKind::FirstSession, AchievementKind::FiveSessions]),
        };
        let new =
            record_session(&mut user, &ctx, &session(at(2025, 6, 18, 10), HOUR), now).unwrap();

        assert!(!new.contains(&AchievementKind::FiveSessions));
    }

    #[test]
    fn test_goal_achiever_unlocks_after_seven_full_days() {
        let mut user = User::default(); // daily goal: 2h.
        let now = at(2025, 6, 18, 22);

        // Six prior days at goal, plus today's qualifying session.
        let recent: Vec<(DateTime<Utc>, i64)> = (12..18)
            .map(|day| (at(2025, 6, day, 9), 2 * HOUR))
            .collect();
        let ctx = EngineContext {
            total_sessions: recent.len() as i64,
            recent_sessions: recent,
            unlocked: HashSet::new(),
        };

        let new = record_session(&mut user, &ctx, &session(at(2025, 6, 18, 9), 2 * HOUR), now)
            .unwrap();

        assert!(new.contains(&AchievementKind::GoalAchiever));
    }

    #[test]
    fn test_goal_achiever_needs_each_day_at_goal() {
        let mut user = User::default();
        let now = at(2025, 6, 18, 22);

        // One short day in the window.
        let mut recent: Vec<(DateTime<Utc>, i64)> = (12..17)
            .map(|day| (at(2025, 6, day, 9), 2 * HOUR))
            .collect();
        recent.push((at(2025, 6, 17, 9), HOUR));
        let ctx = EngineContext {
            total_sessions: recent.len() as i64,
            recent_sessions: recent,
            unlocked: HashSet::new(),
        };

        let new = record_session(&mut user, &ctx, &session(at(2025, 6, 18, 9), 2 * HOUR), now)
            .unwrap();

        assert!(!new.contains(&AchievementKind::GoalAchiever));
    }

    #[test]
    fn test_reverse_session_decrements_and_clamps() {
        let mut user = User::default();
        let now = at(2025, 6, 18, 12);
        let s = session(at(2025, 6, 18, 10), 2 * HOUR);

        record_session(&mut user, &EngineContext::default(), &s, now).unwrap();
        reverse_session(&mut user, &s, now);

        assert_eq!(user.total_study_time, 0);
        assert_eq!(user.weekly_study_time, 0);
        assert_eq!(user.monthly_study_time, 0);

        // Reversing again must not underflow.
        reverse_session(&mut user, &s, now);
        assert_eq!(user.total_study_time, 0);
    }

    #[test]
    fn test_week_window_is_sunday_anchored() {
        // 2025-06-18 is a Wednesday; the bucket starts Sunday 2025-06-15.
        let now = at(2025, 6, 18, 12);
        assert_eq!(week_start(now), at(2025, 6, 15, 0).date_naive());

        let mut user = User::default();
        // Saturday June 14: previous bucket.
        record_session(
            &mut user,
            &EngineContext::default(),
            &session(at(2025, 6, 14, 10), HOUR),
            now,
        )
        .unwrap();

        assert_eq!(user.weekly_study_time, 0);
        assert_eq!(user.monthly_study_time, HOUR);
    }
}
