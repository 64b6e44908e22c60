//! Schedule progress tracking.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::user::{ScheduleSession, StudySchedule};

/// Append a completed sub-session to the schedule and recompute completion.
///
/// Open-ended schedules (no `end_time`) never auto-complete. The `completed`
/// flag is monotonic: once set it is never cleared, even if sub-sessions are
/// later removed from the sum.
pub fn apply_session_to_schedule(
    schedule: &mut StudySchedule,
    duration: i64,
    actual_start: DateTime<Utc>,
    actual_end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> ScheduleSession {
    let record = ScheduleSession {
        id: Uuid::new_v4(),
        schedule_id: schedule.id,
        date: now,
        duration,
        actual_start_time: actual_start,
        actual_end_time: actual_end,
    };
    schedule.completed_sessions.push(record.clone());

    if let Some(end_time) = schedule.end_time {
        let total_completed: i64 = schedule
            .completed_sessions
            .iter()
            .map(|session| session.duration)
            .sum();
        let planned = (end_time - schedule.start_time).num_milliseconds();

        if total_completed >= planned {
            schedule.completed = true;
        }
    }

    record
}
