//! Routes for the session ledger, statistics, goals and schedules.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;
use validator::{Validate, ValidationError, ValidationErrors};

use super::ValidJson;
use crate::error::{Result, ServerError};
use crate::mail::Template;
use crate::presence::DEFAULT_SUBJECT;
use crate::user::{Recurring, StudySchedule, User};
use crate::AppState;

/// Days shown on the statistics week chart.
const WEEK_STAT_DAYS: i64 = 7;
/// Sessions returned by the ledger listing.
const SESSION_PAGE: i64 = 50;

fn invalid_field(field: &'static str, message: &'static str) -> ServerError {
    let mut errors = ValidationErrors::new();
    errors.add(field, ValidationError::new("invalid").with_message(message.into()));
    errors.into()
}

fn stats_summary(user: &User) -> serde_json::Value {
    json!({
        "totalStudyTime": user.total_study_time,
        "weeklyStudyTime": user.weekly_study_time,
        "monthlyStudyTime": user.monthly_study_time,
        "currentStreak": user.current_streak,
    })
}

/// Milliseconds studied since local midnight.
async fn today_study_time(state: &AppState, user_id: Uuid, now: DateTime<Utc>) -> Result<i64> {
    let midnight = now.date_naive().and_time(NaiveTime::MIN).and_utc();
    let sessions = state.users.repo.sessions_since(user_id, midnight).await?;

    Ok(sessions.iter().map(|(_, duration)| duration).sum())
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionBody {
    #[validate(length(max = 100, message = "Subject must be at most 100 characters."))]
    subject: Option<String>,
    schedule_id: Option<Uuid>,
}

/// Acknowledge a session start. Nothing is persisted until the stop call;
/// an abandoned timer must not leave a half-open row behind.
pub async fn start_session(
    Extension(user): Extension<User>,
    ValidJson(body): ValidJson<StartSessionBody>,
) -> Result<impl IntoResponse> {
    Ok(Json(json!({
        "message": "Session started.",
        "session": {
            "userId": user.id,
            "subject": body.subject.unwrap_or_else(|| DEFAULT_SUBJECT.to_owned()),
            "scheduleId": body.schedule_id,
            "startTime": Utc::now(),
        },
    })))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StopSessionBody {
    start_time: DateTime<Utc>,
    /// Defaults to the server clock.
    end_time: Option<DateTime<Utc>>,
    #[validate(length(max = 100, message = "Subject must be at most 100 characters."))]
    subject: Option<String>,
    #[validate(length(max = 1000, message = "Notes must be at most 1000 characters."))]
    notes: Option<String>,
    schedule_id: Option<Uuid>,
}

/// Close the running session: append it to the ledger and return the updated
/// aggregates, fresh achievements and today's goal progress.
pub async fn stop_session(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    ValidJson(body): ValidJson<StopSessionBody>,
) -> Result<impl IntoResponse> {
    let now = Utc::now();

    let outcome = state
        .users
        .record_session(
            user.id,
            body.start_time,
            body.end_time.unwrap_or(now),
            body.subject.unwrap_or_else(|| DEFAULT_SUBJECT.to_owned()),
            body.notes.unwrap_or_default(),
            body.schedule_id,
        )
        .await?;

    for kind in &outcome.new_achievements {
        state.mail.dispatch(
            Template::AchievementUnlocked { kind: *kind },
            outcome.user.email.clone(),
            outcome.user.username.clone(),
        );
    }

    let today = today_study_time(&state, user.id, now).await?;
    let new_achievements: Vec<_> = outcome
        .new_achievements
        .iter()
        .map(|kind| json!({"kind": kind, "name": kind.display_name()}))
        .collect();

    Ok(Json(json!({
        "session": outcome.session,
        "newAchievements": new_achievements,
        "schedule": outcome.schedule,
        "stats": stats_summary(&outcome.user),
        "todayProgress": {
            "todayStudyTime": today,
            "dailyGoal": outcome.user.daily_goal,
            "goalReached": today >= outcome.user.daily_goal,
        },
    })))
}

/// Remove one session from the ledger and roll its time back out of the
/// aggregates.
pub async fn delete_session(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    state.users.delete_session(user.id, session_id).await?;
    let user = state.users.repo.find_by_id(user.id).await?;

    Ok(Json(json!({
        "message": "Session deleted.",
        "stats": stats_summary(&user),
    })))
}

/// Recent ledger entries, newest first.
pub async fn sessions(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<impl IntoResponse> {
    let sessions = state.users.repo.recent_sessions(user.id, SESSION_PAGE).await?;

    Ok(Json(json!({ "sessions": sessions })))
}

/// Aggregates, the last week day by day and a per-subject breakdown.
pub async fn stats(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<impl IntoResponse> {
    let now = Utc::now();
    let today = now.date_naive();

    let window_start = (today - Duration::days(WEEK_STAT_DAYS - 1))
        .and_time(NaiveTime::MIN)
        .and_utc();
    let recent = state.users.repo.sessions_since(user.id, window_start).await?;

    let week_stats: Vec<_> = (0..WEEK_STAT_DAYS)
        .map(|offset| {
            let day = today - Duration::days(WEEK_STAT_DAYS - 1 - offset);
            let duration: i64 = recent
                .iter()
                .filter(|(start, _)| start.date_naive() == day)
                .map(|(_, duration)| duration)
                .sum();

            json!({"date": day, "duration": duration})
        })
        .collect();

    let all = state.users.repo.all_sessions(user.id).await?;
    let mut subjects: Vec<(String, i64, usize)> = Vec::new();
    for session in &all {
        match subjects.iter_mut().find(|(name, ..)| *name == session.subject) {
            Some((_, duration, count)) => {
                *duration += session.duration;
                *count += 1;
            },
            None => subjects.push((session.subject.clone(), session.duration, 1)),
        }
    }
    subjects.sort_by(|a, b| b.1.cmp(&a.1));

    let subject_stats: Vec<_> = subjects
        .into_iter()
        .map(|(subject, duration, count)| {
            json!({"subject": subject, "duration": duration, "sessions": count})
        })
        .collect();

    Ok(Json(json!({
        "totalStudyTime": user.total_study_time,
        "weeklyStudyTime": user.weekly_study_time,
        "monthlyStudyTime": user.monthly_study_time,
        "currentStreak": user.current_streak,
        "totalSessions": all.len(),
        "weekStats": week_stats,
        "subjectStats": subject_stats,
        "schedules": state.users.repo.schedules(user.id).await?,
    })))
}

/// Progress toward the daily goal.
pub async fn today(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<impl IntoResponse> {
    let today = today_study_time(&state, user.id, Utc::now()).await?;

    Ok(Json(json!({
        "todayStudyTime": today,
        "dailyGoal": user.daily_goal,
        "goalReached": today >= user.daily_goal,
        "currentStreak": user.current_streak,
    })))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GoalBody {
    /// Between 15 minutes and 12 hours, in milliseconds.
    #[validate(range(
        min = 900_000,
        max = 43_200_000,
        message = "Daily goal must be between 15 minutes and 12 hours."
    ))]
    daily_goal: i64,
}

/// Update the daily study goal.
pub async fn update_goal(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    ValidJson(body): ValidJson<GoalBody>,
) -> Result<impl IntoResponse> {
    state.users.repo.update_goal(user.id, body.daily_goal).await?;

    Ok(Json(json!({ "dailyGoal": body.daily_goal })))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateScheduleBody {
    #[validate(length(min = 1, max = 100, message = "Title must be 1 to 100 characters."))]
    title: String,
    #[validate(length(min = 1, max = 100, message = "Subject must be 1 to 100 characters."))]
    subject: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    recurring: Option<Recurring>,
}

/// Plan a study block.
pub async fn create_schedule(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    ValidJson(body): ValidJson<CreateScheduleBody>,
) -> Result<impl IntoResponse> {
    if body.end_time.is_some_and(|end| end <= body.start_time) {
        return Err(invalid_field("endTime", "End time must be after start time."));
    }

    let schedule = StudySchedule {
        id: Uuid::new_v4(),
        user_id: user.id,
        title: body.title,
        subject: body.subject,
        start_time: body.start_time,
        end_time: body.end_time,
        recurring: body.recurring.unwrap_or_default(),
        completed: false,
        completed_sessions: Vec::new(),
        created_at: Utc::now(),
    };

    state.users.repo.insert_schedule(&schedule).await?;

    Ok((StatusCode::CREATED, Json(schedule)))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateScheduleBody {
    #[validate(length(min = 1, max = 100, message = "Title must be 1 to 100 characters."))]
    title: Option<String>,
    #[validate(length(min = 1, max = 100, message = "Subject must be 1 to 100 characters."))]
    subject: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    recurring: Option<Recurring>,
}

/// Edit a planned block. Completion is monotonic and never reset here.
pub async fn update_schedule(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(schedule_id): Path<Uuid>,
    ValidJson(body): ValidJson<UpdateScheduleBody>,
) -> Result<impl IntoResponse> {
    let mut schedule = state
        .users
        .repo
        .find_schedule(user.id, schedule_id)
        .await?
        .ok_or(ServerError::NotFound("schedule"))?;

    if let Some(title) = body.title {
        schedule.title = title;
    }
    if let Some(subject) = body.subject {
        schedule.subject = subject;
    }
    if let Some(start_time) = body.start_time {
        schedule.start_time = start_time;
    }
    if let Some(end_time) = body.end_time {
        schedule.end_time = Some(end_time);
    }
    if let Some(recurring) = body.recurring {
        schedule.recurring = recurring;
    }

    if schedule.end_time.is_some_and(|end| end <= schedule.start_time) {
        return Err(invalid_field("endTime", "End time must be after start time."));
    }

    state.users.repo.update_schedule(&schedule).await?;

    Ok(Json(schedule))
}

/// Remove a planned block.
pub async fn delete_schedule(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(schedule_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    if !state.users.repo.delete_schedule(user.id, schedule_id).await? {
        return Err(ServerError::NotFound("schedule"));
    }

    Ok(Json(json!({ "message": "Schedule deleted." })))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use uuid::Uuid;

    use crate::{app, make_request, router};

    /// A stopped 90-minute session ending now.
    fn stop_body(subject: &str) -> serde_json::Value {
        let end = Utc::now();
        json!({
            "startTime": (end - Duration::minutes(90)).to_rfc3339(),
            "endTime": end.to_rfc3339(),
            "subject": subject,
        })
    }

    #[sqlx::test]
    async fn test_start_session_echoes_provisional_record(pool: sqlx::PgPool) {
        let app = app(router::state(pool.clone()));
        let (token, _) = router::signup(&app, &pool, "alice", "alice@example.com").await;

        let (status, body) = make_request(
            &app,
            "POST",
            "/study/session/start",
            Some(&token),
            json!({"subject": "Math"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session"]["subject"], json!("Math"));
        assert!(body["session"]["startTime"].is_string());

        // No subject falls back to the default, nothing is persisted.
        let (_, body) = make_request(
            &app,
            "POST",
            "/study/session/start",
            Some(&token),
            json!({}),
        )
        .await;
        assert_eq!(body["session"]["subject"], json!("General Study"));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM study_sessions")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[sqlx::test]
    async fn test_stop_session_updates_everything(pool: sqlx::PgPool) {
        let app = app(router::state(pool.clone()));
        let (token, _) = router::signup(&app, &pool, "alice", "alice@example.com").await;

        let (status, body) = make_request(
            &app,
            "POST",
            "/study/session/stop",
            Some(&token),
            stop_body("Math"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session"]["duration"], json!(5_400_000));
        assert_eq!(body["session"]["subject"], json!("Math"));
        assert_eq!(body["stats"]["totalStudyTime"], json!(5_400_000));
        assert_eq!(body["stats"]["currentStreak"], json!(1));
        assert_eq!(
            body["newAchievements"][0]["kind"],
            json!("first_session")
        );
        // 90 minutes against the 2-hour default goal.
        assert_eq!(body["todayProgress"]["goalReached"], json!(false));
    }

    #[sqlx::test]
    async fn test_stop_session_rejects_backwards_range(pool: sqlx::PgPool) {
        let app = app(router::state(pool.clone()));
        let (token, _) = router::signup(&app, &pool, "alice", "alice@example.com").await;

        let (status, _) = make_request(
            &app,
            "POST",
            "/study/session/stop",
            Some(&token),
            json!({"startTime": (Utc::now() + Duration::hours(1)).to_rfc3339()}),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[sqlx::test]
    async fn test_delete_session_reverses_counters(pool: sqlx::PgPool) {
        let app = app(router::state(pool.clone()));
        let (token, _) = router::signup(&app, &pool, "alice", "alice@example.com").await;

        let (_, body) = make_request(
            &app,
            "POST",
            "/study/session/stop",
            Some(&token),
            stop_body("Math"),
        )
        .await;
        let session_id = body["session"]["id"].as_str().unwrap().to_owned();

        let (status, body) = make_request(
            &app,
            "DELETE",
            &format!("/study/session/{session_id}"),
            Some(&token),
            json!({}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stats"]["totalStudyTime"], json!(0));

        // A second delete finds nothing.
        let (status, _) = make_request(
            &app,
            "DELETE",
            &format!("/study/session/{session_id}"),
            Some(&token),
            json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[sqlx::test]
    async fn test_goal_bounds(pool: sqlx::PgPool) {
        let app = app(router::state(pool.clone()));
        let (token, _) = router::signup(&app, &pool, "alice", "alice@example.com").await;

        let (status, _) = make_request(
            &app,
            "PUT",
            "/study/goal",
            Some(&token),
            json!({"dailyGoal": 1000}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = make_request(
            &app,
            "PUT",
            "/study/goal",
            Some(&token),
            json!({"dailyGoal": 3_600_000}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["dailyGoal"], json!(3_600_000));
    }

    #[sqlx::test]
    async fn test_schedule_completion(pool: sqlx::PgPool) {
        let app = app(router::state(pool.clone()));
        let (token, _) = router::signup(&app, &pool, "alice", "alice@example.com").await;

        let planned_start = Utc::now() - Duration::hours(2);
        let (status, body) = make_request(
            &app,
            "POST",
            "/study/schedule",
            Some(&token),
            json!({
                "title": "Algebra revision",
                "subject": "Math",
                "startTime": planned_start.to_rfc3339(),
                "endTime": (planned_start + Duration::hours(1)).to_rfc3339(),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["completed"], json!(false));
        let schedule_id = body["id"].as_str().unwrap().to_owned();

        // One full hour studied against a one-hour plan.
        let end = Utc::now();
        let (status, body) = make_request(
            &app,
            "POST",
            "/study/session/stop",
            Some(&token),
            json!({
                "startTime": (end - Duration::hours(1)).to_rfc3339(),
                "endTime": end.to_rfc3339(),
                "subject": "Math",
                "scheduleId": schedule_id,
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["schedule"]["completed"], json!(true));
        assert_eq!(
            body["schedule"]["completedSessions"].as_array().unwrap().len(),
            1
        );
    }

    #[sqlx::test]
    async fn test_schedule_not_found(pool: sqlx::PgPool) {
        let app = app(router::state(pool.clone()));
        let (token, _) = router::signup(&app, &pool, "alice", "alice@example.com").await;

        let unknown = Uuid::new_v4();
        let (status, _) = make_request(
            &app,
            "DELETE",
            &format!("/study/schedule/{unknown}"),
            Some(&token),
            json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = make_request(
            &app,
            "PUT",
            &format!("/study/schedule/{unknown}"),
            Some(&token),
            json!({"title": "Renamed"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[sqlx::test]
    async fn test_stats_shape(pool: sqlx::PgPool) {
        let app = app(router::state(pool.clone()));
        let (token, _) = router::signup(&app, &pool, "alice", "alice@example.com").await;

        make_request(
            &app,
            "POST",
            "/study/session/stop",
            Some(&token),
            stop_body("History"),
        )
        .await;

        let (status, body) = make_request(&app, "GET", "/study/stats", Some(&token), json!({})).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalSessions"], json!(1));
        let week = body["weekStats"].as_array().unwrap();
        assert_eq!(week.len(), 7);
        let week_total: i64 = week.iter().map(|day| day["duration"].as_i64().unwrap()).sum();
        assert_eq!(week_total, 5_400_000);
        assert_eq!(body["subjectStats"][0]["subject"], json!("History"));
        assert_eq!(body["subjectStats"][0]["sessions"], json!(1));
    }
}
