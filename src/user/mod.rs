//! Account store: users and their embedded study data.

mod repository;
mod service;

pub use repository::*;
pub use service::*;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

/// Default daily goal: 2 hours, in milliseconds.
pub const DEFAULT_DAILY_GOAL: i64 = 2 * 60 * 60 * 1000;

/// User as saved on database.
#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip)]
    pub password: String,
    pub invite_code: String,
    pub is_email_verified: bool,
    #[serde(skip)]
    pub otp: Option<String>,
    #[serde(skip)]
    pub otp_expires_at: Option<DateTime<Utc>>,
    pub daily_goal: i64,
    pub total_study_time: i64,
    pub weekly_study_time: i64,
    pub monthly_study_time: i64,
    pub current_streak: i32,
    pub last_study_date: Option<NaiveDate>,
    #[serde(skip)]
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

impl Default for User {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            username: String::default(),
            email: String::default(),
            password: String::default(),
            invite_code: String::default(),
            is_email_verified: false,
            otp: None,
            otp_expires_at: None,
            daily_goal: DEFAULT_DAILY_GOAL,
            total_study_time: 0,
            weekly_study_time: 0,
            monthly_study_time: 0,
            current_streak: 0,
            last_study_date: None,
            version: 0,
            created_at: Utc::now(),
        }
    }
}

/// A completed study interval on the session ledger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StudySession {
    pub id: Uuid,
    #[serde(skip)]
    pub user_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// In milliseconds.
    pub duration: i64,
    pub subject: String,
    pub notes: String,
    pub created_at: DateTime<Utc>,
}

/// Recurrence rule of a [`StudySchedule`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recurring {
    #[default]
    None,
    Daily,
    Weekly,
    Monthly,
}

impl Recurring {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recurring::None => "none",
            Recurring::Daily => "daily",
            Recurring::Weekly => "weekly",
            Recurring::Monthly => "monthly",
        }
    }
}

impl FromStr for Recurring {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "none" => Ok(Recurring::None),
            "daily" => Ok(Recurring::Daily),
            "weekly" => Ok(Recurring::Weekly),
            "monthly" => Ok(Recurring::Monthly),
            other => Err(format!("unknown recurrence '{other}'")),
        }
    }
}

/// A planned study block, accumulating completed sub-sessions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudySchedule {
    pub id: Uuid,
    #[serde(skip)]
    pub user_id: Uuid,
    pub title: String,
    pub subject: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub recurring: Recurring,
    pub completed: bool,
    pub completed_sessions: Vec<ScheduleSession>,
    pub created_at: DateTime<Utc>,
}

impl sqlx::FromRow<'_, PgRow> for StudySchedule {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let recurring: String = row.try_get("recurring")?;

        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            title: row.try_get("title")?,
            subject: row.try_get("subject")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            recurring: Recurring::from_str(&recurring).unwrap_or_default(),
            completed: row.try_get("completed")?,
            completed_sessions: Vec::new(),
            created_at: row.try_get("created_at")?,
        })
    }
}

/// A completed sub-session counted toward a schedule's target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSession {
    pub id: Uuid,
    #[serde(skip)]
    pub schedule_id: Uuid,
    pub date: DateTime<Utc>,
    pub duration: i64,
    pub actual_start_time: DateTime<Utc>,
    pub actual_end_time: DateTime<Utc>,
}

/// Fixed taxonomy of one-time milestones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AchievementKind {
    FirstSession,
    FiveSessions,
    TwentyFiveSessions,
    Streak3,
    Streak7,
    Streak30,
    GoalAchiever,
}

impl AchievementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AchievementKind::FirstSession => "first_session",
            AchievementKind::FiveSessions => "five_sessions",
            AchievementKind::TwentyFiveSessions => "twenty_five_sessions",
            AchievementKind::Streak3 => "streak_3",
            AchievementKind::Streak7 => "streak_7",
            AchievementKind::Streak30 => "streak_30",
            AchievementKind::GoalAchiever => "goal_achiever",
        }
    }

    /// Human-readable name used on notifications.
    pub fn display_name(&self) -> &'static str {
        match self {
            AchievementKind::FirstSession => "First Study Session!",
            AchievementKind::FiveSessions => "5 Study Sessions Complete!",
            AchievementKind::TwentyFiveSessions => "25 Study Sessions Master!",
            AchievementKind::Streak3 => "3-Day Study Streak!",
            AchievementKind::Streak7 => "7-Day Study Streak!",
            AchievementKind::Streak30 => "30-Day Study Streak!",
            AchievementKind::GoalAchiever => "Weekly Goal Achiever!",
        }
    }
}

impl fmt::Display for AchievementKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AchievementKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "first_session" => Ok(AchievementKind::FirstSession),
            "five_sessions" => Ok(AchievementKind::FiveSessions),
            "twenty_five_sessions" => Ok(AchievementKind::TwentyFiveSessions),
            "streak_3" => Ok(AchievementKind::Streak3),
            "streak_7" => Ok(AchievementKind::Streak7),
            "streak_30" => Ok(AchievementKind::Streak30),
            "goal_achiever" => Ok(AchievementKind::GoalAchiever),
            other => Err(format!("unknown achievement '{other}'")),
        }
    }
}

/// An unlocked milestone with its unlock date.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Achievement {
    pub kind: AchievementKind,
    pub unlocked_at: DateTime<Utc>,
}
