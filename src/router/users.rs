//! Routes for the friend graph and public profiles.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use super::ValidJson;
use crate::error::{Result, ServerError};
use crate::user::User;
use crate::AppState;

/// Sessions attached to each entry of the friends listing.
const FRIEND_SESSIONS: i64 = 5;
/// Sessions attached to a profile view.
const PROFILE_SESSIONS: i64 = 10;

async fn friend_summary(state: &AppState, friend: &User) -> Result<serde_json::Value> {
    let recent_sessions = state
        .users
        .repo
        .recent_sessions(friend.id, FRIEND_SESSIONS)
        .await?;

    Ok(json!({
        "id": friend.id,
        "username": friend.username,
        "totalStudyTime": friend.total_study_time,
        "weeklyStudyTime": friend.weekly_study_time,
        "monthlyStudyTime": friend.monthly_study_time,
        "currentStreak": friend.current_streak,
        "online": !state.presence.online_friends(&[friend.id]).is_empty(),
        "lastSeen": state.presence.last_seen(friend.id),
        "recentSessions": recent_sessions,
    }))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AddFriendBody {
    #[validate(length(equal = 8, message = "Invite code must be 8 characters."))]
    invite_code: String,
}

/// Link two accounts through an invite code. Friendship is symmetric, both
/// directions are created atomically.
pub async fn add_friend(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    ValidJson(body): ValidJson<AddFriendBody>,
) -> Result<impl IntoResponse> {
    let code = body.invite_code.to_uppercase();
    let friend = state
        .users
        .repo
        .find_by_invite_code(&code)
        .await?
        .ok_or(ServerError::NotFound("user with this invite code"))?;

    if friend.id == user.id {
        return Err(ServerError::Conflict(
            "You cannot add yourself as a friend.".into(),
        ));
    }
    if state.users.repo.are_friends(user.id, friend.id).await? {
        return Err(ServerError::Conflict("This user is already your friend.".into()));
    }

    state.users.repo.add_friendship(user.id, friend.id).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Friend added.",
            "friend": friend_summary(&state, &friend).await?,
        })),
    ))
}

/// Unlink two accounts, removing both directions.
pub async fn remove_friend(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(friend_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    if !state.users.repo.are_friends(user.id, friend_id).await? {
        return Err(ServerError::NotFound("friend"));
    }

    state.users.repo.remove_friendship(user.id, friend_id).await?;

    Ok(Json(json!({ "message": "Friend removed." })))
}

/// Friends with their study stats and latest sessions.
pub async fn friends(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<impl IntoResponse> {
    let mut entries = Vec::new();
    for friend in state.users.repo.friends(user.id).await? {
        entries.push(friend_summary(&state, &friend).await?);
    }

    Ok(Json(json!({ "friends": entries })))
}

/// Profile view, restricted to the owner and their friends.
pub async fn profile(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    if user_id != user.id && !state.users.repo.are_friends(user.id, user_id).await? {
        return Err(ServerError::Forbidden(
            "You can only view profiles of your friends.".into(),
        ));
    }

    let target = state.users.repo.find_by_id(user_id).await?;
    let achievements = state.users.repo.achievements(user_id).await?;
    let recent_sessions = state
        .users
        .repo
        .recent_sessions(user_id, PROFILE_SESSIONS)
        .await?;

    Ok(Json(json!({
        "id": target.id,
        "username": target.username,
        "totalStudyTime": target.total_study_time,
        "weeklyStudyTime": target.weekly_study_time,
        "monthlyStudyTime": target.monthly_study_time,
        "currentStreak": target.current_streak,
        "achievements": achievements,
        "recentSessions": recent_sessions,
    })))
}
