//! Routes to create and access accounts.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;
use validator::{Validate, ValidationError, ValidationErrors};

use super::ValidJson;
use crate::error::{Result, ServerError};
use crate::mail::{OTP_VALIDITY_MINUTES, Template};
use crate::user::{Achievement, User};
use crate::{AppState, crypto};

/// Sessions returned on the `/auth/me` payload.
const ME_SESSIONS: i64 = 20;

/// Account payload returned to its owner.
#[derive(Debug, Serialize)]
pub struct Profile {
    #[serde(flatten)]
    pub user: User,
    pub achievements: Vec<Achievement>,
}

async fn profile(state: &AppState, user: User) -> Result<Profile> {
    let achievements = state.users.repo.achievements(user.id).await?;

    Ok(Profile { user, achievements })
}

fn invalid_otp(message: &'static str) -> ServerError {
    let mut errors = ValidationErrors::new();
    errors.add("otp", ValidationError::new("invalid_otp").with_message(message.into()));
    errors.into()
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBody {
    #[validate(length(min = 3, max = 20, message = "Username must be 3 to 20 characters."))]
    username: String,
    #[validate(email(message = "Invalid email address."))]
    email: String,
    #[validate(length(min = 6, message = "Password must be at least 6 characters."))]
    password: String,
}

/// Create a new account and send its email-verification code.
///
/// When the code cannot be delivered the account is removed again; an
/// unverifiable account would otherwise hold the email hostage.
pub async fn register(
    State(state): State<AppState>,
    ValidJson(body): ValidJson<RegisterBody>,
) -> Result<impl IntoResponse> {
    if state.users.repo.find_by_email(&body.email).await?.is_some() {
        return Err(ServerError::Conflict(
            "User with this email already exists.".into(),
        ));
    }
    if state
        .users
        .repo
        .find_by_username(&body.username)
        .await?
        .is_some()
    {
        return Err(ServerError::Conflict("This username is already taken.".into()));
    }

    // Collisions are rare on 4 random bytes; retry until free.
    let invite_code = loop {
        let candidate = crypto::generate_invite_code();
        if state
            .users
            .repo
            .find_by_invite_code(&candidate)
            .await?
            .is_none()
        {
            break candidate;
        }
    };

    let password = state
        .crypto
        .pwd
        .hash_password(&body.password)
        .map_err(|err| ServerError::Internal {
            details: "password hashing failed".into(),
            source: Some(Box::new(err)),
        })?;

    let otp = crypto::generate_otp();
    let user = User {
        username: body.username,
        email: body.email,
        password,
        invite_code,
        otp: Some(otp.clone()),
        otp_expires_at: Some(Utc::now() + Duration::minutes(OTP_VALIDITY_MINUTES)),
        ..Default::default()
    };

    state.users.repo.insert(&user).await?;

    if let Err(err) = state
        .mail
        .send(Template::EmailVerification { code: otp }, &user.email, &user.username)
        .await
    {
        tracing::error!(error = %err, "verification mail failed, rolling back registration");
        state.users.repo.delete(user.id).await?;

        return Err(ServerError::Dependency(
            "Could not send the verification email, please try again later.".into(),
        ));
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Registration successful. Please check your email for the verification code.",
            "userId": user.id,
            "email": user.email,
        })),
    ))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOtpBody {
    user_id: Uuid,
    #[validate(length(equal = 6, message = "Code must be 6 digits."))]
    otp: String,
}

/// Activate an account with its one-time code and log it in.
pub async fn verify_otp(
    State(state): State<AppState>,
    ValidJson(body): ValidJson<VerifyOtpBody>,
) -> Result<impl IntoResponse> {
    let mut user = state.users.repo.find_by_id(body.user_id).await?;

    if user.is_email_verified {
        return Err(ServerError::Conflict("Email is already verified.".into()));
    }
    if user.otp.as_deref() != Some(body.otp.as_str()) {
        return Err(invalid_otp("Invalid verification code."));
    }
    if !user.otp_expires_at.is_some_and(|expiry| expiry > Utc::now()) {
        return Err(invalid_otp("Verification code has expired."));
    }

    state.users.repo.mark_verified(user.id).await?;
    user.is_email_verified = true;
    user.otp = None;
    user.otp_expires_at = None;

    let token = state.token.create(user.id)?;

    Ok(Json(json!({
        "token": token,
        "user": profile(&state, user).await?,
    })))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ResendOtpBody {
    user_id: Uuid,
}

/// Reissue the email-verification code for an unverified account.
pub async fn resend_otp(
    State(state): State<AppState>,
    ValidJson(body): ValidJson<ResendOtpBody>,
) -> Result<impl IntoResponse> {
    let user = state.users.repo.find_by_id(body.user_id).await?;

    if user.is_email_verified {
        return Err(ServerError::Conflict("Email is already verified.".into()));
    }

    let otp = crypto::generate_otp();
    state
        .users
        .repo
        .set_otp(
            user.id,
            &otp,
            Utc::now() + Duration::minutes(OTP_VALIDITY_MINUTES),
        )
        .await?;

    state
        .mail
        .send(Template::EmailVerification { code: otp }, &user.email, &user.username)
        .await?;

    Ok(Json(json!({
        "message": "A new verification code has been sent to your email.",
    })))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LoginBody {
    #[validate(email(message = "Invalid email address."))]
    email: String,
    #[validate(length(min = 1, message = "Password is required."))]
    password: String,
}

/// Log a verified account in.
///
/// Unknown emails and wrong passwords get the same answer; an unverified
/// account is told how to resume verification instead.
pub async fn login(
    State(state): State<AppState>,
    ValidJson(body): ValidJson<LoginBody>,
) -> Result<impl IntoResponse> {
    let user = state
        .users
        .repo
        .find_by_email(&body.email)
        .await?
        .ok_or(ServerError::InvalidCredentials)?;

    if state
        .crypto
        .pwd
        .verify_password(&body.password, &user.password)
        .is_err()
    {
        return Err(ServerError::InvalidCredentials);
    }

    if !user.is_email_verified {
        return Err(ServerError::NeedsVerification { user_id: user.id });
    }

    let token = state.token.create(user.id)?;

    Ok(Json(json!({
        "token": token,
        "user": profile(&state, user).await?,
    })))
}

/// Current account with its recent activity.
pub async fn me(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<impl IntoResponse> {
    let recent_sessions = state.users.repo.recent_sessions(user.id, ME_SESSIONS).await?;
    let schedules = state.users.repo.schedules(user.id).await?;

    Ok(Json(json!({
        "user": profile(&state, user).await?,
        "recentSessions": recent_sessions,
        "schedules": schedules,
    })))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::{app, make_request, router};

    async fn register_user(
        app: &axum::Router,
        username: &str,
        email: &str,
    ) -> serde_json::Value {
        let (status, body) = make_request(
            app,
            "POST",
            "/auth/register",
            None,
            json!({
                "username": username,
                "email": email,
                "password": "sup3r-s3cret",
            }),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        body
    }

    async fn stored_otp(pool: &sqlx::PgPool, email: &str) -> String {
        sqlx::query_scalar("SELECT otp FROM users WHERE email = $1")
            .bind(email)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[sqlx::test]
    async fn test_register_verify_login(pool: sqlx::PgPool) {
        let app = app(router::state(pool.clone()));

        let body = register_user(&app, "alice", "alice@example.com").await;
        let user_id = body["userId"].as_str().unwrap().to_owned();

        // Login before verification resumes the OTP flow.
        let (status, body) = make_request(
            &app,
            "POST",
            "/auth/login",
            None,
            json!({"email": "alice@example.com", "password": "sup3r-s3cret"}),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["needsVerification"], json!(true));
        assert_eq!(body["userId"], json!(user_id));

        let otp = stored_otp(&pool, "alice@example.com").await;
        let (status, body) = make_request(
            &app,
            "POST",
            "/auth/verify-otp",
            None,
            json!({"userId": user_id, "otp": otp}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["isEmailVerified"], json!(true));
        assert_eq!(body["user"]["inviteCode"].as_str().unwrap().len(), 8);

        let (status, body) = make_request(
            &app,
            "POST",
            "/auth/login",
            None,
            json!({"email": "alice@example.com", "password": "sup3r-s3cret"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let token = body["token"].as_str().unwrap().to_owned();
        let (status, body) = make_request(&app, "GET", "/auth/me", Some(&token), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["username"], json!("alice"));
        assert_eq!(body["recentSessions"], json!([]));
    }

    #[sqlx::test]
    async fn test_register_duplicate_email(pool: sqlx::PgPool) {
        let app = app(router::state(pool));

        register_user(&app, "alice", "alice@example.com").await;

        let (status, _) = make_request(
            &app,
            "POST",
            "/auth/register",
            None,
            json!({
                "username": "alice2",
                "email": "alice@example.com",
                "password": "sup3r-s3cret",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[sqlx::test]
    async fn test_verify_rejects_wrong_and_expired_codes(pool: sqlx::PgPool) {
        let app = app(router::state(pool.clone()));

        let body = register_user(&app, "bob", "bob@example.com").await;
        let user_id = body["userId"].as_str().unwrap().to_owned();
        let otp = stored_otp(&pool, "bob@example.com").await;

        let wrong = if otp == "000000" { "000001" } else { "000000" };
        let (status, _) = make_request(
            &app,
            "POST",
            "/auth/verify-otp",
            None,
            json!({"userId": user_id, "otp": wrong}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        sqlx::query("UPDATE users SET otp_expires_at = NOW() - INTERVAL '1 hour' WHERE email = $1")
            .bind("bob@example.com")
            .execute(&pool)
            .await
            .unwrap();

        let (status, _) = make_request(
            &app,
            "POST",
            "/auth/verify-otp",
            None,
            json!({"userId": user_id, "otp": otp}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[sqlx::test]
    async fn test_resend_otp_reissues_code(pool: sqlx::PgPool) {
        let app = app(router::state(pool.clone()));

        let body = register_user(&app, "dave", "dave@example.com").await;
        let user_id = body["userId"].as_str().unwrap().to_owned();

        let (old_otp, old_expiry): (String, chrono::DateTime<chrono::Utc>) =
            sqlx::query_as("SELECT otp, otp_expires_at FROM users WHERE email = $1")
                .bind("dave@example.com")
                .fetch_one(&pool)
                .await
                .unwrap();

        let (status, _) = make_request(
            &app,
            "POST",
            "/auth/resend-otp",
            None,
            json!({"userId": user_id}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (new_otp, new_expiry): (String, chrono::DateTime<chrono::Utc>) =
            sqlx::query_as("SELECT otp, otp_expires_at FROM users WHERE email = $1")
                .bind("dave@example.com")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(new_expiry > old_expiry || new_otp != old_otp);

        // The reissued code verifies; a verified account cannot resend.
        let (status, _) = make_request(
            &app,
            "POST",
            "/auth/verify-otp",
            None,
            json!({"userId": user_id, "otp": new_otp}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = make_request(
            &app,
            "POST",
            "/auth/resend-otp",
            None,
            json!({"userId": user_id}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[sqlx::test]
    async fn test_login_wrong_password(pool: sqlx::PgPool) {
        let app = app(router::state(pool.clone()));

        register_user(&app, "carol", "carol@example.com").await;

        let (status, _) = make_request(
            &app,
            "POST",
            "/auth/login",
            None,
            json!({"email": "carol@example.com", "password": "not-the-one"}),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = make_request(
            &app,
            "POST",
            "/auth/login",
            None,
            json!({"email": "nobody@example.com", "password": "whatever"}),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[sqlx::test]
    async fn test_me_requires_token(pool: sqlx::PgPool) {
        let app = app(router::state(pool));

        let (status, _) = make_request(&app, "GET", "/auth/me", None, json!({})).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) =
            make_request(&app, "GET", "/auth/me", Some("not-a-token"), json!({})).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
