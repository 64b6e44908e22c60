//! HTTP API surface.

pub mod auth;
pub mod study;
pub mod users;

use axum::extract::{FromRequest, Request, State};
use axum::http::header;
use axum::response::Response;
use axum::{Json, middleware};
use serde::de::DeserializeOwned;
use validator::Validate;

use crate::error::ServerError;
use crate::{AppState, user::User};

const BEARER: &str = "Bearer ";

/// JSON extractor running `validator` rules before the handler sees the body.
pub struct ValidJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Validate,
{
    type Rejection = ServerError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(ValidJson(value))
    }
}

/// Custom middleware for authentification.
///
/// Resolves the bearer token to a [`User`] and stores it on the request
/// extensions for downstream handlers.
pub async fn authorization(
    State(state): State<AppState>,
    mut req: Request,
    next: middleware::Next,
) -> Result<Response, ServerError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .ok_or(ServerError::Unauthorized)?;
    let token = token.strip_prefix(BEARER).unwrap_or(token);

    let claims = state.token.decode(token)?;
    let user = state
        .users
        .repo
        .find_by_id(claims.sub)
        .await
        .map_err(|_| ServerError::Unauthorized)?;

    req.extensions_mut().insert::<User>(user);
    Ok(next.run(req).await)
}

/// Register and verify an account through the API, returning its token and id.
#[cfg(test)]
pub(crate) async fn signup(
    app: &axum::Router,
    pool: &sqlx::PgPool,
    username: &str,
    email: &str,
) -> (String, uuid::Uuid) {
    use axum::http::StatusCode;
    use serde_json::json;

    let (status, body) = crate::make_request(
        app,
        "POST",
        "/auth/register",
        None,
        json!({"username": username, "email": email, "password": "sup3r-s3cret"}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let user_id: uuid::Uuid = body["userId"].as_str().unwrap().parse().unwrap();

    let otp: String = sqlx::query_scalar("SELECT otp FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await
        .unwrap();

    let (status, body) = crate::make_request(
        app,
        "POST",
        "/auth/verify-otp",
        None,
        json!({"userId": user_id, "otp": otp}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    (body["token"].as_str().unwrap().to_owned(), user_id)
}

/// Build an [`AppState`] against a test pool.
#[cfg(test)]
pub fn state(pool: sqlx::PgPool) -> AppState {
    use std::sync::Arc;

    use crate::{config, crypto, database, mail, presence, token, user};

    // Cheap Argon2 parameters: these hashes only live for one test.
    let argon = config::Argon2 {
        memory_cost: 1024,
        iterations: 1,
        parallelism: 1,
        hash_length: 32,
    };

    AppState {
        config: Arc::new(config::Configuration::default()),
        db: database::Database { postgres: pool.clone() },
        crypto: Arc::new(crypto::Crypto::new(Some(argon)).expect("bad argon2 parameters")),
        token: token::TokenManager::new("studyroom", "test-secret"),
        mail: mail::MailManager::default(),
        users: user::UserService::new(pool),
        presence: Arc::new(presence::PresenceTable::new()),
    }
}
