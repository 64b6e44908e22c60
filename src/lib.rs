//! Studyroom is a collaborative study-tracking server: a session ledger with
//! streaks and achievements, shared with friends in real time.

#[forbid(unsafe_code)]
#[deny(missing_docs, unused_mut)]
mod crypto;
mod database;
pub mod error;
mod mail;
mod presence;
mod router;
mod study;
mod token;
mod user;

pub mod config;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router, middleware as AxumMiddleware};
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};

/// MUST NEVER be used in production.
#[cfg(test)]
pub(crate) async fn make_request(
    app: &Router,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    use axum::body::Body;
    use axum::extract::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");

    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    let response = app
        .clone()
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };

    (status, body)
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub db: database::Database,
    pub crypto: Arc<crypto::Crypto>,
    pub token: token::TokenManager,
    pub mail: mail::MailManager,
    pub users: user::UserService,
    pub presence: Arc<presence::PresenceTable>,
}

async fn status() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let cors = if state.config.allowed_origins.is_empty() {
        CorsLayer::new().allow_origin(Any).allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_headers(Any)
            .vary([header::AUTHORIZATION])
    };

    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Set a timeout.
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(10)))
        // Remove sensitive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]))
        // Add CORS preflight support.
        .layer(cors.allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ]));

    let auth_router = Router::new()
        .route("/register", post(router::auth::register))
        .route("/verify-otp", post(router::auth::verify_otp))
        .route("/resend-otp", post(router::auth::resend_otp))
        .route("/login", post(router::auth::login))
        .route(
            "/me",
            get(router::auth::me).route_layer(AxumMiddleware::from_fn_with_state(
                state.clone(),
                router::authorization,
            )),
        );

    let study_router = Router::new()
        .route("/session/start", post(router::study::start_session))
        .route("/session/stop", post(router::study::stop_session))
        .route("/session/{id}", delete(router::study::delete_session))
        .route("/sessions", get(router::study::sessions))
        .route("/stats", get(router::study::stats))
        .route("/today", get(router::study::today))
        .route("/goal", put(router::study::update_goal))
        .route("/schedule", post(router::study::create_schedule))
        .route(
            "/schedule/{id}",
            put(router::study::update_schedule).delete(router::study::delete_schedule),
        )
        .route_layer(AxumMiddleware::from_fn_with_state(
            state.clone(),
            router::authorization,
        ));

    let users_router = Router::new()
        .route("/add-friend", post(router::users::add_friend))
        .route("/remove-friend/{id}", delete(router::users::remove_friend))
        .route("/friends", get(router::users::friends))
        .route("/profile/{id}", get(router::users::profile))
        .route_layer(AxumMiddleware::from_fn_with_state(
            state.clone(),
            router::authorization,
        ));

    Router::new()
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(status))
        // The live channel authenticates through its query string.
        .route("/ws", get(presence::handler))
        .nest("/auth", auth_router)
        .nest("/study", study_router)
        .nest("/users", users_router)
        .with_state(state)
        .layer(middleware)
}

/// Initialize the application state.
pub async fn initialize_state() -> Result<AppState, Box<dyn std::error::Error>> {
    // read configuration file. let it in memory.
    let config = config::Configuration::default().read();

    let db = match config.postgres {
        Some(ref config) => {
            database::Database::new(
                &config.address,
                &config
                    .username
                    .clone()
                    .unwrap_or(database::DEFAULT_CREDENTIALS.into()),
                &config
                    .password
                    .clone()
                    .unwrap_or(database::DEFAULT_CREDENTIALS.into()),
                &config
                    .database
                    .clone()
                    .unwrap_or(database::DEFAULT_DATABASE_NAME.into()),
                config.pool_size.unwrap_or(database::DEFAULT_POOL_SIZE),
            )
            .await?
        },
        None => {
            tracing::error!("missing `postgres` entry on `config.yaml` file");
            std::process::exit(0);
        },
    };

    // execute migrations scripts on start.
    sqlx::migrate!().run(&db.postgres).await?;

    let crypto = Arc::new(crypto::Crypto::new(config.argon2.clone())?);
    let token = token::TokenManager::new(&config.name, &config.token_secret());

    // handle mail sender.
    let mail = match &config.mail {
        Some(cfg) => mail::MailManager::new(cfg)?,
        None => {
            tracing::warn!("missing `mail` entry on `config.yaml` file, mails are dropped");
            mail::MailManager::default()
        },
    };

    let users = user::UserService::new(db.postgres.clone());

    Ok(AppState {
        config,
        db,
        crypto,
        token,
        mail,
        users,
        presence: Arc::new(presence::PresenceTable::new()),
    })
}
