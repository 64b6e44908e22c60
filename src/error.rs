//! Error handler for studyroom.

use axum::extract::rejection::JsonRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use sqlx::Error as SQLxError;
use thiserror::Error;
use uuid::Uuid;
use validator::ValidationErrors;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Enum representing server-side errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("validation error occurred")]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Axum(#[from] JsonRejection),

    #[error("SQL request failed: {0}")]
    Sql(#[from] SQLxError),

    #[error("invalid 'Authorization' header")]
    Unauthorized,

    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("{0}")]
    Forbidden(String),

    #[error("email address is not verified")]
    NeedsVerification { user_id: Uuid },

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Dependency(String),

    #[error("internal server error, {details}")]
    Internal {
        details: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Structure for detailed error responses.
#[derive(Debug, Serialize)]
pub struct ResponseError {
    r#type: Option<String>,
    title: String,
    status: u16,
    detail: String,
    instance: Option<String>,
    errors: Option<Vec<FieldError>>,
    #[serde(rename = "needsVerification", skip_serializing_if = "Option::is_none")]
    needs_verification: Option<bool>,
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    user_id: Option<Uuid>,
}

impl ResponseError {
    /// Update error status code.
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code.as_u16();
        self
    }

    /// Update `title` field.
    pub fn title(mut self, title: &str) -> Self {
        self.title = title.into();
        self
    }

    /// Add detailed error.
    pub fn details(mut self, description: &str) -> Self {
        self.detail = description.into();
        self
    }

    /// Automatically add errors field.
    pub fn errors(mut self, errors: &ValidationErrors) -> Self {
        self.errors = Some(parse_validation_errors(errors));
        self
    }

    /// Mark the response as a resumable email-verification failure.
    pub fn needs_verification(mut self, user_id: Uuid) -> Self {
        self.needs_verification = Some(true);
        self.user_id = Some(user_id);
        self
    }

    /// Transform [`ResponseError`] into axum [`Response`].
    pub fn into_response(self) -> std::result::Result<Response, axum::http::Error> {
        if let Ok(body) = serde_json::to_string(&self) {
            Response::builder()
                .status(self.status)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.into())
        } else {
            Ok(internal_server_error())
        }
    }
}

impl Default for ResponseError {
    fn default() -> Self {
        Self {
            r#type: None,
            title: "Internal server error.".to_owned(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            detail: String::default(),
            instance: None,
            errors: None,
            needs_verification: None,
            user_id: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct FieldError {
    field: String,
    message: String,
}

fn parse_validation_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, issues)| {
            issues.iter().map(move |issue| FieldError {
                field: field.to_string(),
                message: issue.to_string(),
            })
        })
        .collect()
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let response = ResponseError::default()
            .title("There were validation errors with your request.")
            .details(&self.to_string())
            .status(StatusCode::BAD_REQUEST);

        let response = match &self {
            ServerError::Validation(validation_errors) => response.errors(validation_errors),

            ServerError::Sql(SQLxError::RowNotFound) => response
                .title("Resource not found.")
                .status(StatusCode::NOT_FOUND),

            // Two writers racing past a find-then-insert check; the unique
            // index is the source of truth.
            ServerError::Sql(SQLxError::Database(err)) if err.is_unique_violation() => response
                .title("Request conflicts with the current state.")
                .details("This value is already taken.")
                .status(StatusCode::CONFLICT),

            ServerError::Sql(err) => {
                tracing::error!(err = %err, "SQL request failed");
                ResponseError::default()
            },

            ServerError::Unauthorized => response
                .title("Missing or invalid 'Authorization' header.")
                .status(StatusCode::UNAUTHORIZED),

            ServerError::InvalidCredentials => response
                .title("Invalid email or password.")
                .status(StatusCode::UNAUTHORIZED),

            ServerError::Forbidden(detail) => response
                .title("Access denied.")
                .details(detail)
                .status(StatusCode::FORBIDDEN),

            ServerError::NeedsVerification { user_id } => response
                .title("Email address is not verified.")
                .status(StatusCode::FORBIDDEN)
                .needs_verification(*user_id),

            ServerError::NotFound(_) => response
                .title("Resource not found.")
                .status(StatusCode::NOT_FOUND),

            ServerError::Conflict(_) => response
                .title("Request conflicts with the current state.")
                .status(StatusCode::CONFLICT),

            ServerError::Dependency(_) => response
                .title("A required external service is unavailable.")
                .status(StatusCode::BAD_GATEWAY),

            ServerError::Internal { details, source } => {
                tracing::error!(err = ?source, %details, "server returned 500 status");

                ResponseError::default()
            },

            _ => response,
        };

        response
            .into_response()
            .unwrap_or_else(|_| internal_server_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Handlers hold errors across await points; the whole enum must stay
    // thread-safe or axum's `Handler` bound fails.
    #[test]
    fn test_server_error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ServerError>();
    }

    #[sqlx::test]
    async fn test_unique_violation_maps_to_conflict(pool: sqlx::PgPool) {
        use crate::user::{User, UserRepository};

        let repo = UserRepository::new(pool);
        repo.insert(&User {
            username: "alice".into(),
            email: "alice@example.com".into(),
            invite_code: "ABCD1234".into(),
            ..Default::default()
        })
        .await
        .unwrap();

        // Same username, fresh email and code: only the unique index trips.
        let err = repo
            .insert(&User {
                username: "alice".into(),
                email: "other@example.com".into(),
                invite_code: "DCBA4321".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }
}

fn internal_server_error() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(
            serde_json::json!({
                "type": null,
                "title": "Internal server error.",
                "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                "detail": null,
                "instance": null,
                "errors": null,
            })
            .to_string()
            .into(),
        )
        .unwrap_or_else(|_| Response::new("Internal server error".into()))
}
