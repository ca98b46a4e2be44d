use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

use crate::repository::DirectoryError;
use crate::services::StreamServiceError;
use crate::streaming::{PreviewError, SupervisorError};
use crate::websocket::RegistryError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Already running, or nothing to encode
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal server error")]
    Internal,
}

impl AppError {
    /// Message safe to hand to the client
    fn public_message(&self) -> String {
        match self {
            AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg)
            | AppError::ServiceUnavailable(msg) => msg.clone(),
            AppError::Database(_) | AppError::Internal => "internal server error".to_string(),
            AppError::Config(_) | AppError::StartServer(_) => self.to_string(),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Config(_)
            | AppError::StartServer(_)
            | AppError::Database(_)
            | AppError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if self.status_code().is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        HttpResponse::build(self.status_code()).json(json!({ "error": self.public_message() }))
    }
}

impl From<DirectoryError> for AppError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::ChannelNotFound(id) => AppError::NotFound(format!("channel {id}")),
            DirectoryError::Database(e) => AppError::Database(e.to_string()),
        }
    }
}

impl From<SupervisorError> for AppError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::AlreadyRunning(_)
            | SupervisorError::NoActiveSource(_)
            | SupervisorError::Stopping(_) => AppError::Conflict(e.to_string()),
            SupervisorError::ReservedChannel(_) => AppError::BadRequest(e.to_string()),
            SupervisorError::NotRunning(_) => AppError::NotFound(e.to_string()),
            SupervisorError::Spawn(_) => AppError::ServiceUnavailable(e.to_string()),
        }
    }
}

impl From<PreviewError> for AppError {
    fn from(e: PreviewError) -> Self {
        AppError::ServiceUnavailable(e.to_string())
    }
}

impl From<StreamServiceError> for AppError {
    fn from(e: StreamServiceError) -> Self {
        match e {
            StreamServiceError::ChannelNotFound(_) | StreamServiceError::NoPreviewSource(_) => {
                AppError::NotFound(e.to_string())
            }
            StreamServiceError::MissingIdentifier => AppError::BadRequest(e.to_string()),
            StreamServiceError::Supervisor(e) => e.into(),
            StreamServiceError::Directory(e) => e.into(),
        }
    }
}

impl From<RegistryError> for AppError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownScenario(_) => AppError::NotFound(e.to_string()),
            RegistryError::MissingIdentifier | RegistryError::ReservedChannel(_) => {
                AppError::BadRequest(e.to_string())
            }
            RegistryError::Lookup(e) => e.into(),
            RegistryError::Bus(e) => AppError::ServiceUnavailable(e.to_string()),
        }
    }
}
