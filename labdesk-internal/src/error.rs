use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};

use crate::usage_limit::ResourceKind;

#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We box `ErrorDetails` per the `clippy::result_large_err` lint
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    pub fn log(&self) {
        self.0.log();
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    AppState {
        message: String,
    },
    BackendConnection {
        message: String,
    },
    /// A read against the hosted backend failed or returned something unusable.
    BackendQuery {
        target: String,
        status_code: Option<StatusCode>,
        message: String,
    },
    Config {
        message: String,
    },
    InternalError {
        message: String,
    },
    InvalidTenantId {
        raw_tenant_id: String,
    },
    NotificationDelivery {
        message: String,
    },
    NotificationStore {
        message: String,
    },
    Observability {
        message: String,
    },
    Serialization {
        message: String,
    },
    UnknownResource {
        name: String,
    },
    UsageLimitExceeded {
        resource: ResourceKind,
        current: u64,
        limit: u64,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::AppState { .. } => tracing::Level::ERROR,
            ErrorDetails::BackendConnection { .. } => tracing::Level::ERROR,
            ErrorDetails::BackendQuery { .. } => tracing::Level::WARN,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidTenantId { .. } => tracing::Level::WARN,
            ErrorDetails::NotificationDelivery { .. } => tracing::Level::WARN,
            ErrorDetails::NotificationStore { .. } => tracing::Level::WARN,
            ErrorDetails::Observability { .. } => tracing::Level::ERROR,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            ErrorDetails::UnknownResource { .. } => tracing::Level::WARN,
            ErrorDetails::UsageLimitExceeded { .. } => tracing::Level::INFO,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::AppState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::BackendConnection { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::BackendQuery { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InvalidTenantId { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::NotificationDelivery { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::NotificationStore { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Observability { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::UnknownResource { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::UsageLimitExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::AppState { message } => {
                write!(f, "Error initializing AppState: {message}")
            }
            ErrorDetails::BackendConnection { message } => {
                write!(f, "Error connecting to backend: {message}")
            }
            ErrorDetails::BackendQuery {
                target,
                status_code,
                message,
            } => match status_code {
                Some(status_code) => write!(
                    f,
                    "Backend query on `{target}` failed with status {status_code}: {message}"
                ),
                None => write!(f, "Backend query on `{target}` failed: {message}"),
            },
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::InternalError { message } => write!(f, "Internal error: {message}"),
            ErrorDetails::InvalidTenantId { raw_tenant_id } => {
                write!(f, "Invalid tenant id: `{raw_tenant_id}`")
            }
            ErrorDetails::NotificationDelivery { message } => {
                write!(f, "Failed to deliver notification: {message}")
            }
            ErrorDetails::NotificationStore { message } => {
                write!(f, "Notification store error: {message}")
            }
            ErrorDetails::Observability { message } => write!(f, "{message}"),
            ErrorDetails::Serialization { message } => write!(f, "{message}"),
            ErrorDetails::UnknownResource { name } => {
                write!(f, "Unknown metered resource: `{name}`")
            }
            ErrorDetails::UsageLimitExceeded {
                resource,
                current,
                limit,
            } => write!(
                f,
                "Usage limit reached for {}: {current} of {limit} used",
                resource.label()
            ),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Get the JSON response body that would be sent to clients
    pub fn to_response_json(&self) -> (StatusCode, Value) {
        match self.get_details() {
            ErrorDetails::UsageLimitExceeded { resource, .. } => (
                self.status_code(),
                json!({
                    "error": {
                        "message": format!("Usage quota exceeded: {self}"),
                        "type": "insufficient_quota",
                        "resource": resource,
                        "code": self.status_code().as_u16(),
                    }
                }),
            ),
            _ => (self.status_code(), json!({"error": self.to_string()})),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status_code, body) = self.to_response_json();
        (status_code, Json(body)).into_response()
    }
}
