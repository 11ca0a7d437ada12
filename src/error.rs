use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Unauthorized(UnauthorizedType),

    #[error("You have no permission to access this resource")]
    Forbidden,

    #[error("{0}")]
    InvalidState(&'static str),

    #[error("cannot change status from {current} to {requested}, expected {expected}")]
    InvalidTransition {
        current: &'static str,
        expected: &'static str,
        requested: String,
    },

    #[error("{0}")]
    InvalidOperation(&'static str),

    #[error("{0} was already processed by another request")]
    AlreadyProcessed(&'static str),

    #[error("{0}")]
    Conflict(String),

    #[error("payment not succeeded, current status is {status}")]
    PaymentNotSucceeded { status: String },

    #[error("amount mismatch, expected {expected} but got {got}")]
    AmountMismatch { expected: i64, got: i64 },

    #[error("{0}")]
    DatabaseError(#[from] mongodb::error::Error),

    #[error("{0}")]
    JWTError(#[from] jsonwebtoken::errors::Error),

    #[error("{0}")]
    BSONSerError(#[from] bson::ser::Error),

    #[error("payment gateway error: {0}")]
    GatewayError(#[from] reqwest::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum UnauthorizedType {
    #[error("Missing authorization token")]
    MissingToken,

    #[error("Invalid access token")]
    InvalidAccessToken,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorJson {
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
    r#type: String,
    message: String,
}

impl From<Error> for ErrorJson {
    fn from(err: Error) -> Self {
        let message = err.to_string();

        let r#type = err.to_string_variant();

        let details = match &err {
            Error::ValidationError(err) => serde_json::to_value(err).ok(),
            Error::InvalidTransition {
                current,
                expected,
                requested,
            } => Some(serde_json::json!({
                "current": current,
                "expected": expected,
                "requested": requested,
            })),
            Error::PaymentNotSucceeded { status } => {
                Some(serde_json::json!({ "status": status }))
            }
            Error::AmountMismatch { expected, got } => Some(serde_json::json!({
                "expected": expected,
                "got": got,
            })),
            Error::NotFound(..)
            | Error::InvalidArgument(..)
            | Error::Unauthorized(..)
            | Error::Forbidden
            | Error::InvalidState(..)
            | Error::InvalidOperation(..)
            | Error::AlreadyProcessed(..)
            | Error::Conflict(..)
            | Error::DatabaseError(..)
            | Error::JWTError(..)
            | Error::BSONSerError(..)
            | Error::GatewayError(..) => None,
        };

        Self {
            details,
            message,
            r#type,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        tracing::error!("error: {:?}", self);
        let status = match self {
            Self::Unauthorized(..) => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(..) => StatusCode::NOT_FOUND,
            Self::ValidationError(..) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidArgument(..)
            | Self::InvalidOperation(..)
            | Self::PaymentNotSucceeded { .. }
            | Self::AmountMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::InvalidState(..)
            | Self::InvalidTransition { .. }
            | Self::AlreadyProcessed(..)
            | Self::Conflict(..) => StatusCode::CONFLICT,
            Self::DatabaseError(..) | Self::JWTError(..) | Self::BSONSerError(..) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::GatewayError(..) => StatusCode::BAD_GATEWAY,
        };

        let error = ErrorJson::from(self);

        (status, Json(error)).into_response()
    }
}

impl Error {
    pub fn to_string_variant(&self) -> String {
        macro_rules! match_var {
            ($id:ident !) => {
                Self::$id
            };
            ($id:ident (..)) => {
                Self::$id(..)
            };
            ($id:ident {..}) => {
                Self::$id { .. }
            };
        }

        macro_rules! variant {
            ($($name:ident $tt:tt),+) => {
                match self {
                    $(
                        match_var!($name $tt) => {
                            stringify!($name)
                       }
                    )+
                }
            };
        }

        variant! {
            ValidationError(..),
            NotFound(..),
            InvalidArgument(..),
            Unauthorized(..),
            Forbidden!,
            InvalidState(..),
            InvalidTransition {..},
            InvalidOperation(..),
            AlreadyProcessed(..),
            Conflict(..),
            PaymentNotSucceeded {..},
            AmountMismatch {..},
            DatabaseError(..),
            JWTError(..),
            BSONSerError(..),
            GatewayError(..)
        }
        .to_string()
    }
}

impl From<axum::extract::rejection::PathRejection> for Error {
    fn from(_value: axum::extract::rejection::PathRejection) -> Self {
        Self::InvalidArgument("malformed path parameter".to_string())
    }
}
