use crate::api::v1::handler::ApiResponse;
use crate::application_port::*;
use serde::Serialize;
use std::convert::Infallible;
use thiserror::Error;
use tracing::warn;
use warp::http::StatusCode;
use warp::{Rejection, reject};

pub async fn recover_error(err: Rejection) -> Result<impl warp::Reply, Infallible> {
    if let Some(err) = err.find::<ApiErrorCode>() {
        let json = warp::reply::json(&ApiResponse::<()>::err(err.clone(), err.to_string()));
        Ok(warp::reply::with_status(json, StatusCode::OK))
    } else {
        let json = warp::reply::json(&ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(ApiError {
                code: ApiErrorCode::InternalError,
                message: format!("Unhandled error: {:?}", err),
            }),
        });
        Ok(warp::reply::with_status(
            json,
            StatusCode::INTERNAL_SERVER_ERROR,
        ))
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Error, Serialize)]
pub enum ApiErrorCode {
    #[error("Message not found")]
    MessageNotFound,
    #[error("Not a member of this conversation")]
    Forbidden,
    #[error("Edit/recall window has expired")]
    WindowExpired,
    #[error("Message already recalled")]
    AlreadyRecalled,
    #[error("Token is not valid")]
    InvalidToken,
    #[error("Internal error")]
    InternalError,
}

impl ApiErrorCode {
    pub fn internal<E: std::fmt::Display>(error: E) -> ApiErrorCode {
        warn!("Internal error: {}", error);
        ApiErrorCode::InternalError
    }
}

impl reject::Reject for ApiErrorCode {}

impl From<ChatError> for ApiErrorCode {
    fn from(error: ChatError) -> Self {
        match error {
            ChatError::MessageNotFound => ApiErrorCode::MessageNotFound,
            ChatError::NotMember | ChatError::NotAuthor => ApiErrorCode::Forbidden,
            ChatError::WindowExpired => ApiErrorCode::WindowExpired,
            ChatError::AlreadyRecalled => ApiErrorCode::AlreadyRecalled,
            ChatError::Store(e) => ApiErrorCode::internal(e),
        }
    }
}

impl From<AuthError> for ApiErrorCode {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::InvalidToken => ApiErrorCode::InvalidToken,
            AuthError::InternalError(e) => ApiErrorCode::internal(e),
        }
    }
}
