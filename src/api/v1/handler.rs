use super::error::*;
use crate::application_port::ConversationService;
use crate::domain_model::*;
use crate::server::ConnectionAcceptor;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use warp::{self, reject};

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(code: ApiErrorCode, message: impl Into<String>) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(ApiError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CatchUpQuery {
    pub peer_kind: PeerKind,
    pub peer_id: uuid::Uuid,
    /// Sequence cursor; 0 fetches from the beginning of the log.
    pub after: u64,
    pub limit: Option<u32>,
}

/// Offline recovery: everything after the client's cursor, oldest first.
/// The client repeats with the last sequence of each page until it comes
/// back empty or reaches `max_sequence`.
pub async fn catch_up(
    query: CatchUpQuery,
    user_id: UserId,
    conversation_service: Arc<dyn ConversationService>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let to = ConversationKey {
        kind: query.peer_kind,
        peer_id: query.peer_id,
    };

    let page = conversation_service
        .catch_up(user_id, to, SequenceNumber(query.after), query.limit)
        .await
        .map_err(ApiErrorCode::from)
        .map_err(reject::custom)?;

    Ok(warp::reply::json(&ApiResponse::ok(page)))
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    pub peer_kind: PeerKind,
    pub peer_id: uuid::Uuid,
    pub up_to: u64,
}

#[derive(Debug, Serialize)]
pub struct MarkReadResponse;

pub async fn mark_read(
    body: MarkReadRequest,
    user_id: UserId,
    conversation_service: Arc<dyn ConversationService>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let to = ConversationKey {
        kind: body.peer_kind,
        peer_id: body.peer_id,
    };

    conversation_service
        .mark_read(user_id, to, SequenceNumber(body.up_to))
        .await
        .map_err(ApiErrorCode::from)
        .map_err(reject::custom)?;

    Ok(warp::reply::json(&ApiResponse::ok(MarkReadResponse)))
}

pub async fn join_chat(
    socket: warp::ws::WebSocket,
    user_id: UserId,
    connection_acceptor: Arc<dyn ConnectionAcceptor>,
) {
    let (s2c, c2s) = socket.split();
    if let Err(e) = connection_acceptor
        .accept_connection(Box::new(s2c), Box::new(c2s), user_id)
        .await
    {
        tracing::error!("accepting connection: {}", e);
    }
}
