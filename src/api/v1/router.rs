use super::error::*;
use super::handler;
use crate::api::v1::handler::CatchUpQuery;
use crate::application_port::Authenticator;
use crate::domain_model::UserId;
use crate::server::*;
use std::convert::Infallible;
use std::sync::Arc;
use warp::{Filter, http, reject};

pub fn routes(
    server: Arc<Server>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let catch_up = warp::get()
        .and(warp::path("catch_up"))
        .and(warp::path::end())
        .and(warp::query::<CatchUpQuery>())
        .and(with_verification(server.authenticator.clone()))
        .and(with(server.conversation_service.clone()))
        .and_then(handler::catch_up);

    let mark_read = warp::post()
        .and(warp::path("read_marker"))
        .and(warp::path::end())
        .and(warp::body::json())
        .and(with_verification(server.authenticator.clone()))
        .and(with(server.conversation_service.clone()))
        .and_then(handler::mark_read);

    let chat = warp::get()
        .and(warp::path("chat"))
        .and(warp::path::end())
        .and(with_verification(server.authenticator.clone()))
        .and(warp::ws())
        .and(with(server.connection_acceptor.clone()))
        .map(
            |user_id: UserId, ws: warp::ws::Ws, connection_acceptor: Arc<dyn ConnectionAcceptor>| {
                ws.on_upgrade(move |socket| {
                    handler::join_chat(socket, user_id, connection_acceptor)
                })
            },
        );

    catch_up.or(mark_read).or(chat)
}

fn with<ServiceType>(
    service: Arc<ServiceType>,
) -> impl Filter<Extract = (Arc<ServiceType>,), Error = Infallible> + Clone
where
    ServiceType: Send + Sync + ?Sized,
{
    warp::any().map(move || service.clone())
}

fn with_verification(
    authenticator: Arc<dyn Authenticator>,
) -> impl Filter<Extract = (UserId,), Error = warp::Rejection> + Clone {
    warp::header::<String>(http::header::AUTHORIZATION.as_ref()).and_then(move |token: String| {
        let authenticator = authenticator.clone();
        async move {
            if let Some(token) = token.strip_prefix("Bearer ") {
                let user_id = authenticator
                    .verify_token(token)
                    .await
                    .map_err(ApiErrorCode::from)
                    .map_err(reject::custom)?;
                Ok(user_id)
            } else {
                Err(reject::custom(ApiErrorCode::InvalidToken))
            }
        }
    })
}
