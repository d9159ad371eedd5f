use std::convert::Infallible;

use tokio::sync::watch;
use warp::http::StatusCode;
use warp::Filter;

use super::room_websocket;
use crate::error::RoomError;
use crate::room::{Control, RoomHandle};

/// The room the API currently serves. Empty until the join completes.
#[derive(Clone)]
pub struct RoomSlot {
    rx: watch::Receiver<Option<RoomHandle>>,
}

impl RoomSlot {
    pub fn new() -> (Self, watch::Sender<Option<RoomHandle>>) {
        let (tx, rx) = watch::channel(None);
        (Self { rx }, tx)
    }

    pub fn ready(room: RoomHandle) -> Self {
        let (_, rx) = watch::channel(Some(room));
        Self { rx }
    }

    pub fn current(&self) -> Option<RoomHandle> {
        self.rx.borrow().clone()
    }
}

/// Rejection used while no room is joined yet
#[derive(Debug)]
pub struct RoomUnavailable;

impl warp::reject::Reject for RoomUnavailable {}

type JsonReply = warp::reply::WithStatus<warp::reply::Json>;

fn ok_json<T: serde::Serialize>(value: &T) -> JsonReply {
    warp::reply::with_status(warp::reply::json(value), StatusCode::OK)
}

pub(crate) fn error_reply(err: &RoomError) -> JsonReply {
    let status = match err {
        RoomError::SessionClosed => StatusCode::GONE,
        RoomError::Media(_) => StatusCode::CONFLICT,
        RoomError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "error": err.to_string() })),
        status,
    )
}

pub fn room_routes(
    slot: RoomSlot,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    room_health_check()
        .or(room_snapshot(slot.clone()))
        .or(room_toggle(slot.clone()))
        .or(room_leave(slot.clone()))
        .or(room_websocket_route(slot))
}

pub fn room_health_check() -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("room")
        .and(warp::path("health"))
        .and(warp::path::end())
        .and(warp::get())
        .map(|| {
            warp::reply::json(&serde_json::json!({
                "status": "healthy",
                "service": "Huddle Room",
                "version": env!("CARGO_PKG_VERSION")
            }))
        })
}

fn room_snapshot(
    slot: RoomSlot,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("room")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_room(slot))
        .and_then(|room: RoomHandle| async move {
            let reply = match room.snapshot().await {
                Ok(snapshot) => ok_json(&snapshot),
                Err(e) => error_reply(&e),
            };
            Ok::<_, Infallible>(reply)
        })
}

fn room_toggle(
    slot: RoomSlot,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("room" / "controls" / String)
        .and(warp::post())
        .and(with_room(slot))
        .and_then(|control: String, room: RoomHandle| async move {
            let Ok(control) = control.parse::<Control>() else {
                return Err(warp::reject::not_found());
            };
            let reply = match room.toggle(control).await {
                Ok(state) => ok_json(&state),
                Err(e) => error_reply(&e),
            };
            Ok(reply)
        })
}

fn room_leave(
    slot: RoomSlot,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("room" / "leave")
        .and(warp::post())
        .and(with_room(slot))
        .and_then(|room: RoomHandle| async move {
            let reply = match room.leave().await {
                Ok(report) => ok_json(&report),
                Err(e) => error_reply(&e),
            };
            Ok::<_, Infallible>(reply)
        })
}

fn room_websocket_route(
    slot: RoomSlot,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("room" / "ws")
        .and(warp::ws())
        .and(with_room(slot))
        .map(|ws: warp::ws::Ws, room: RoomHandle| {
            ws.on_upgrade(move |websocket| room_websocket::handle_room_websocket(websocket, room))
        })
}

fn with_room(
    slot: RoomSlot,
) -> impl Filter<Extract = (RoomHandle,), Error = warp::Rejection> + Clone {
    warp::any()
        .map(move || slot.current())
        .and_then(|room: Option<RoomHandle>| async move {
            room.ok_or_else(|| warp::reject::custom(RoomUnavailable))
        })
}

/// Maps rejections to JSON bodies
pub async fn handle_rejection(err: warp::Rejection) -> Result<JsonReply, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if err.find::<RoomUnavailable>().is_some() {
        (StatusCode::SERVICE_UNAVAILABLE, "Room not joined yet".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else if let Some(e) = err.find::<warp::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else {
        tracing::error!(rejection = ?err, "Unhandled rejection");
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "error": message })),
        status,
    ))
}
