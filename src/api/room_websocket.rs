use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use warp::ws::{Message, WebSocket};

use crate::room::{Control, RoomHandle, RoomSnapshot, ViewEvent};

/// Frames pushed to a room observer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomFeed {
    Snapshot { snapshot: RoomSnapshot },
    Event { event: ViewEvent },
    Lagged { missed: u64 },
    Error { message: String },
}

/// Frames accepted from a room observer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomRequest {
    Toggle { control: Control },
    Leave,
    Snapshot,
}

fn frame(feed: &RoomFeed) -> Option<Message> {
    match serde_json::to_string(feed) {
        Ok(text) => Some(Message::text(text)),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize room feed");
            None
        }
    }
}

pub async fn handle_room_websocket(websocket: WebSocket, room: RoomHandle) {
    tracing::info!(uid = %room.local_uid(), "Room observer connected");

    let (mut ws_sender, mut ws_receiver) = websocket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Subscribe before the snapshot so nothing falls between the two
    let view = room.subscribe_view();

    match room.snapshot().await {
        Ok(snapshot) => {
            if let Some(message) = frame(&RoomFeed::Snapshot { snapshot }) {
                let _ = tx.send(message);
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Room closed before observer attached");
            if let Some(message) = frame(&RoomFeed::Error { message: e.to_string() }) {
                let _ = ws_sender.send(message).await;
            }
            let _ = ws_sender.close().await;
            return;
        }
    }

    let sender_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = ws_sender.send(message).await {
                tracing::error!(error = %e, "Failed to send WebSocket message");
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let forward_task = tokio::spawn(forward_view(view, tx.clone()));

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(message) if message.is_close() => break,
            Ok(message) => handle_websocket_message(&room, &tx, message).await,
            Err(e) => {
                tracing::error!(error = %e, "WebSocket error");
                break;
            }
        }
    }

    forward_task.abort();
    sender_task.abort();
    tracing::info!(uid = %room.local_uid(), "Room observer disconnected");
}

/// Relays view events until the room stops or the observer goes away.
async fn forward_view(mut view: broadcast::Receiver<ViewEvent>, tx: mpsc::UnboundedSender<Message>) {
    loop {
        let feed = match view.recv().await {
            Ok(event) => RoomFeed::Event { event },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Room observer lagging behind");
                RoomFeed::Lagged { missed }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(message) = frame(&feed) else {
            continue;
        };
        if tx.send(message).is_err() {
            break;
        }
    }
}

async fn handle_websocket_message(
    room: &RoomHandle,
    tx: &mpsc::UnboundedSender<Message>,
    message: Message,
) {
    let Ok(text) = message.to_str() else {
        return;
    };
    tracing::debug!("Received room request: {}", text);

    let request = match serde_json::from_str::<RoomRequest>(text) {
        Ok(request) => request,
        Err(e) => {
            tracing::error!(error = %e, raw_message = %text, "Failed to parse room request");
            if let Some(reply) = frame(&RoomFeed::Error { message: e.to_string() }) {
                let _ = tx.send(reply);
            }
            return;
        }
    };

    // Toggle and leave results reach the observer as view events
    let failure = match request {
        RoomRequest::Toggle { control } => room.toggle(control).await.err(),
        RoomRequest::Leave => room.leave().await.err(),
        RoomRequest::Snapshot => match room.snapshot().await {
            Ok(snapshot) => {
                if let Some(reply) = frame(&RoomFeed::Snapshot { snapshot }) {
                    let _ = tx.send(reply);
                }
                None
            }
            Err(e) => Some(e),
        },
    };

    if let Some(e) = failure {
        if let Some(reply) = frame(&RoomFeed::Error { message: e.to_string() }) {
            let _ = tx.send(reply);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::api::room_routes::{room_routes, RoomSlot};
    use crate::room::testing::{joined_with_tracks, FakeDirectory};
    use crate::room::{JoinRequest, RoomOptions, RoomSession};
    use crate::session::loopback::LoopbackHub;
    use crate::session::Uid;

    async fn join_a(hub: &LoopbackHub, directory: Arc<FakeDirectory>) -> RoomHandle {
        RoomSession::join(
            JoinRequest {
                app_id: "app".to_string(),
                channel: "R7".to_string(),
                token: None,
                uid: Some(Uid::from("u1")),
                display_name: "A".to_string(),
            },
            Arc::new(hub.client()),
            directory,
            RoomOptions::default(),
        )
        .await
        .unwrap()
    }

    fn feed(message: Message) -> RoomFeed {
        serde_json::from_str(message.to_str().unwrap()).unwrap()
    }

    #[test]
    fn test_request_wire_format() {
        let request: RoomRequest =
            serde_json::from_str(r#"{"type":"toggle","control":"camera"}"#).unwrap();
        assert_eq!(request, RoomRequest::Toggle { control: Control::Camera });
        let request: RoomRequest = serde_json::from_str(r#"{"type":"leave"}"#).unwrap();
        assert_eq!(request, RoomRequest::Leave);
    }

    #[tokio::test]
    async fn test_observer_gets_snapshot_then_events() {
        let hub = LoopbackHub::new();
        let directory = Arc::new(FakeDirectory::default());
        directory.insert("u2", "B");
        let room = join_a(&hub, directory).await;
        let routes = room_routes(RoomSlot::ready(room));

        let mut client = warp::test::ws()
            .path("/room/ws")
            .handshake(routes)
            .await
            .expect("handshake");

        match feed(client.recv().await.unwrap()) {
            RoomFeed::Snapshot { snapshot } => {
                assert_eq!(snapshot.room_label, "R7");
                assert_eq!(snapshot.tiles.len(), 1);
            }
            other => panic!("expected snapshot, got {:?}", other),
        }

        let _b = joined_with_tracks(&hub, "u2").await;
        match feed(client.recv().await.unwrap()) {
            RoomFeed::Event {
                event: ViewEvent::TileAdded { tile },
            } => {
                assert_eq!(tile.uid, Uid::from("u2"));
                assert_eq!(tile.label, "B");
            }
            other => panic!("expected tile, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_observer_toggle_echoes_control_change() {
        let hub = LoopbackHub::new();
        let room = join_a(&hub, Arc::new(FakeDirectory::default())).await;
        let routes = room_routes(RoomSlot::ready(room));

        let mut client = warp::test::ws()
            .path("/room/ws")
            .handshake(routes)
            .await
            .expect("handshake");
        let _snapshot = client.recv().await.unwrap();

        client.send_text(r#"{"type":"toggle","control":"microphone"}"#).await;
        match feed(client.recv().await.unwrap()) {
            RoomFeed::Event {
                event: ViewEvent::ControlChanged { state },
            } => {
                assert_eq!(state.control, Control::Microphone);
                assert!(state.muted);
            }
            other => panic!("expected control change, got {:?}", other),
        }

        client.send_text("not json").await;
        assert!(matches!(feed(client.recv().await.unwrap()), RoomFeed::Error { .. }));
    }
}
