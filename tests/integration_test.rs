// Integration tests for Huddle Room
// These tests run the room API and the membership backend on an ephemeral port and drive
// rooms over the loopback session with a real HTTP directory client

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use huddle_room::api::{self, MemberStore, RoomMember, RoomSlot};
use huddle_room::directory::{DirectoryClient, DirectoryConfig};
use huddle_room::room::{JoinRequest, RoomHandle, RoomOptions, RoomSession, RoomSnapshot};
use huddle_room::session::loopback::LoopbackHub;
use huddle_room::session::{SessionClient, Uid};

struct TestServer {
    addr: SocketAddr,
    slot_tx: watch::Sender<Option<RoomHandle>>,
    hub: LoopbackHub,
}

impl TestServer {
    fn start() -> Self {
        let (slot, slot_tx) = RoomSlot::new();
        let routes = api::routes(slot, MemberStore::new(), true);
        let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        Self {
            addr,
            slot_tx,
            hub: LoopbackHub::new(),
        }
    }

    fn directory(&self) -> Arc<DirectoryClient> {
        let config = DirectoryConfig::new(format!("http://{}", self.addr));
        Arc::new(DirectoryClient::new(config).unwrap())
    }

    async fn join(&self, name: &str, uid: &str, options: RoomOptions) -> RoomHandle {
        RoomSession::join(
            JoinRequest {
                app_id: "app".to_string(),
                channel: "R7".to_string(),
                token: None,
                uid: Some(Uid::from(uid)),
                display_name: name.to_string(),
            },
            Arc::new(self.hub.client()),
            self.directory(),
            options,
        )
        .await
        .unwrap()
    }

    /// Joins and exposes the room on the HTTP surface.
    async fn join_served(&self, name: &str, uid: &str) -> RoomHandle {
        let room = self.join(name, uid, RoomOptions::default()).await;
        self.slot_tx.send(Some(room.clone())).unwrap();
        room
    }

    async fn members(&self) -> Vec<RoomMember> {
        let url = format!("http://{}/members/?room_name=R7", self.addr);
        reqwest::get(&url).await.unwrap().json().await.unwrap()
    }
}

async fn wait_for(room: &RoomHandle, what: &str, done: impl Fn(&RoomSnapshot) -> bool) -> RoomSnapshot {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = room.snapshot().await.unwrap();
        if done(&snapshot) {
            return snapshot;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(20)).await;
    }
}

fn labels_for<'a>(snapshot: &'a RoomSnapshot, uid: &str) -> Vec<&'a str> {
    snapshot
        .tiles
        .iter()
        .filter(|t| t.uid.as_str() == uid)
        .map(|t| t.label.as_str())
        .collect()
}

/// A and B see each other by display name, exactly once
#[tokio::test]
async fn test_two_rooms_see_each_other() {
    let server = TestServer::start();
    let a = server.join("A", "u1", RoomOptions::default()).await;
    let b = server.join("B", "u2", RoomOptions::default()).await;

    let snapshot = wait_for(&a, "B's tile", |s| !labels_for(s, "u2").is_empty()).await;
    assert_eq!(snapshot.room_label, "R7");
    assert_eq!(labels_for(&snapshot, "u2"), vec!["B"]);
    assert_eq!(snapshot.subscribed, vec![Uid::from("u2")]);

    let snapshot = wait_for(&b, "A's tile", |s| !labels_for(s, "u1").is_empty()).await;
    assert_eq!(labels_for(&snapshot, "u1"), vec!["A"]);

    let names: Vec<String> = server.members().await.into_iter().map(|m| m.name).collect();
    assert_eq!(names, vec!["A", "B"]);
}

/// B leaving removes its tile from A and its directory entry
#[tokio::test]
async fn test_remote_leave_removes_tile_and_member() {
    let server = TestServer::start();
    let a = server.join("A", "u1", RoomOptions::default()).await;
    let b = server.join("B", "u2", RoomOptions::default()).await;
    wait_for(&a, "B's tile", |s| !labels_for(s, "u2").is_empty()).await;

    let report = b.leave().await.unwrap();
    assert!(report.session_left);
    assert!(report.member_deleted);

    let snapshot = wait_for(&a, "B's tile removal", |s| labels_for(s, "u2").is_empty()).await;
    assert!(snapshot.subscribed.is_empty());

    let members = server.members().await;
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].uid, Uid::from("u1"));
}

/// A member unknown to the directory shows its uid until the directory learns the name
#[tokio::test]
async fn test_fallback_label_is_relabeled_on_reconcile() {
    let server = TestServer::start();
    let options = RoomOptions {
        reconcile_interval: Duration::from_millis(100),
        ..RoomOptions::default()
    };
    let a = server.join("A", "u1", options).await;

    // u2 joins the session without registering with the directory
    let bare = server.hub.client();
    bare.join("app", "R7", None, Some(Uid::from("u2"))).await.unwrap();
    let tracks = bare.create_local_tracks().await.unwrap();
    bare.publish(&tracks).await.unwrap();

    let snapshot = wait_for(&a, "fallback tile", |s| !labels_for(s, "u2").is_empty()).await;
    assert_eq!(labels_for(&snapshot, "u2"), vec!["u2"]);

    let url = format!("http://{}/create_member/", server.addr);
    let resp = reqwest::Client::new()
        .post(&url)
        .json(&serde_json::json!({"name": "B", "room_name": "R7", "UID": "u2"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let snapshot = wait_for(&a, "relabel", |s| labels_for(s, "u2") == vec!["B"]).await;
    assert_eq!(snapshot.tiles.iter().filter(|t| !t.local).count(), 1);
}

/// Health, snapshot, toggle and leave over HTTP
#[tokio::test]
async fn test_http_surface() {
    let server = TestServer::start();
    let client = reqwest::Client::new();
    let base = format!("http://{}", server.addr);

    let resp = client.get(format!("{}/room", base)).send().await.unwrap();
    assert_eq!(resp.status(), 503, "room routes are unavailable before join");

    let resp = client.get(format!("{}/room/health", base)).send().await.unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "Huddle Room");

    server.join_served("A", "u1").await;

    let snapshot: RoomSnapshot = client
        .get(format!("{}/room", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(snapshot.local_uid, Uid::from("u1"));
    assert_eq!(labels_for(&snapshot, "u1"), vec!["A"]);

    let state: serde_json::Value = client
        .post(format!("{}/room/controls/microphone", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(state["muted"], true);
    assert_eq!(state["color"], "rgb(255, 80, 80, 1)");

    let report: serde_json::Value = client
        .post(format!("{}/room/leave", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report["member_deleted"], true);
    assert_eq!(report["location"], "/");
    assert!(server.members().await.is_empty());
}

async fn next_frame<S>(read: &mut S) -> serde_json::Value
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    match timeout(Duration::from_secs(5), read.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str(&text).unwrap(),
        other => panic!("unexpected frame: {:?}", other),
    }
}

/// The room WebSocket sends a snapshot, then tile events
#[tokio::test]
async fn test_websocket_streams_view_events() {
    let server = TestServer::start();
    server.join_served("A", "u1").await;

    let url = format!("ws://{}/room/ws", server.addr);
    let (ws_stream, _) = connect_async(&url).await.expect("Failed to connect");
    let (mut write, mut read) = ws_stream.split();

    let first = next_frame(&mut read).await;
    assert_eq!(first["type"], "snapshot");
    assert_eq!(first["snapshot"]["room_label"], "R7");

    let _b = server.join("B", "u2", RoomOptions::default()).await;
    let added = next_frame(&mut read).await;
    assert_eq!(added["type"], "event");
    assert_eq!(added["event"]["type"], "TileAdded");
    assert_eq!(added["event"]["tile"]["uid"], "u2");
    assert_eq!(added["event"]["tile"]["label"], "B");

    write
        .send(Message::Text(r#"{"type":"toggle","control":"camera"}"#.to_string()))
        .await
        .unwrap();
    let changed = next_frame(&mut read).await;
    assert_eq!(changed["event"]["type"], "ControlChanged");
    assert_eq!(changed["event"]["state"]["control"], "camera");
    assert_eq!(changed["event"]["state"]["muted"], true);
}
