use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use super::bounded;
use super::controls::{toggle_mute, Control, ControlState};
use super::reconciler::{PresenceReconciler, ReconcilerOptions};
use super::tiles::{Tile, TileBoard, ViewEvent};
use crate::directory::{MemberDirectory, MemberIdentity};
use crate::error::{Result, RoomError};
use crate::session::{LocalTracks, SessionClient, SessionEvent, Uid};

const COMMAND_CAPACITY: usize = 64;
const VIEW_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct RoomOptions {
    pub reconcile_interval: Duration,
    pub prune_stale: bool,
    pub call_timeout: Duration,
    pub unload_grace: Duration,
    pub lobby_path: String,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(5),
            prune_stale: false,
            call_timeout: Duration::from_secs(10),
            unload_grace: Duration::from_millis(500),
            lobby_path: "/".to_string(),
        }
    }
}

/// Who is joining what
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub app_id: String,
    pub channel: String,
    pub token: Option<String>,
    pub uid: Option<Uid>,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_label: String,
    pub local_uid: Uid,
    pub tiles: Vec<Tile>,
    pub controls: Vec<ControlState>,
    pub subscribed: Vec<Uid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveReport {
    pub session_left: bool,
    pub member_deleted: bool,
    pub location: Option<String>,
}

enum RoomCommand {
    Toggle {
        control: Control,
        reply: oneshot::Sender<Result<ControlState>>,
    },
    Snapshot {
        reply: oneshot::Sender<RoomSnapshot>,
    },
    Leave {
        reply: oneshot::Sender<LeaveReport>,
    },
    Unload {
        reply: oneshot::Sender<LeaveReport>,
    },
}

/// Cloneable front door to a running room
#[derive(Clone)]
pub struct RoomHandle {
    commands: mpsc::Sender<RoomCommand>,
    view: broadcast::Sender<ViewEvent>,
    local_uid: Uid,
}

impl RoomHandle {
    pub fn local_uid(&self) -> &Uid {
        &self.local_uid
    }

    pub fn subscribe_view(&self) -> broadcast::Receiver<ViewEvent> {
        self.view.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Resolves once the supervisor has stopped.
    pub async fn closed(&self) {
        self.commands.closed().await
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> RoomCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| RoomError::SessionClosed)?;
        rx.await.map_err(|_| RoomError::SessionClosed)
    }

    pub async fn toggle(&self, control: Control) -> Result<ControlState> {
        self.request(|reply| RoomCommand::Toggle { control, reply })
            .await?
    }

    pub async fn toggle_microphone(&self) -> Result<ControlState> {
        self.toggle(Control::Microphone).await
    }

    pub async fn toggle_camera(&self) -> Result<ControlState> {
        self.toggle(Control::Camera).await
    }

    pub async fn snapshot(&self) -> Result<RoomSnapshot> {
        self.request(|reply| RoomCommand::Snapshot { reply }).await
    }

    pub async fn leave(&self) -> Result<LeaveReport> {
        self.request(|reply| RoomCommand::Leave { reply }).await
    }

    /// Best-effort teardown for process shutdown; no navigation happens.
    pub async fn unload(&self) -> Result<LeaveReport> {
        self.request(|reply| RoomCommand::Unload { reply }).await
    }
}

/// State owned by the supervisor task
pub struct RoomSession {
    identity: MemberIdentity,
    session: Arc<dyn SessionClient>,
    directory: Arc<dyn MemberDirectory>,
    tracks: LocalTracks,
    tiles: TileBoard,
    reconciler: PresenceReconciler,
    controls: HashMap<Control, ControlState>,
    options: RoomOptions,
}

impl RoomSession {
    /// Joins the session, announces the member, renders the local tile,
    /// publishes local media and starts the supervisor.
    pub async fn join(
        request: JoinRequest,
        session: Arc<dyn SessionClient>,
        directory: Arc<dyn MemberDirectory>,
        options: RoomOptions,
    ) -> Result<RoomHandle> {
        let (view_tx, _) = broadcast::channel(VIEW_EVENT_CAPACITY);
        let mut tiles = TileBoard::new(view_tx.clone());
        tiles.set_room_label(&request.channel);

        // Handlers are registered before joining so no publish event is missed
        let events = session
            .take_events()
            .await
            .ok_or_else(|| RoomError::internal("session events already taken"))?;

        let join = session.join(
            &request.app_id,
            &request.channel,
            request.token.as_deref(),
            request.uid.clone(),
        );
        let uid = match bounded(options.call_timeout, "join", join).await {
            Ok(uid) => uid,
            Err(e) => {
                tracing::error!(channel = %request.channel, error = %e, "Failed to join session");
                return Err(match e {
                    RoomError::Timeout(msg) => RoomError::Connection(msg),
                    other => other,
                });
            }
        };

        let tracks = match session.create_local_tracks().await {
            Ok(tracks) => tracks,
            Err(e) => {
                tracing::error!(uid = %uid, error = %e, "Failed to capture local media");
                if let Err(leave_err) = session.leave().await {
                    tracing::warn!(error = %leave_err, "Failed to leave after capture failure");
                }
                return Err(e);
            }
        };

        let identity = MemberIdentity {
            name: request.display_name.clone(),
            room_name: request.channel.clone(),
            uid: uid.clone(),
        };

        let local_label = match bounded(
            options.call_timeout,
            "create_member",
            directory.create_member(&identity),
        )
        .await
        {
            Ok(record) => record.name,
            Err(e) => {
                tracing::warn!(uid = %uid, error = %e, "Failed to register member");
                identity.name.clone()
            }
        };
        tiles.render(Tile::local(uid.clone(), local_label, tracks.video.id()));

        if let Err(e) = bounded(options.call_timeout, "publish", session.publish(&tracks)).await {
            tracing::error!(uid = %uid, error = %e, "Failed to publish local tracks");
            tracks.stop_and_close();
            if let Err(leave_err) = bounded(options.call_timeout, "leave", session.leave()).await {
                tracing::warn!(uid = %uid, error = %leave_err, "Failed to leave after publish failure");
            }
            let delete = directory.delete_member(&identity);
            if let Err(delete_err) = bounded(options.call_timeout, "delete_member", delete).await {
                tracing::warn!(uid = %uid, error = %delete_err, "Failed to delete member after publish failure");
            }
            return Err(e);
        }

        let reconciler = PresenceReconciler::new(
            request.channel.clone(),
            uid.clone(),
            session.clone(),
            directory.clone(),
            ReconcilerOptions {
                prune_stale: options.prune_stale,
                call_timeout: options.call_timeout,
            },
        );

        let controls = [Control::Microphone, Control::Camera]
            .into_iter()
            .map(|c| (c, ControlState::of(c, tracks.get(c.kind()).as_ref())))
            .collect();

        let room = RoomSession {
            identity,
            session,
            directory,
            tracks,
            tiles,
            reconciler,
            controls,
            options,
        };

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        tokio::spawn(room.run(command_rx, events));

        tracing::info!(uid = %uid, channel = %request.channel, "Room joined");
        Ok(RoomHandle {
            commands: command_tx,
            view: view_tx,
            local_uid: uid,
        })
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<RoomCommand>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let period = self.options.reconcile_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        tracing::info!(uid = %self.identity.uid, "All room handles dropped, unloading");
                        self.teardown(Some(self.options.unload_grace)).await;
                        break;
                    };
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }
                event = events.recv(), if events_open => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            tracing::warn!("Session event stream closed, relying on reconciliation");
                            events_open = false;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let report = self.reconciler.reconcile(&mut self.tiles).await;
                    if !report.is_quiet() {
                        tracing::info!(?report, "Reconciled room presence");
                    }
                }
            }

            if let Err(e) = self.reconciler.check_invariants(&self.tiles) {
                tracing::error!(error = %e, "Room state out of sync");
                debug_assert!(false, "{}", e);
            }
        }

        tracing::info!(uid = %self.identity.uid, "Room supervisor stopped");
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        tracing::debug!(?event, "Session event");
        match event {
            SessionEvent::UserPublished { user, kind } => {
                if let Err(e) = self
                    .reconciler
                    .on_participant_published(&mut self.tiles, &user.uid, kind)
                    .await
                {
                    tracing::warn!(
                        uid = %user.uid,
                        kind = %kind,
                        error = %e,
                        "Failed to handle publish, retrying on next reconcile"
                    );
                }
            }
            SessionEvent::UserUnpublished { uid } | SessionEvent::UserLeft { uid } => {
                self.reconciler.on_participant_unpublished(&mut self.tiles, &uid);
            }
        }
    }

    async fn handle_command(&mut self, command: RoomCommand) -> ControlFlow<()> {
        match command {
            RoomCommand::Toggle { control, reply } => {
                let track = self.tracks.get(control.kind()).clone();
                let result = toggle_mute(control, track.as_ref()).await;
                if let Ok(state) = &result {
                    self.controls.insert(control, state.clone());
                    self.tiles.emit(ViewEvent::ControlChanged {
                        state: state.clone(),
                    });
                }
                let _ = reply.send(result);
                ControlFlow::Continue(())
            }
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
                ControlFlow::Continue(())
            }
            RoomCommand::Leave { reply } => {
                let report = self.teardown(None).await;
                let _ = reply.send(report);
                ControlFlow::Break(())
            }
            RoomCommand::Unload { reply } => {
                let report = self.teardown(Some(self.options.unload_grace)).await;
                let _ = reply.send(report);
                ControlFlow::Break(())
            }
        }
    }

    fn snapshot(&self) -> RoomSnapshot {
        let mut controls: Vec<ControlState> = self.controls.values().cloned().collect();
        controls.sort_by_key(|c| c.control as u8);

        RoomSnapshot {
            room_label: self.tiles.room_label().to_string(),
            local_uid: self.identity.uid.clone(),
            tiles: self.tiles.tiles().to_vec(),
            controls,
            subscribed: self.reconciler.subscribed_uids(),
        }
    }

    /// Stops local media, leaves the session and deletes the member. Every
    /// step runs even if an earlier one fails. With `grace` set each remote
    /// call is cut short and no navigation happens.
    async fn teardown(&mut self, grace: Option<Duration>) -> LeaveReport {
        let limit = grace.unwrap_or(self.options.call_timeout);
        let uid = self.identity.uid.clone();

        self.tracks.stop_and_close();

        let session_left = match bounded(limit, "leave", self.session.leave()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(uid = %uid, error = %e, "Failed to leave session");
                false
            }
        };

        let member_deleted = match bounded(
            limit,
            "delete_member",
            self.directory.delete_member(&self.identity),
        )
        .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(uid = %uid, error = %e, "Failed to delete member");
                false
            }
        };

        self.reconciler.clear(&mut self.tiles);
        self.tiles.clear();

        let location = if grace.is_none() {
            self.tiles.navigate(&self.options.lobby_path);
            Some(self.options.lobby_path.clone())
        } else {
            None
        };

        tracing::info!(uid = %uid, session_left, member_deleted, "Room torn down");
        LeaveReport {
            session_left,
            member_deleted,
            location,
        }
    }
}
