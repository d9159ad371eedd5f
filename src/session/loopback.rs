use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, RwLock};

use super::{
    LocalTrack, LocalTracks, MediaKind, RemoteParticipant, RemoteTrack, SessionClient,
    SessionEvent, Uid,
};
use crate::error::{Result, RoomError};

#[derive(Debug)]
struct Member {
    has_audio: bool,
    has_video: bool,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Member {
    fn snapshot(&self, uid: &Uid) -> RemoteParticipant {
        RemoteParticipant {
            uid: uid.clone(),
            has_audio: self.has_audio,
            has_video: self.has_video,
        }
    }

    fn set_published(&mut self, kind: MediaKind, published: bool) -> bool {
        let slot = match kind {
            MediaKind::Audio => &mut self.has_audio,
            MediaKind::Video => &mut self.has_video,
        };
        let changed = *slot != published;
        *slot = published;
        changed
    }
}

#[derive(Default)]
struct HubState {
    channels: HashMap<String, HashMap<Uid, Member>>,
    required_token: Option<String>,
    /// Remaining events to discard per receiving uid
    dropped_events: HashMap<Uid, usize>,
    /// Remaining subscribe calls to fail per target uid
    subscribe_failures: HashMap<Uid, u32>,
    /// Subscriptions targeting these uids never complete
    stalled_subscriptions: HashSet<Uid>,
    capture_fails: bool,
    publish_fails: bool,
    roster_fails: bool,
    leave_fails: bool,
}

impl HubState {
    fn deliver(&mut self, channel: &str, to: &Uid, event: SessionEvent) {
        if let Some(remaining) = self.dropped_events.get_mut(to) {
            if *remaining > 0 {
                *remaining -= 1;
                tracing::debug!(uid = %to, ?event, "Dropping session event");
                return;
            }
        }

        if let Some(member) = self.channels.get(channel).and_then(|c| c.get(to)) {
            let _ = member.events.send(event);
        }
    }

    fn broadcast(&mut self, channel: &str, from: &Uid, event: SessionEvent) {
        let targets: Vec<Uid> = match self.channels.get(channel) {
            Some(members) => members.keys().filter(|uid| *uid != from).cloned().collect(),
            None => return,
        };

        for target in targets {
            self.deliver(channel, &target, event.clone());
        }
    }
}

/// In-process session service. Every [`LoopbackClient`] created from the same
/// hub shares its channels.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<RwLock<HubState>>,
    track_seq: Arc<AtomicU64>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects joins whose token differs from `token`.
    pub async fn require_token(&self, token: impl Into<String>) {
        self.state.write().await.required_token = Some(token.into());
    }

    pub fn client(&self) -> LoopbackClient {
        LoopbackClient::new(self.clone())
    }

    /// Loses the next `count` events destined for `uid`.
    pub async fn drop_events_for(&self, uid: &Uid, count: usize) {
        self.state.write().await.dropped_events.insert(uid.clone(), count);
    }

    /// Fails the next `times` subscriptions targeting `uid`.
    pub async fn fail_subscriptions(&self, uid: &Uid, times: u32) {
        self.state.write().await.subscribe_failures.insert(uid.clone(), times);
    }

    pub async fn fail_capture(&self, fails: bool) {
        self.state.write().await.capture_fails = fails;
    }

    pub async fn fail_publish(&self, fails: bool) {
        self.state.write().await.publish_fails = fails;
    }

    /// Makes the participant list unavailable, as when the SDK loses its
    /// connection to the session service.
    pub async fn fail_roster(&self, fails: bool) {
        self.state.write().await.roster_fails = fails;
    }

    /// Leaves every subscription targeting `uid` pending forever.
    pub async fn stall_subscriptions(&self, uid: &Uid) {
        self.state.write().await.stalled_subscriptions.insert(uid.clone());
    }

    pub async fn fail_leave(&self, fails: bool) {
        self.state.write().await.leave_fails = fails;
    }

    /// Removes `uid` from `channel` without notifying anyone, as when a peer
    /// vanishes without a clean leave.
    pub async fn disconnect_silently(&self, channel: &str, uid: &Uid) -> bool {
        let mut state = self.state.write().await;
        state
            .channels
            .get_mut(channel)
            .map(|members| members.remove(uid).is_some())
            .unwrap_or(false)
    }

    pub async fn members(&self, channel: &str) -> Vec<RemoteParticipant> {
        let state = self.state.read().await;
        let mut members: Vec<RemoteParticipant> = state
            .channels
            .get(channel)
            .map(|c| c.iter().map(|(uid, m)| m.snapshot(uid)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.uid.cmp(&b.uid));
        members
    }

    fn next_track_id(&self, kind: MediaKind) -> String {
        let seq = self.track_seq.fetch_add(1, Ordering::Relaxed);
        format!("local-{}-{}", kind, seq)
    }

    fn generate_uid() -> Uid {
        let mut rng = rand::thread_rng();
        Uid::new(format!("{:06}", rng.gen_range(100000..999999)))
    }
}

/// One participant's connection to a [`LoopbackHub`]
pub struct LoopbackClient {
    hub: LoopbackHub,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: RwLock<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    joined: RwLock<Option<(String, Uid)>>,
}

impl LoopbackClient {
    fn new(hub: LoopbackHub) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            hub,
            events_tx,
            events_rx: RwLock::new(Some(events_rx)),
            joined: RwLock::new(None),
        }
    }

    pub async fn uid(&self) -> Option<Uid> {
        self.joined.read().await.as_ref().map(|(_, uid)| uid.clone())
    }

    async fn membership(&self) -> Result<(String, Uid)> {
        self.joined.read().await.clone().ok_or(RoomError::NotJoined)
    }

    /// Stops publishing `kind` and notifies the other participants.
    pub async fn unpublish(&self, kind: MediaKind) -> Result<()> {
        let (channel, uid) = self.membership().await?;
        let mut state = self.hub.state.write().await;

        let changed = state
            .channels
            .get_mut(&channel)
            .and_then(|members| members.get_mut(&uid))
            .map(|member| member.set_published(kind, false))
            .unwrap_or(false);

        if changed {
            tracing::debug!(uid = %uid, kind = %kind, "Loopback unpublish");
            state.broadcast(&channel, &uid, SessionEvent::UserUnpublished { uid: uid.clone() });
        }
        Ok(())
    }
}

#[async_trait]
impl SessionClient for LoopbackClient {
    async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.write().await.take()
    }

    async fn join(
        &self,
        app_id: &str,
        channel: &str,
        token: Option<&str>,
        uid: Option<Uid>,
    ) -> Result<Uid> {
        let mut joined = self.joined.write().await;
        if let Some((_, existing)) = joined.as_ref() {
            return Err(RoomError::AlreadyJoined(existing.clone()));
        }
        if app_id.is_empty() {
            return Err(RoomError::connection("empty app id"));
        }
        if channel.is_empty() {
            return Err(RoomError::connection("channel unreachable"));
        }

        let mut state = self.hub.state.write().await;
        if let Some(required) = state.required_token.as_deref() {
            if token != Some(required) {
                return Err(RoomError::connection("invalid token"));
            }
        }

        let members = state.channels.entry(channel.to_string()).or_default();
        let uid = match uid {
            Some(uid) if members.contains_key(&uid) => {
                return Err(RoomError::connection(format!("uid {} already in channel", uid)));
            }
            Some(uid) => uid,
            None => loop {
                let candidate = LoopbackHub::generate_uid();
                if !members.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        let existing: Vec<RemoteParticipant> =
            members.iter().map(|(id, m)| m.snapshot(id)).collect();

        members.insert(
            uid.clone(),
            Member {
                has_audio: false,
                has_video: false,
                events: self.events_tx.clone(),
            },
        );

        // Participants already publishing are announced to the newcomer
        for user in existing {
            for kind in [MediaKind::Audio, MediaKind::Video] {
                if user.publishes(kind) {
                    state.deliver(
                        channel,
                        &uid,
                        SessionEvent::UserPublished {
                            user: user.clone(),
                            kind,
                        },
                    );
                }
            }
        }

        tracing::info!(channel = %channel, uid = %uid, "Joined loopback session");
        *joined = Some((channel.to_string(), uid.clone()));
        Ok(uid)
    }

    async fn create_local_tracks(&self) -> Result<LocalTracks> {
        if self.hub.state.read().await.capture_fails {
            return Err(RoomError::Media("capture device unavailable".to_string()));
        }

        Ok(LocalTracks {
            audio: Arc::new(LoopbackTrack::new(
                self.hub.next_track_id(MediaKind::Audio),
                MediaKind::Audio,
            )),
            video: Arc::new(LoopbackTrack::new(
                self.hub.next_track_id(MediaKind::Video),
                MediaKind::Video,
            )),
        })
    }

    async fn publish(&self, _tracks: &LocalTracks) -> Result<()> {
        let (channel, uid) = self.membership().await?;
        let mut state = self.hub.state.write().await;
        if state.publish_fails {
            return Err(RoomError::connection("publish rejected by session"));
        }

        let (newly_published, user) = {
            let member = state
                .channels
                .get_mut(&channel)
                .and_then(|members| members.get_mut(&uid))
                .ok_or(RoomError::NotJoined)?;
            let newly: Vec<MediaKind> = [MediaKind::Audio, MediaKind::Video]
                .into_iter()
                .filter(|kind| member.set_published(*kind, true))
                .collect();
            (newly, member.snapshot(&uid))
        };

        for kind in newly_published {
            state.broadcast(
                &channel,
                &uid,
                SessionEvent::UserPublished {
                    user: user.clone(),
                    kind,
                },
            );
        }

        tracing::info!(channel = %channel, uid = %uid, "Published local tracks");
        Ok(())
    }

    async fn subscribe(&self, target: &Uid, kind: MediaKind) -> Result<RemoteTrack> {
        let (channel, uid) = self.membership().await?;
        if *target == uid {
            return Err(RoomError::subscription(target, kind, "cannot subscribe to self"));
        }

        let mut state = self.hub.state.write().await;

        let publishing = state
            .channels
            .get(&channel)
            .and_then(|members| members.get(target))
            .map(|member| member.snapshot(target).publishes(kind));

        match publishing {
            None => return Err(RoomError::subscription(target, kind, "not in session")),
            Some(false) => return Err(RoomError::subscription(target, kind, "not published")),
            Some(true) => {}
        }

        if state.stalled_subscriptions.contains(target) {
            drop(state);
            tracing::debug!(uid = %target, kind = %kind, "Loopback subscribe stalled");
            return std::future::pending().await;
        }

        if let Some(remaining) = state.subscribe_failures.get_mut(target) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RoomError::subscription(target, kind, "injected failure"));
            }
        }

        Ok(RemoteTrack {
            uid: target.clone(),
            kind,
            track_id: format!("{}-{}", target, kind),
        })
    }

    async fn remote_users(&self) -> Result<Vec<RemoteParticipant>> {
        let (channel, uid) = self.membership().await?;
        if self.hub.state.read().await.roster_fails {
            return Err(RoomError::connection("participant list unavailable"));
        }

        Ok(self
            .hub
            .members(&channel)
            .await
            .into_iter()
            .filter(|user| user.uid != uid)
            .collect())
    }

    async fn leave(&self) -> Result<()> {
        let mut joined = self.joined.write().await;
        let (channel, uid) = joined.take().ok_or(RoomError::NotJoined)?;

        let mut state = self.hub.state.write().await;
        if state.leave_fails {
            *joined = Some((channel, uid));
            return Err(RoomError::connection("leave rejected by session"));
        }

        if let Some(members) = state.channels.get_mut(&channel) {
            members.remove(&uid);
        }
        state.broadcast(&channel, &uid, SessionEvent::UserLeft { uid: uid.clone() });

        tracing::info!(channel = %channel, uid = %uid, "Left loopback session");
        Ok(())
    }
}

/// Local track backed by nothing but flags
#[derive(Debug)]
pub struct LoopbackTrack {
    id: String,
    kind: MediaKind,
    muted: AtomicBool,
    stopped: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            muted: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalTrack for LoopbackTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    async fn set_muted(&self, muted: bool) -> Result<()> {
        if self.is_closed() {
            return Err(RoomError::Media(format!("track {} is closed", self.id)));
        }
        self.muted.store(muted, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
