use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::bounded;
use super::tiles::{Tile, TileBoard};
use crate::directory::MemberDirectory;
use crate::error::{Result, RoomError};
use crate::session::{MediaKind, RemoteTrack, SessionClient, Uid};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DisplayName {
    Resolved(String),
    /// Directory lookup failed; the tile shows the uid until a later tick resolves it
    Fallback,
}

/// A remote participant whose video is subscribed and rendered
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Participant {
    pub uid: Uid,
    pub display_name: DisplayName,
    pub video: RemoteTrack,
}

impl Participant {
    pub fn label(&self) -> String {
        match &self.display_name {
            DisplayName::Resolved(name) => name.clone(),
            DisplayName::Fallback => self.uid.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerOptions {
    pub prune_stale: bool,
    pub call_timeout: Duration,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            prune_stale: false,
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of one reconciliation sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub subscribed: usize,
    pub relabeled: usize,
    pub pruned: usize,
    pub failures: usize,
}

impl ReconcileReport {
    pub fn is_quiet(&self) -> bool {
        *self == Self::default()
    }
}

/// Keeps remote tiles in step with the participants the session reports.
///
/// Owns the subscription set (uid -> [`Participant`]) and the audio feeds.
/// Tiles belong to the [`TileBoard`] passed into each operation. Every uid in
/// the subscription set has exactly one remote tile and every remote tile has
/// an entry in the set.
pub struct PresenceReconciler {
    room_name: String,
    local_uid: Uid,
    session: Arc<dyn SessionClient>,
    directory: Arc<dyn MemberDirectory>,
    subscriptions: HashMap<Uid, Participant>,
    audio_feeds: HashMap<Uid, RemoteTrack>,
    options: ReconcilerOptions,
}

impl PresenceReconciler {
    pub fn new(
        room_name: impl Into<String>,
        local_uid: Uid,
        session: Arc<dyn SessionClient>,
        directory: Arc<dyn MemberDirectory>,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            room_name: room_name.into(),
            local_uid,
            session,
            directory,
            subscriptions: HashMap::new(),
            audio_feeds: HashMap::new(),
            options,
        }
    }

    pub async fn on_participant_published(
        &mut self,
        tiles: &mut TileBoard,
        uid: &Uid,
        kind: MediaKind,
    ) -> Result<()> {
        if *uid == self.local_uid {
            return Ok(());
        }

        match kind {
            MediaKind::Audio => {
                let track = self.subscribe(uid, kind).await?;
                tracing::debug!(uid = %uid, track_id = %track.track_id, "Playing remote audio");
                self.audio_feeds.insert(uid.clone(), track);
            }
            MediaKind::Video => {
                if self.subscriptions.contains_key(uid) {
                    tracing::debug!(uid = %uid, "Video already subscribed");
                    return Ok(());
                }

                let track = self.subscribe(uid, kind).await?;
                let display_name = self.resolve_name(uid).await;
                let participant = Participant {
                    uid: uid.clone(),
                    display_name,
                    video: track,
                };

                tiles.render(Tile::remote(
                    uid.clone(),
                    participant.label(),
                    participant.video.track_id.clone(),
                ));
                tracing::info!(uid = %uid, label = %participant.label(), "Rendered remote participant");
                self.subscriptions.insert(uid.clone(), participant);
            }
        }

        Ok(())
    }

    /// Forgets `uid` and destroys its tile. Returns false if nothing was known.
    pub fn on_participant_unpublished(&mut self, tiles: &mut TileBoard, uid: &Uid) -> bool {
        let had_video = self.subscriptions.remove(uid).is_some();
        let had_audio = self.audio_feeds.remove(uid).is_some();
        let had_tile = tiles.remove(uid).is_some();

        if had_video || had_audio || had_tile {
            tracing::info!(uid = %uid, "Removed remote participant");
            true
        } else {
            false
        }
    }

    /// Compares the session's participant list with local state and replays
    /// whatever publish events were missed.
    pub async fn reconcile(&mut self, tiles: &mut TileBoard) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let roster = bounded(
            self.options.call_timeout,
            "remote_users",
            self.session.remote_users(),
        )
        .await;
        let remote = match roster {
            Ok(remote) => remote,
            Err(e) => {
                // Without the list nothing can be added or pruned
                tracing::warn!(error = %e, "Participant list unavailable, skipping reconcile");
                report.failures += 1;
                report.relabeled = self.retry_fallback_names(tiles).await;
                return report;
            }
        };
        let local_uid = self.local_uid.clone();

        for user in remote.iter().filter(|u| u.uid != local_uid) {
            for kind in [MediaKind::Audio, MediaKind::Video] {
                if !user.publishes(kind) || self.is_subscribed(&user.uid, kind) {
                    continue;
                }

                match self.on_participant_published(tiles, &user.uid, kind).await {
                    Ok(()) => report.subscribed += 1,
                    Err(e) => {
                        report.failures += 1;
                        tracing::warn!(
                            uid = %user.uid,
                            kind = %kind,
                            error = %e,
                            "Reconcile subscribe failed, retrying next tick"
                        );
                    }
                }
            }
        }

        report.relabeled = self.retry_fallback_names(tiles).await;

        if self.options.prune_stale {
            let present: HashSet<&Uid> = remote.iter().map(|u| &u.uid).collect();
            let stale: Vec<Uid> = self
                .subscriptions
                .keys()
                .chain(self.audio_feeds.keys())
                .filter(|uid| !present.contains(uid))
                .cloned()
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();

            for uid in stale {
                if self.on_participant_unpublished(tiles, &uid) {
                    tracing::info!(uid = %uid, "Pruned participant missing from session");
                    report.pruned += 1;
                }
            }
        }

        report
    }

    async fn retry_fallback_names(&mut self, tiles: &mut TileBoard) -> usize {
        let unresolved: Vec<Uid> = self
            .subscriptions
            .values()
            .filter(|p| p.display_name == DisplayName::Fallback)
            .map(|p| p.uid.clone())
            .collect();

        let mut relabeled = 0;
        for uid in unresolved {
            let DisplayName::Resolved(name) = self.resolve_name(&uid).await else {
                continue;
            };

            if let Some(participant) = self.subscriptions.get_mut(&uid) {
                participant.display_name = DisplayName::Resolved(name.clone());
                tiles.relabel(&uid, name);
                relabeled += 1;
            }
        }
        relabeled
    }

    async fn subscribe(&self, uid: &Uid, kind: MediaKind) -> Result<RemoteTrack> {
        let what = format!("subscribe to {} of {}", kind, uid);
        bounded(self.options.call_timeout, &what, self.session.subscribe(uid, kind)).await
    }

    async fn resolve_name(&self, uid: &Uid) -> DisplayName {
        let lookup = self.directory.get_member(uid, &self.room_name);
        match bounded(self.options.call_timeout, "get_member", lookup).await {
            Ok(record) => DisplayName::Resolved(record.name),
            Err(e) => {
                tracing::warn!(uid = %uid, error = %e, "Member lookup failed, labelling tile with uid");
                DisplayName::Fallback
            }
        }
    }

    /// Drops every remote participant and its tile.
    pub fn clear(&mut self, tiles: &mut TileBoard) {
        let uids: Vec<Uid> = self
            .subscriptions
            .keys()
            .chain(self.audio_feeds.keys())
            .cloned()
            .collect();
        for uid in uids {
            self.on_participant_unpublished(tiles, &uid);
        }
    }

    pub fn is_subscribed(&self, uid: &Uid, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio_feeds.contains_key(uid),
            MediaKind::Video => self.subscriptions.contains_key(uid),
        }
    }

    pub fn participant(&self, uid: &Uid) -> Option<&Participant> {
        self.subscriptions.get(uid)
    }

    pub fn subscribed_uids(&self) -> Vec<Uid> {
        let mut uids: Vec<Uid> = self.subscriptions.keys().cloned().collect();
        uids.sort();
        uids
    }

    /// Verifies the subscription set and the remote tiles describe the same uids.
    pub fn check_invariants(&self, tiles: &TileBoard) -> Result<()> {
        let tiled: HashSet<&Uid> = tiles.remote_uids().collect();
        let subscribed: HashSet<&Uid> = self.subscriptions.keys().collect();

        if tiled.len() != tiles.remote_uids().count() {
            return Err(RoomError::internal("duplicate remote tiles"));
        }
        if tiled != subscribed {
            return Err(RoomError::internal(format!(
                "tiles {:?} do not match subscriptions {:?}",
                tiled, subscribed
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::testing::{joined_with_tracks, FakeDirectory};
    use crate::session::loopback::{LoopbackClient, LoopbackHub};
    use tokio::sync::broadcast;

    struct Fixture {
        hub: LoopbackHub,
        directory: Arc<FakeDirectory>,
        reconciler: PresenceReconciler,
        tiles: TileBoard,
        remote: LoopbackClient,
    }

    async fn fixture(options: ReconcilerOptions) -> Fixture {
        let hub = LoopbackHub::new();
        let directory = Arc::new(FakeDirectory::default());
        directory.insert("u2", "B");

        let local = Arc::new(hub.client());
        local.join("app", "R7", None, Some(Uid::from("u1"))).await.unwrap();
        let remote = joined_with_tracks(&hub, "u2").await;

        let (tx, _) = broadcast::channel(64);
        let reconciler = PresenceReconciler::new(
            "R7",
            Uid::from("u1"),
            local,
            directory.clone(),
            options,
        );

        Fixture {
            hub,
            directory,
            reconciler,
            tiles: TileBoard::new(tx),
            remote,
        }
    }

    #[tokio::test]
    async fn test_published_video_renders_named_tile() {
        let mut f = fixture(ReconcilerOptions::default()).await;
        let u2 = Uid::from("u2");

        f.reconciler
            .on_participant_published(&mut f.tiles, &u2, MediaKind::Video)
            .await
            .unwrap();

        let tile = f.tiles.get(&u2).unwrap();
        assert_eq!(tile.label, "B");
        assert_eq!(tile.video_track.as_deref(), Some("u2-video"));
        assert_eq!(f.directory.lookups(), vec![(u2.clone(), "R7".to_string())]);
        f.reconciler.check_invariants(&f.tiles).unwrap();
    }

    #[tokio::test]
    async fn test_published_twice_yields_one_tile() {
        let mut f = fixture(ReconcilerOptions::default()).await;
        let u2 = Uid::from("u2");

        for _ in 0..2 {
            f.reconciler
                .on_participant_published(&mut f.tiles, &u2, MediaKind::Video)
                .await
                .unwrap();
        }

        assert_eq!(f.tiles.tiles().len(), 1);
        assert_eq!(f.directory.lookups().len(), 1);
        f.reconciler.check_invariants(&f.tiles).unwrap();
    }

    #[tokio::test]
    async fn test_audio_has_no_tile() {
        let mut f = fixture(ReconcilerOptions::default()).await;
        let u2 = Uid::from("u2");

        f.reconciler
            .on_participant_published(&mut f.tiles, &u2, MediaKind::Audio)
            .await
            .unwrap();

        assert!(f.reconciler.is_subscribed(&u2, MediaKind::Audio));
        assert!(!f.tiles.contains(&u2));
        f.reconciler.check_invariants(&f.tiles).unwrap();
    }

    #[tokio::test]
    async fn test_unpublished_removes_tile_and_entry() {
        let mut f = fixture(ReconcilerOptions::default()).await;
        let u2 = Uid::from("u2");
        for kind in [MediaKind::Audio, MediaKind::Video] {
            f.reconciler
                .on_participant_published(&mut f.tiles, &u2, kind)
                .await
                .unwrap();
        }

        assert!(f.reconciler.on_participant_unpublished(&mut f.tiles, &u2));
        assert!(!f.tiles.contains(&u2));
        assert!(f.reconciler.subscribed_uids().is_empty());
        assert!(!f.reconciler.is_subscribed(&u2, MediaKind::Audio));
        assert!(!f.reconciler.on_participant_unpublished(&mut f.tiles, &u2));
    }

    #[tokio::test]
    async fn test_failed_subscribe_leaves_state_untouched() {
        let mut f = fixture(ReconcilerOptions::default()).await;
        let u2 = Uid::from("u2");
        f.hub.fail_subscriptions(&u2, 1).await;

        let err = f
            .reconciler
            .on_participant_published(&mut f.tiles, &u2, MediaKind::Video)
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::Subscription { .. }));
        assert!(f.tiles.tiles().is_empty());
        assert!(f.reconciler.subscribed_uids().is_empty());

        let report = f.reconciler.reconcile(&mut f.tiles).await;
        assert_eq!(report.subscribed, 2);
        assert!(f.tiles.contains(&u2));
    }

    #[tokio::test]
    async fn test_lookup_failure_falls_back_then_relabels() {
        let mut f = fixture(ReconcilerOptions::default()).await;
        let u2 = Uid::from("u2");
        f.directory.fail_lookups("u2", 1);

        f.reconciler
            .on_participant_published(&mut f.tiles, &u2, MediaKind::Video)
            .await
            .unwrap();
        assert_eq!(f.tiles.get(&u2).unwrap().label, "u2");
        assert_eq!(
            f.reconciler.participant(&u2).unwrap().display_name,
            DisplayName::Fallback
        );

        let report = f.reconciler.reconcile(&mut f.tiles).await;
        assert_eq!(report.relabeled, 1);
        assert_eq!(f.tiles.get(&u2).unwrap().label, "B");
    }

    #[tokio::test]
    async fn test_reconcile_subscribes_missing_participants() {
        let mut f = fixture(ReconcilerOptions::default()).await;

        let report = f.reconciler.reconcile(&mut f.tiles).await;
        assert_eq!(report.subscribed, 2);
        assert!(f.reconciler.is_subscribed(&Uid::from("u2"), MediaKind::Audio));
        assert!(f.reconciler.is_subscribed(&Uid::from("u2"), MediaKind::Video));

        let report = f.reconciler.reconcile(&mut f.tiles).await;
        assert!(report.is_quiet());
    }

    #[tokio::test]
    async fn test_reconcile_skips_unpublished_kinds() {
        let mut f = fixture(ReconcilerOptions::default()).await;
        f.remote.unpublish(MediaKind::Video).await.unwrap();

        let report = f.reconciler.reconcile(&mut f.tiles).await;
        assert_eq!(report.subscribed, 1);
        assert!(f.tiles.tiles().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_keeps_stale_entries_by_default() {
        let mut f = fixture(ReconcilerOptions::default()).await;
        f.reconciler.reconcile(&mut f.tiles).await;

        f.hub.disconnect_silently("R7", &Uid::from("u2")).await;
        let report = f.reconciler.reconcile(&mut f.tiles).await;

        assert_eq!(report.pruned, 0);
        assert!(f.tiles.contains(&Uid::from("u2")));
    }

    #[tokio::test]
    async fn test_reconcile_prunes_stale_entries_when_enabled() {
        let options = ReconcilerOptions {
            prune_stale: true,
            ..ReconcilerOptions::default()
        };
        let mut f = fixture(options).await;
        f.reconciler.reconcile(&mut f.tiles).await;

        f.hub.disconnect_silently("R7", &Uid::from("u2")).await;
        let report = f.reconciler.reconcile(&mut f.tiles).await;

        assert_eq!(report.pruned, 1);
        assert!(f.tiles.tiles().is_empty());
        f.reconciler.check_invariants(&f.tiles).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_subscribe_times_out_and_loop_continues() {
        let mut f = fixture(ReconcilerOptions::default()).await;
        let u2 = Uid::from("u2");
        f.hub.stall_subscriptions(&u2).await;

        let started = tokio::time::Instant::now();
        let err = f
            .reconciler
            .on_participant_published(&mut f.tiles, &u2, MediaKind::Video)
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(f.tiles.tiles().is_empty());
        assert!(f.reconciler.subscribed_uids().is_empty());

        let report = f.reconciler.reconcile(&mut f.tiles).await;
        assert_eq!(report.failures, 2);
        assert_eq!(report.subscribed, 0);
        f.reconciler.check_invariants(&f.tiles).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_lookup_falls_back_to_uid_after_timeout() {
        let mut f = fixture(ReconcilerOptions::default()).await;
        let u2 = Uid::from("u2");
        f.directory.stall_lookups(true);

        let started = tokio::time::Instant::now();
        f.reconciler
            .on_participant_published(&mut f.tiles, &u2, MediaKind::Video)
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(f.tiles.get(&u2).unwrap().label, "u2");

        f.directory.stall_lookups(false);
        let report = f.reconciler.reconcile(&mut f.tiles).await;
        assert_eq!(report.relabeled, 1);
        assert_eq!(f.tiles.get(&u2).unwrap().label, "B");
    }

    #[tokio::test]
    async fn test_unavailable_roster_prunes_nothing() {
        let options = ReconcilerOptions {
            prune_stale: true,
            ..ReconcilerOptions::default()
        };
        let mut f = fixture(options).await;
        f.reconciler.reconcile(&mut f.tiles).await;
        assert!(f.tiles.contains(&Uid::from("u2")));

        f.hub.fail_roster(true).await;
        let report = f.reconciler.reconcile(&mut f.tiles).await;

        assert_eq!(report.failures, 1);
        assert_eq!(report.pruned, 0);
        assert!(f.tiles.contains(&Uid::from("u2")));
        f.reconciler.check_invariants(&f.tiles).unwrap();
    }

    #[tokio::test]
    async fn test_local_uid_is_ignored() {
        let mut f = fixture(ReconcilerOptions::default()).await;
        f.reconciler
            .on_participant_published(&mut f.tiles, &Uid::from("u1"), MediaKind::Video)
            .await
            .unwrap();
        assert!(f.tiles.tiles().is_empty());
    }
}
