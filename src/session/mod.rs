//! Real-time session seam
//!
//! The room controller never talks to a media stack directly. Everything it
//! needs from the session SDK (join, local capture, publish, subscribe, the
//! authoritative participant list and publish/unpublish notifications) goes
//! through [`SessionClient`] and [`LocalTrack`].
//!
//! [`loopback`] provides an in-process implementation where every client of a
//! [`loopback::LoopbackHub`] sees the others, used by the demo binary and tests.

pub mod loopback;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Result, RoomError};

/// Opaque, session-assigned participant id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uid {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for Uid {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = RoomError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "audio" => Ok(MediaKind::Audio),
            "video" => Ok(MediaKind::Video),
            other => Err(RoomError::internal(format!("Unknown media kind: {}", other))),
        }
    }
}

/// A remote participant as the session layer currently reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteParticipant {
    pub uid: Uid,
    pub has_audio: bool,
    pub has_video: bool,
}

impl RemoteParticipant {
    pub fn publishes(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.has_audio,
            MediaKind::Video => self.has_video,
        }
    }
}

/// Handle to a subscribed remote track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub uid: Uid,
    pub kind: MediaKind,
    pub track_id: String,
}

/// Notifications delivered by the session layer.
///
/// Delivery is best effort: events may be lost, and there is no ordering
/// guarantee between a participant's audio and video events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    UserPublished {
        user: RemoteParticipant,
        kind: MediaKind,
    },
    UserUnpublished {
        uid: Uid,
    },
    UserLeft {
        uid: Uid,
    },
}

/// A locally captured track (microphone or camera)
#[async_trait]
pub trait LocalTrack: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn is_muted(&self) -> bool;

    async fn set_muted(&self, muted: bool) -> Result<()>;

    /// Stops capture. The track can no longer be played.
    fn stop(&self);

    /// Releases the underlying device.
    fn close(&self);
}

#[derive(Clone)]
pub struct LocalTracks {
    pub audio: Arc<dyn LocalTrack>,
    pub video: Arc<dyn LocalTrack>,
}

impl LocalTracks {
    pub fn get(&self, kind: MediaKind) -> &Arc<dyn LocalTrack> {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }

    pub fn stop_and_close(&self) {
        for track in [&self.audio, &self.video] {
            track.stop();
            track.close();
        }
    }
}

impl fmt::Debug for LocalTracks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTracks")
            .field("audio", &self.audio.id())
            .field("video", &self.video.id())
            .finish()
    }
}

/// The session SDK as seen by the room controller
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Hands out the event receiver. Only the first call returns `Some`.
    async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>>;

    /// Joins `channel` and returns the uid the session assigned.
    async fn join(
        &self,
        app_id: &str,
        channel: &str,
        token: Option<&str>,
        uid: Option<Uid>,
    ) -> Result<Uid>;

    async fn create_local_tracks(&self) -> Result<LocalTracks>;

    async fn publish(&self, tracks: &LocalTracks) -> Result<()>;

    async fn subscribe(&self, uid: &Uid, kind: MediaKind) -> Result<RemoteTrack>;

    /// Authoritative list of remote participants currently in the session.
    /// An error means the list is unknown, not that the room is empty.
    async fn remote_users(&self) -> Result<Vec<RemoteParticipant>>;

    async fn leave(&self) -> Result<()>;
}
