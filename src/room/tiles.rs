use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::controls::ControlState;
use crate::session::Uid;

/// One rendered participant: video surface plus name label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tile {
    pub uid: Uid,
    pub label: String,
    pub video_track: Option<String>,
    pub local: bool,
}

impl Tile {
    pub fn local(uid: Uid, label: impl Into<String>, video_track: impl Into<String>) -> Self {
        Self {
            uid,
            label: label.into(),
            video_track: Some(video_track.into()),
            local: true,
        }
    }

    pub fn remote(uid: Uid, label: impl Into<String>, video_track: impl Into<String>) -> Self {
        Self {
            uid,
            label: label.into(),
            video_track: Some(video_track.into()),
            local: false,
        }
    }
}

/// Changes pushed to whoever is displaying the room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ViewEvent {
    RoomLabel { name: String },
    TileAdded { tile: Tile },
    TileRelabeled { uid: Uid, label: String },
    TileRemoved { uid: Uid },
    ControlChanged { state: ControlState },
    Navigate { location: String },
}

/// The tile container. Holds at most one tile per uid, in insertion order.
pub struct TileBoard {
    room_label: String,
    tiles: Vec<Tile>,
    events: broadcast::Sender<ViewEvent>,
}

impl TileBoard {
    pub fn new(events: broadcast::Sender<ViewEvent>) -> Self {
        Self {
            room_label: String::new(),
            tiles: Vec::new(),
            events,
        }
    }

    pub fn emit(&self, event: ViewEvent) {
        // No viewers attached is fine
        let _ = self.events.send(event);
    }

    pub fn set_room_label(&mut self, name: impl Into<String>) {
        self.room_label = name.into();
        self.emit(ViewEvent::RoomLabel {
            name: self.room_label.clone(),
        });
    }

    pub fn room_label(&self) -> &str {
        &self.room_label
    }

    /// Renders `tile`, replacing any tile already shown for the same uid.
    /// Returns true when a stale tile was replaced.
    pub fn render(&mut self, tile: Tile) -> bool {
        let replaced = self.remove(&tile.uid).is_some();
        if replaced {
            tracing::debug!(uid = %tile.uid, "Replacing stale tile");
        }

        self.tiles.push(tile.clone());
        self.emit(ViewEvent::TileAdded { tile });
        replaced
    }

    pub fn relabel(&mut self, uid: &Uid, label: impl Into<String>) -> bool {
        let Some(tile) = self.tiles.iter_mut().find(|t| &t.uid == uid) else {
            return false;
        };

        tile.label = label.into();
        let event = ViewEvent::TileRelabeled {
            uid: uid.clone(),
            label: tile.label.clone(),
        };
        self.emit(event);
        true
    }

    pub fn remove(&mut self, uid: &Uid) -> Option<Tile> {
        let index = self.tiles.iter().position(|t| &t.uid == uid)?;
        let tile = self.tiles.remove(index);
        self.emit(ViewEvent::TileRemoved { uid: uid.clone() });
        Some(tile)
    }

    pub fn clear(&mut self) {
        let uids: Vec<Uid> = self.tiles.iter().map(|t| t.uid.clone()).collect();
        for uid in uids {
            self.remove(&uid);
        }
    }

    pub fn navigate(&self, location: impl Into<String>) {
        self.emit(ViewEvent::Navigate {
            location: location.into(),
        });
    }

    pub fn get(&self, uid: &Uid) -> Option<&Tile> {
        self.tiles.iter().find(|t| &t.uid == uid)
    }

    pub fn contains(&self, uid: &Uid) -> bool {
        self.get(uid).is_some()
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn remote_uids(&self) -> impl Iterator<Item = &Uid> {
        self.tiles.iter().filter(|t| !t.local).map(|t| &t.uid)
    }
}
