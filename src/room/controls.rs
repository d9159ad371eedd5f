use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RoomError};
use crate::session::{LocalTrack, MediaKind};

pub const LIVE_COLOR: &str = "#fff";
pub const MUTED_COLOR: &str = "rgb(255, 80, 80, 1)";

/// Mute toggles. Each drives one local track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Control {
    Microphone,
    Camera,
}

impl Control {
    pub fn kind(&self) -> MediaKind {
        match self {
            Control::Microphone => MediaKind::Audio,
            Control::Camera => MediaKind::Video,
        }
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Control::Microphone => f.write_str("microphone"),
            Control::Camera => f.write_str("camera"),
        }
    }
}

impl FromStr for Control {
    type Err = RoomError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "microphone" | "mic" => Ok(Control::Microphone),
            "camera" | "cam" => Ok(Control::Camera),
            other => Err(RoomError::internal(format!("Unknown control: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlState {
    pub control: Control,
    pub muted: bool,
    pub color: String,
}

impl ControlState {
    pub fn new(control: Control, muted: bool) -> Self {
        let color = if muted { MUTED_COLOR } else { LIVE_COLOR };
        Self {
            control,
            muted,
            color: color.to_string(),
        }
    }

    pub fn of(control: Control, track: &dyn LocalTrack) -> Self {
        Self::new(control, track.is_muted())
    }
}

/// Flips the mute state of `track`. The returned state is read back from the
/// track after the flip, so it matches the track even if another toggle raced
/// this one.
pub async fn toggle_mute(control: Control, track: &dyn LocalTrack) -> Result<ControlState> {
    let requested = !track.is_muted();
    track.set_muted(requested).await?;

    let state = ControlState::of(control, track);
    tracing::info!(control = %control, muted = state.muted, "Toggled local track");
    Ok(state)
}
