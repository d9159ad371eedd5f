mod controls;
mod reconciler;
mod supervisor;
mod tiles;
#[cfg(test)]
pub(crate) mod testing;

use std::future::Future;
use std::time::Duration;

use crate::error::{Result, RoomError};

pub use controls::{toggle_mute, Control, ControlState, LIVE_COLOR, MUTED_COLOR};
pub use reconciler::{
    DisplayName, Participant, PresenceReconciler, ReconcileReport, ReconcilerOptions,
};
pub use supervisor::{JoinRequest, LeaveReport, RoomHandle, RoomOptions, RoomSession, RoomSnapshot};
pub use tiles::{Tile, TileBoard, ViewEvent};

/// Runs `fut` with an upper bound on how long it may stay suspended.
pub(crate) async fn bounded<T>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RoomError::Timeout(format!("{} after {:?}", what, limit))),
    }
}
