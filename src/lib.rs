pub mod api;
pub mod config;
pub mod directory;
pub mod error;
pub mod room;
pub mod session;

pub use error::{Result, RoomError};
