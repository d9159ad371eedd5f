pub mod directory_routes;
pub mod room_routes;
pub mod room_websocket;

use warp::Filter;

pub use directory_routes::{directory_routes, MemberStore, RoomMember};
pub use room_routes::{handle_rejection, room_routes, RoomSlot};
pub use room_websocket::{RoomFeed, RoomRequest};

/// Every route the process serves. The membership backend is only mounted
/// when `serve_directory` is set.
pub fn routes(
    slot: RoomSlot,
    store: MemberStore,
    serve_directory: bool,
) -> impl Filter<Extract = impl warp::Reply, Error = std::convert::Infallible> + Clone {
    let directory = warp::any()
        .and_then(move || async move {
            if serve_directory {
                Ok(())
            } else {
                Err(warp::reject::not_found())
            }
        })
        .untuple_one()
        .and(directory_routes(store));

    room_routes(slot)
        .or(directory)
        .recover(handle_rejection)
        .with(warp::trace::request())
}
