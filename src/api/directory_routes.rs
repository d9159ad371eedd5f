use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use warp::http::StatusCode;
use warp::Filter;

use crate::directory::{MemberIdentity, MemberRecord};
use crate::session::Uid;

/// Stored membership row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMember {
    pub name: String,
    #[serde(rename = "UID")]
    pub uid: Uid,
    pub room_name: String,
}

/// In-memory membership table keyed by (room, uid)
#[derive(Clone, Default)]
pub struct MemberStore {
    members: Arc<RwLock<HashMap<(String, Uid), RoomMember>>>,
}

impl MemberStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing member for (room, uid) or inserts a new one.
    pub async fn get_or_create(&self, identity: &MemberIdentity) -> RoomMember {
        let mut members = self.members.write().await;
        let key = (identity.room_name.clone(), identity.uid.clone());

        members
            .entry(key)
            .or_insert_with(|| {
                tracing::info!(
                    uid = %identity.uid,
                    room_name = %identity.room_name,
                    name = %identity.name,
                    "Member created"
                );
                RoomMember {
                    name: identity.name.clone(),
                    uid: identity.uid.clone(),
                    room_name: identity.room_name.clone(),
                }
            })
            .clone()
    }

    pub async fn get(&self, room_name: &str, uid: &Uid) -> Option<RoomMember> {
        let members = self.members.read().await;
        members.get(&(room_name.to_string(), uid.clone())).cloned()
    }

    /// Deletes the member only if name, room and uid all match.
    pub async fn delete(&self, identity: &MemberIdentity) -> bool {
        let mut members = self.members.write().await;
        let key = (identity.room_name.clone(), identity.uid.clone());

        match members.get(&key) {
            Some(member) if member.name == identity.name => {
                members.remove(&key);
                tracing::info!(uid = %identity.uid, room_name = %identity.room_name, "Member deleted");
                true
            }
            _ => false,
        }
    }

    pub async fn list(&self, room_name: &str) -> Vec<RoomMember> {
        let members = self.members.read().await;
        let mut list: Vec<RoomMember> = members
            .values()
            .filter(|m| m.room_name == room_name)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.uid.cmp(&b.uid));
        list
    }
}

#[derive(Debug, Deserialize)]
struct MemberQuery {
    #[serde(rename = "UID")]
    uid: Uid,
    room_name: String,
}

#[derive(Debug, Deserialize)]
struct RoomQuery {
    room_name: String,
}

type JsonReply = warp::reply::WithStatus<warp::reply::Json>;

fn not_found(message: String) -> JsonReply {
    warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "error": message })),
        StatusCode::NOT_FOUND,
    )
}

fn record_of(member: &RoomMember) -> MemberRecord {
    MemberRecord {
        name: member.name.clone(),
        room_name: None,
        uid: None,
    }
}

/// `create_member`, `get_member`, `delete_member` and `members` routes
pub fn directory_routes(
    store: MemberStore,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    create_member_route(store.clone())
        .or(get_member_route(store.clone()))
        .or(delete_member_route(store.clone()))
        .or(list_members_route(store))
}

fn create_member_route(
    store: MemberStore,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("create_member")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_store(store))
        .and_then(|identity: MemberIdentity, store: MemberStore| async move {
            let member = store.get_or_create(&identity).await;
            Ok::<_, Infallible>(warp::reply::with_status(
                warp::reply::json(&record_of(&member)),
                StatusCode::OK,
            ))
        })
}

fn get_member_route(
    store: MemberStore,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("get_member")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<MemberQuery>())
        .and(with_store(store))
        .and_then(|query: MemberQuery, store: MemberStore| async move {
            let reply = match store.get(&query.room_name, &query.uid).await {
                Some(member) => warp::reply::with_status(
                    warp::reply::json(&record_of(&member)),
                    StatusCode::OK,
                ),
                None => not_found(format!(
                    "No member {} in room {}",
                    query.uid, query.room_name
                )),
            };
            Ok::<_, Infallible>(reply)
        })
}

fn delete_member_route(
    store: MemberStore,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("delete_member")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_store(store))
        .and_then(|identity: MemberIdentity, store: MemberStore| async move {
            let reply = if store.delete(&identity).await {
                warp::reply::with_status(warp::reply::json(&"Member deleted"), StatusCode::OK)
            } else {
                not_found(format!(
                    "No member {} named {} in room {}",
                    identity.uid, identity.name, identity.room_name
                ))
            };
            Ok::<_, Infallible>(reply)
        })
}

fn list_members_route(
    store: MemberStore,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("members")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<RoomQuery>())
        .and(with_store(store))
        .and_then(|query: RoomQuery, store: MemberStore| async move {
            let members = store.list(&query.room_name).await;
            Ok::<_, Infallible>(warp::reply::json(&members))
        })
}

fn with_store(
    store: MemberStore,
) -> impl Filter<Extract = (MemberStore,), Error = Infallible> + Clone {
    warp::any().map(move || store.clone())
}
