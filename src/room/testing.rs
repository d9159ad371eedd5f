use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::directory::{MemberDirectory, MemberIdentity, MemberRecord};
use crate::error::{Result, RoomError};
use crate::session::loopback::{LoopbackClient, LoopbackHub};
use crate::session::{SessionClient, Uid};

/// In-memory directory with call recording and lookup failures on demand
#[derive(Default)]
pub struct FakeDirectory {
    names: Mutex<HashMap<Uid, String>>,
    failing_lookups: Mutex<HashMap<Uid, u32>>,
    lookups: Mutex<Vec<(Uid, String)>>,
    created: Mutex<Vec<MemberIdentity>>,
    deleted: Mutex<Vec<MemberIdentity>>,
    stalled_lookups: AtomicBool,
    stalled_deletes: AtomicBool,
}

impl FakeDirectory {
    pub fn insert(&self, uid: &str, name: &str) {
        self.names.lock().unwrap().insert(Uid::from(uid), name.to_string());
    }

    pub fn fail_lookups(&self, uid: &str, times: u32) {
        self.failing_lookups.lock().unwrap().insert(Uid::from(uid), times);
    }

    /// Lookups are recorded and then never answered.
    pub fn stall_lookups(&self, stalled: bool) {
        self.stalled_lookups.store(stalled, Ordering::SeqCst);
    }

    /// Deletes are recorded and then never answered.
    pub fn stall_deletes(&self, stalled: bool) {
        self.stalled_deletes.store(stalled, Ordering::SeqCst);
    }

    pub fn lookups(&self) -> Vec<(Uid, String)> {
        self.lookups.lock().unwrap().clone()
    }

    pub fn created(&self) -> Vec<MemberIdentity> {
        self.created.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<MemberIdentity> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl MemberDirectory for FakeDirectory {
    async fn create_member(&self, member: &MemberIdentity) -> Result<MemberRecord> {
        self.created.lock().unwrap().push(member.clone());
        self.insert(member.uid.as_str(), &member.name);
        Ok(MemberRecord {
            name: member.name.clone(),
            room_name: None,
            uid: None,
        })
    }

    async fn get_member(&self, uid: &Uid, room_name: &str) -> Result<MemberRecord> {
        self.lookups
            .lock()
            .unwrap()
            .push((uid.clone(), room_name.to_string()));
        if self.stalled_lookups.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }

        if let Some(remaining) = self.failing_lookups.lock().unwrap().get_mut(uid) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RoomError::directory("get_member failed with status 503"));
            }
        }

        let name = self.names.lock().unwrap().get(uid).cloned();
        name.map(|name| MemberRecord {
            name,
            room_name: Some(room_name.to_string()),
            uid: Some(uid.clone()),
        })
        .ok_or_else(|| RoomError::directory("get_member failed with status 404"))
    }

    async fn delete_member(&self, member: &MemberIdentity) -> Result<serde_json::Value> {
        self.deleted.lock().unwrap().push(member.clone());
        if self.stalled_deletes.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        self.names.lock().unwrap().remove(&member.uid);
        Ok(serde_json::json!("Member deleted"))
    }
}

/// Joins `uid` to channel "R7" and publishes both local tracks.
pub async fn joined_with_tracks(hub: &LoopbackHub, uid: &str) -> LoopbackClient {
    let client = hub.client();
    client
        .join("app", "R7", None, Some(Uid::from(uid)))
        .await
        .unwrap();
    let tracks = client.create_local_tracks().await.unwrap();
    client.publish(&tracks).await.unwrap();
    client
}
