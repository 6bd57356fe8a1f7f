use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;

use protocol::{AppError, AppResult, ServerEvent, generate_room_code};

pub const ROOM_CAPACITY: usize = 2;
const MAX_CODE_DRAWS: usize = 64;

pub type MemberId = String;
pub type MemberOutbox = mpsc::UnboundedSender<ServerEvent>;

fn read_lock<'a, T>(lock: &'a RwLock<T>, name: &'static str) -> std::sync::RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(event = "room_lock_poisoned", lock = name, access = "read");
            poisoned.into_inner()
        }
    }
}

fn write_lock<'a, T>(
    lock: &'a RwLock<T>,
    name: &'static str,
) -> std::sync::RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(event = "room_lock_poisoned", lock = name, access = "write");
            poisoned.into_inner()
        }
    }
}

fn lock_room<'a>(lock: &'a Mutex<Room>) -> std::sync::MutexGuard<'a, Room> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(event = "room_lock_poisoned", lock = "room", access = "mutex");
            poisoned.into_inner()
        }
    }
}

struct RoomMember {
    id: MemberId,
    outbox: MemberOutbox,
}

#[derive(Default)]
struct Room {
    members: Vec<RoomMember>,
}

impl Room {
    fn size(&self) -> usize {
        self.members.len()
    }

    fn contains(&self, member_id: &str) -> bool {
        self.members.iter().any(|member| member.id == member_id)
    }

    fn broadcast(&self, event: &ServerEvent) {
        for member in &self.members {
            if member.outbox.send(event.clone()).is_err() {
                tracing::debug!(event = "room_outbox_closed", member_id = member.id);
            }
        }
    }

    fn send_to_others(&self, member_id: &str, event: &ServerEvent) {
        for member in &self.members {
            if member.id == member_id {
                continue;
            }
            if member.outbox.send(event.clone()).is_err() {
                tracing::debug!(event = "room_outbox_closed", member_id = member.id);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined { size: usize },
    AlreadyJoined { size: usize },
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub code: String,
    pub remaining: usize,
}

#[derive(Clone, Default)]
pub struct RoomStore {
    rooms: Arc<RwLock<HashMap<String, Arc<Mutex<Room>>>>>,
    member_rooms: Arc<RwLock<HashMap<MemberId, String>>>,
}

impl RoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_code(&self) -> AppResult<String> {
        for _ in 0..MAX_CODE_DRAWS {
            let code = generate_room_code();
            let mut rooms = write_lock(self.rooms.as_ref(), "rooms");
            if !rooms.contains_key(code.as_str()) {
                rooms.insert(code.clone(), Arc::new(Mutex::new(Room::default())));
                return Ok(code);
            }
        }
        Err(AppError::new("room_code_space_exhausted", "房间码空间暂时耗尽")
            .with_context("draws", MAX_CODE_DRAWS.to_string()))
    }

    pub fn join(&self, code: &str, member_id: &str, outbox: MemberOutbox) -> JoinOutcome {
        let previous = read_lock(self.member_rooms.as_ref(), "member_rooms")
            .get(member_id)
            .cloned();
        if let Some(previous) = previous
            && previous != code
        {
            self.leave(member_id);
        }

        let room = {
            let mut rooms = write_lock(self.rooms.as_ref(), "rooms");
            rooms
                .entry(code.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Room::default())))
                .clone()
        };

        let mut guard = lock_room(room.as_ref());
        if guard.contains(member_id) {
            return JoinOutcome::AlreadyJoined { size: guard.size() };
        }
        if guard.size() >= ROOM_CAPACITY {
            return JoinOutcome::Full;
        }

        guard.members.push(RoomMember {
            id: member_id.to_string(),
            outbox,
        });
        write_lock(self.member_rooms.as_ref(), "member_rooms")
            .insert(member_id.to_string(), code.to_string());

        let size = guard.size();
        guard.send_to_others(member_id, &ServerEvent::PeerJoined);
        guard.broadcast(&ServerEvent::RoomSize { size });
        tracing::info!(event = "room_member_joined", code, member_id, size);
        JoinOutcome::Joined { size }
    }

    pub fn leave(&self, member_id: &str) -> Option<LeaveOutcome> {
        let code = write_lock(self.member_rooms.as_ref(), "member_rooms").remove(member_id)?;

        let mut rooms = write_lock(self.rooms.as_ref(), "rooms");
        let room = rooms.get(code.as_str())?.clone();
        let mut guard = lock_room(room.as_ref());
        guard.members.retain(|member| member.id != member_id);
        let remaining = guard.size();

        if remaining == 0 {
            drop(guard);
            rooms.remove(code.as_str());
        } else {
            guard.send_to_others(member_id, &ServerEvent::PeerLeft);
            guard.broadcast(&ServerEvent::RoomSize { size: remaining });
        }

        tracing::info!(event = "room_member_left", code, member_id, remaining);
        Some(LeaveOutcome { code, remaining })
    }

    pub fn exists(&self, code: &str) -> bool {
        read_lock(self.rooms.as_ref(), "rooms").contains_key(code)
    }

    pub fn size(&self, code: &str) -> usize {
        let room = read_lock(self.rooms.as_ref(), "rooms").get(code).cloned();
        match room {
            Some(room) => lock_room(room.as_ref()).size(),
            None => 0,
        }
    }

    pub fn forward(&self, code: &str, sender_id: &str, event: ServerEvent) -> AppResult<()> {
        let room = read_lock(self.rooms.as_ref(), "rooms")
            .get(code)
            .cloned()
            .ok_or_else(|| {
                AppError::new("room_not_found", "房间不存在").with_context("code", code.to_string())
            })?;

        let guard = lock_room(room.as_ref());
        if !guard.contains(sender_id) {
            return Err(AppError::new("room_member_unknown", "发送方不在该房间内")
                .with_context("code", code.to_string())
                .with_context("memberId", sender_id.to_string()));
        }
        guard.send_to_others(sender_id, &event);
        Ok(())
    }
}
