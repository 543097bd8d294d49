//! Session and room registry for one gateway instance.
//!
//! Maintains two maps: session → document (for routing submits and cleanup
//! on leave) and document → room (the room handle plus the set of local
//! member sessions). The member count is the room's reference count; the
//! gateway tears a room down when it reaches zero.
//!
//! Rooms must be inserted explicitly. Registering a session does not create
//! its room, and unregistering a session does not remove it from its room's
//! member set; the gateway drives both steps so it can detach the session
//! from the room task in between.

use std::collections::{HashMap, HashSet};

use mergeline_proto::{DocumentId, SessionId};

/// A registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    /// Document the session joined
    pub document_id: DocumentId,
    /// Last sequence number in the session's bootstrap view. `None` until the
    /// join completes.
    pub joined_at: Option<u64>,
}

#[derive(Debug)]
struct RoomEntry<R> {
    handle: R,
    members: HashSet<SessionId>,
}

/// Registry of sessions and document rooms.
///
/// Generic over the room handle so the bookkeeping can be tested without
/// spawning room tasks.
#[derive(Debug)]
pub struct RoomRegistry<R> {
    sessions: HashMap<SessionId, SessionEntry>,
    rooms: HashMap<DocumentId, RoomEntry<R>>,
}

impl<R> Default for RoomRegistry<R> {
    fn default() -> Self {
        Self { sessions: HashMap::new(), rooms: HashMap::new() }
    }
}

impl<R> RoomRegistry<R> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for a document.
    ///
    /// Returns `false` if the session id is already registered.
    pub fn register_session(&mut self, session_id: SessionId, document_id: DocumentId) -> bool {
        if self.sessions.contains_key(&session_id) {
            return false;
        }
        self.sessions.insert(session_id, SessionEntry { document_id, joined_at: None });
        true
    }

    /// Remove a session, returning its entry.
    pub fn unregister_session(&mut self, session_id: SessionId) -> Option<SessionEntry> {
        self.sessions.remove(&session_id)
    }

    /// Session entry. `None` if the session doesn't exist.
    pub fn session(&self, session_id: SessionId) -> Option<&SessionEntry> {
        self.sessions.get(&session_id)
    }

    /// Check if a session is registered.
    pub fn has_session(&self, session_id: SessionId) -> bool {
        self.sessions.contains_key(&session_id)
    }

    /// Record the bootstrap marker of a session.
    ///
    /// Returns `false` if the session doesn't exist.
    pub fn set_joined_at(&mut self, session_id: SessionId, sequence_number: u64) -> bool {
        match self.sessions.get_mut(&session_id) {
            Some(entry) => {
                entry.joined_at = Some(sequence_number);
                true
            },
            None => false,
        }
    }

    /// Number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Insert a room with no members.
    ///
    /// Returns `false` (and keeps the existing room) if one is present.
    pub fn insert_room(&mut self, document_id: DocumentId, handle: R) -> bool {
        if self.rooms.contains_key(&document_id) {
            return false;
        }
        self.rooms.insert(document_id, RoomEntry { handle, members: HashSet::new() });
        true
    }

    /// Remove a room, returning its handle.
    pub fn remove_room(&mut self, document_id: &DocumentId) -> Option<R> {
        self.rooms.remove(document_id).map(|entry| entry.handle)
    }

    /// Room handle for a document.
    pub fn room(&self, document_id: &DocumentId) -> Option<&R> {
        self.rooms.get(document_id).map(|entry| &entry.handle)
    }

    /// Check if a room exists for a document.
    pub fn has_room(&self, document_id: &DocumentId) -> bool {
        self.rooms.contains_key(document_id)
    }

    /// Number of live rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Add a member to a room. Returns the new member count, or `None` if
    /// the room doesn't exist.
    pub fn add_member(&mut self, document_id: &DocumentId, session_id: SessionId) -> Option<usize> {
        let entry = self.rooms.get_mut(document_id)?;
        entry.members.insert(session_id);
        Some(entry.members.len())
    }

    /// Remove a member from a room. Returns the remaining member count, or
    /// `None` if the room doesn't exist.
    pub fn remove_member(
        &mut self,
        document_id: &DocumentId,
        session_id: SessionId,
    ) -> Option<usize> {
        let entry = self.rooms.get_mut(document_id)?;
        entry.members.remove(&session_id);
        Some(entry.members.len())
    }

    /// Member sessions of a room.
    pub fn members(&self, document_id: &DocumentId) -> impl Iterator<Item = SessionId> + '_ {
        self.rooms.get(document_id).into_iter().flat_map(|entry| entry.members.iter().copied())
    }
}
