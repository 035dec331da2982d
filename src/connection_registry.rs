// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Connection Registry
//!
//! Tracks live client sessions so host-originated messages can be routed
//! to one, many, or all connected clients.
//!
//! Each entry pairs the session's identity state with the sending end of
//! that connection's outbound channel. The channel is the only way to
//! reach a socket: the connection task owns the write half and drains the
//! channel, so handing out the sender would let callers bypass eviction.
//! Readers only ever get cloned [`Session`] snapshots.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{mpsc, Notify};

use crate::error::{DeliveryError, RegistryError};

/// Default depth of a session's outbound queue.
pub const DEFAULT_SEND_BUFFER: usize = 64;

/// A frame queued for a connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryMessage {
    /// Encoded JSON envelope to write as a text frame.
    Frame(String),
    /// Close the socket gracefully with the given reason.
    Close { reason: String },
}

/// Identity and auth state of one live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub remote_addr: Option<SocketAddr>,
    pub authenticated: bool,
    pub user_id: Option<String>,
    pub nickname: Option<String>,
}

impl Session {
    pub fn new(id: impl Into<String>, remote_addr: Option<SocketAddr>) -> Self {
        Session {
            id: id.into(),
            remote_addr,
            authenticated: false,
            user_id: None,
            nickname: None,
        }
    }

    /// User id derived from the session id, used when the client sends none.
    pub fn default_user_id(&self) -> String {
        format!("web_{}", prefix(&self.id, 8))
    }

    /// Nickname derived from the session id, used when the client sends none.
    pub fn default_nickname(&self) -> String {
        format!("WebChat User {}", prefix(&self.id, 4))
    }

    pub fn effective_user_id(&self) -> String {
        self.user_id
            .clone()
            .unwrap_or_else(|| self.default_user_id())
    }

    pub fn effective_nickname(&self) -> String {
        self.nickname
            .clone()
            .unwrap_or_else(|| self.default_nickname())
    }
}

fn prefix(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Receiving side handed to the connection task on registration.
#[derive(Debug)]
pub struct SessionChannel {
    pub session_id: String,
    pub receiver: mpsc::Receiver<RegistryMessage>,
    /// Signalled when the session is evicted and the socket must be dropped
    /// without draining the queue.
    pub kill: Arc<Notify>,
}

struct SessionEntry {
    session: Session,
    sender: mpsc::Sender<RegistryMessage>,
    kill: Arc<Notify>,
}

/// Thread-safe registry of connected sessions.
///
/// Every mutation takes the write lock for the duration of the map
/// operation only, so a reader never sees a half-updated session.
///
/// [`drain`](Self::drain) closes the registry until [`reopen`](Self::reopen)
/// is called. The flag is only read and written under the write lock, so a
/// session is either drained or refused, never left behind.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, SessionEntry>>,
    closed: AtomicBool,
    send_buffer: usize,
}

impl ConnectionRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::with_send_buffer(DEFAULT_SEND_BUFFER)
    }

    /// Creates a registry whose per-session queues hold `send_buffer` frames.
    pub fn with_send_buffer(send_buffer: usize) -> Self {
        ConnectionRegistry {
            connections: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            send_buffer: send_buffer.max(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, SessionEntry>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, SessionEntry>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new connection under a freshly generated id.
    ///
    /// Id collisions are regenerated until an unused id is found. Fails
    /// only when the registry is closed.
    pub fn register(
        &self,
        remote_addr: Option<SocketAddr>,
    ) -> Result<SessionChannel, RegistryError> {
        loop {
            let session = Session::new(uuid::Uuid::new_v4().to_string(), remote_addr);
            match self.insert(session) {
                Err(RegistryError::DuplicateId(id)) => {
                    tracing::warn!("Session id collision on {}, regenerating", id);
                }
                result => return result,
            }
        }
    }

    /// Inserts a session under its own id.
    pub fn insert(&self, session: Session) -> Result<SessionChannel, RegistryError> {
        let mut connections = self.write();
        if self.closed.load(Ordering::SeqCst) {
            return Err(RegistryError::Closed);
        }
        if connections.contains_key(&session.id) {
            return Err(RegistryError::DuplicateId(session.id));
        }
        let (tx, rx) = mpsc::channel(self.send_buffer);
        let kill = Arc::new(Notify::new());
        let session_id = session.id.clone();
        connections.insert(
            session_id.clone(),
            SessionEntry {
                session,
                sender: tx,
                kill: kill.clone(),
            },
        );
        Ok(SessionChannel {
            session_id,
            receiver: rx,
            kill,
        })
    }

    /// Removes a session. Removing an absent id is a no-op.
    pub fn unregister(&self, session_id: &str) -> Option<Session> {
        self.write().remove(session_id).map(|entry| entry.session)
    }

    /// Removes a session and tells its connection task to drop the socket.
    ///
    /// Returns false if the session was already gone.
    pub fn evict(&self, session_id: &str) -> bool {
        let entry = self.write().remove(session_id);
        match entry {
            Some(entry) => {
                entry.kill.notify_one();
                true
            }
            None => false,
        }
    }

    /// Removes every session and closes the registry, returning their
    /// queues so the caller can send a farewell before the senders are
    /// dropped.
    pub fn drain(&self) -> Vec<(Session, mpsc::Sender<RegistryMessage>, Arc<Notify>)> {
        let mut connections = self.write();
        self.closed.store(true, Ordering::SeqCst);
        connections
            .drain()
            .map(|(_, entry)| (entry.session, entry.sender, entry.kill))
            .collect()
    }

    /// Accepts registrations again after a [`drain`](Self::drain).
    pub fn reopen(&self) {
        let _connections = self.write();
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.read()
            .get(session_id)
            .map(|entry| entry.session.clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.read().contains_key(session_id)
    }

    /// Finds a session whose claimed user id matches.
    pub fn find_by_user_id(&self, user_id: &str) -> Option<Session> {
        self.read()
            .values()
            .find(|entry| entry.session.user_id.as_deref() == Some(user_id))
            .map(|entry| entry.session.clone())
    }

    /// Snapshot of all sessions. Later registry changes do not affect it.
    pub fn list(&self) -> Vec<Session> {
        self.read()
            .values()
            .map(|entry| entry.session.clone())
            .collect()
    }

    /// Marks a session authenticated and records its identity.
    ///
    /// Identity fields are only written on the first success; later calls
    /// leave them untouched. Missing claims fall back to id-derived values.
    pub fn mark_authenticated(
        &self,
        session_id: &str,
        user_id: Option<String>,
        nickname: Option<String>,
    ) -> Option<Session> {
        let mut connections = self.write();
        let entry = connections.get_mut(session_id)?;
        let session = &mut entry.session;
        if !session.authenticated {
            let user_id = user_id.unwrap_or_else(|| session.default_user_id());
            let nickname = nickname.unwrap_or_else(|| session.default_nickname());
            session.user_id = Some(user_id);
            session.nickname = Some(nickname);
            session.authenticated = true;
        }
        Some(session.clone())
    }

    /// Queues a message for a connected session without waiting.
    pub fn try_send(&self, session_id: &str, msg: RegistryMessage) -> Result<(), DeliveryError> {
        let connections = self.read();
        let entry = connections
            .get(session_id)
            .ok_or(DeliveryError::NotConnected)?;
        entry.sender.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::WriteFailed,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::ConnectionClosed,
        })
    }

    /// Returns the number of currently connected sessions.
    pub fn connected_count(&self) -> usize {
        self.read().len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
