//! Server-assigned connection identifiers and the registry of accepted peers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use super::connection::{Connection, ConnectionId};

/// Identifier an acceptor hands to each peer it registers.
///
/// Built as `accept counter + wall clock milliseconds`, bumped past the
/// previous value when the clock stalls or goes backwards, so the UIDs of
/// one acceptor are strictly increasing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(u64);

impl Uid {
    /// Wrap a raw value, e.g. one parsed from a greeting.
    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw UID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Parse a greeting line of the form `UID: <n>`.
    pub fn parse_greeting(line: &str) -> Option<Self> {
        line.trim_end()
            .strip_prefix(GREETING_PREFIX)?
            .trim()
            .parse()
            .ok()
            .map(Self)
    }

    /// The greeting line sent to a peer, without terminator.
    pub fn greeting(&self) -> String {
        format!("{GREETING_PREFIX}{}", self.0)
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

const GREETING_PREFIX: &str = "UID: ";

#[derive(Debug, Default)]
struct UidCounter {
    accepted: u64,
    last: Option<u64>,
}

/// Produces [`Uid`]s from a shared accept counter.
///
/// Counter and last issued value are updated under one lock, so concurrent
/// accept loops never draw the same UID.
#[derive(Debug, Default)]
pub(crate) struct UidGenerator {
    counter: Mutex<UidCounter>,
}

impl UidGenerator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Next UID, using the current wall clock.
    pub(crate) fn next(&self) -> Uid {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.next_at(millis)
    }

    /// Next UID for a given wall clock reading.
    pub(crate) fn next_at(&self, millis: u64) -> Uid {
        let mut counter = self.counter.lock();
        counter.accepted += 1;
        let candidate = counter.accepted.saturating_add(millis);
        let value = match counter.last {
            Some(last) if candidate <= last => last + 1,
            _ => candidate,
        };
        counter.last = Some(value);
        Uid(value)
    }
}

/// Why [`Registry::insert`] refused a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Rejected {
    /// The acceptor was asked to stop.
    Closed,
    DuplicateUid,
}

impl std::fmt::Display for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "acceptor is stopping"),
            Self::DuplicateUid => write!(f, "UID already registered"),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    by_uid: HashMap<Uid, Arc<Connection>>,
}

/// Live connections of an acceptor, addressable by [`Uid`].
///
/// Both maps are updated under one lock, so a registration is atomic with
/// respect to lookups and other registrations.
#[derive(Default)]
pub(crate) struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `connection` under `uid`.
    ///
    /// `open` is evaluated under the registry lock; registration is refused
    /// when it returns false or when `uid` is already taken. An existing
    /// entry is never replaced.
    pub(crate) fn insert(
        &self,
        uid: Uid,
        connection: Arc<Connection>,
        open: impl FnOnce() -> bool,
    ) -> Result<(), Rejected> {
        let mut inner = self.inner.lock();
        if !open() {
            return Err(Rejected::Closed);
        }
        if inner.by_uid.contains_key(&uid) {
            return Err(Rejected::DuplicateUid);
        }
        inner.connections.insert(connection.id(), connection.clone());
        inner.by_uid.insert(uid, connection);
        Ok(())
    }

    pub(crate) fn get(&self, uid: Uid) -> Option<Arc<Connection>> {
        self.inner.lock().by_uid.get(&uid).cloned()
    }

    pub(crate) fn contains(&self, uid: Uid) -> bool {
        self.inner.lock().by_uid.contains_key(&uid)
    }

    pub(crate) fn remove(&self, uid: Uid) -> Option<Arc<Connection>> {
        let mut inner = self.inner.lock();
        let connection = inner.by_uid.remove(&uid)?;
        inner.connections.remove(&connection.id());
        Some(connection)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub(crate) fn uids(&self) -> Vec<Uid> {
        let mut uids: Vec<Uid> = self.inner.lock().by_uid.keys().copied().collect();
        uids.sort();
        uids
    }

    pub(crate) fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.lock().connections.values().cloned().collect()
    }

    pub(crate) fn entries(&self) -> Vec<(Uid, Arc<Connection>)> {
        self.inner
            .lock()
            .by_uid
            .iter()
            .map(|(uid, conn)| (*uid, conn.clone()))
            .collect()
    }

    /// Remove and return every registered connection.
    pub(crate) fn clear(&self) -> Vec<Arc<Connection>> {
        let mut inner = self.inner.lock();
        inner.by_uid.clear();
        inner.connections.drain().map(|(_, conn)| conn).collect()
    }
}
