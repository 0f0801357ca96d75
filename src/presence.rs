//! Participant presence and role tracking
//!
//! This module tracks everyone attached to a session: their stable id,
//! display name, role and whether a tunnel is currently attached. It also
//! owns those tunnels and is the only place frames are pushed from, so
//! broadcast targeting (everyone, one role, one participant) lives here.

use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
    str::FromStr,
};

use derive_where::derive_where;
use enum_map::{Enum, EnumMap};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use uuid::Uuid;

use crate::{
    Error, OutgoingMessage,
    access_code::AccessCode,
    constants,
    error::Missing,
    session::{SyncMessage, UpdateMessage},
    tunnel::Tunnel,
};

/// A stable participant identifier
///
/// The id is chosen by the identity collaborator and survives reconnects:
/// joining again with the same id restores the participant.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, DeserializeFromStr, SerializeDisplay,
)]
pub struct Id(Uuid);

impl Id {
    /// Creates a new random participant ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Id {
    type Err = uuid::Error;

    /// Parses an ID from a UUID string
    ///
    /// # Errors
    ///
    /// Returns a `uuid::Error` if the string is not a valid UUID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

/// What a participant is allowed to do in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum, Serialize, Deserialize)]
pub enum Role {
    /// Answers questions and is scored
    Player,
    /// Watches the match, never evaluated
    Observer,
    /// Drives the match; exactly one per session
    Manager,
}

/// Whether a participant currently has a tunnel attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    /// A tunnel is attached
    Connected,
    /// The participant left or lost their tunnel
    Disconnected,
}

/// How a join request was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Joined {
    /// First time this id joined the session
    New,
    /// The id was already known; its tunnel was replaced
    Returning,
}

#[derive_where(Debug)]
struct Participant<T> {
    name: String,
    role: Role,
    #[derive_where(skip)]
    tunnel: Option<T>,
}

impl<T> Participant<T> {
    fn status(&self) -> ConnectionStatus {
        if self.tunnel.is_some() {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }
}

/// One row of the participant list shown to the manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceEntry {
    /// Participant id
    pub id: Id,
    /// Display name
    pub name: String,
    /// Role in the session
    pub role: Role,
    /// Whether a tunnel is attached
    pub status: ConnectionStatus,
}

/// Tracks all participants of one session
#[derive_where(Debug)]
pub struct Presence<T> {
    session: AccessCode,
    mapping: HashMap<Id, Participant<T>>,
    /// Reverse mapping organized by role for efficient filtering
    reverse_mapping: EnumMap<Role, HashSet<Id>>,
}

impl<T: Tunnel> Presence<T> {
    /// Creates an empty tracker for the given session
    pub fn new(session: AccessCode) -> Self {
        Self {
            session,
            mapping: HashMap::new(),
            reverse_mapping: EnumMap::default(),
        }
    }

    /// Attaches a participant, or reattaches a known one
    ///
    /// A returning participant keeps the role they first joined with; the
    /// requested role is ignored and any previous tunnel is closed.
    ///
    /// # Errors
    ///
    /// * [`Error::ManagerAlreadyPresent`] if a different id already manages
    ///   the session
    /// * [`Error::MaximumParticipants`] if the session is full
    pub fn join(&mut self, id: Id, name: String, role: Role, tunnel: T) -> Result<Joined, Error> {
        if let Some(participant) = self.mapping.get_mut(&id) {
            if let Some(previous) = participant.tunnel.replace(tunnel) {
                previous.close();
            }
            participant.name = name;
            return Ok(Joined::Returning);
        }

        if role == Role::Manager && !self.reverse_mapping[Role::Manager].is_empty() {
            return Err(Error::ManagerAlreadyPresent);
        }

        if self.mapping.len() >= constants::session::MAX_PARTICIPANT_COUNT {
            return Err(Error::MaximumParticipants);
        }

        self.mapping.insert(
            id,
            Participant {
                name,
                role,
                tunnel: Some(tunnel),
            },
        );
        self.reverse_mapping[role].insert(id);

        Ok(Joined::New)
    }

    /// Detaches and closes a participant's tunnel; the participant stays known
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the id never joined.
    pub fn disconnect(&mut self, id: Id) -> Result<(), Error> {
        let participant = self
            .mapping
            .get_mut(&id)
            .ok_or(Error::NotFound(Missing::Participant))?;

        if let Some(tunnel) = participant.tunnel.take() {
            tunnel.close();
        }

        Ok(())
    }

    /// Closes every tunnel, used when the session is torn down
    pub fn close_all(&mut self) {
        for participant in self.mapping.values_mut() {
            if let Some(tunnel) = participant.tunnel.take() {
                tunnel.close();
            }
        }
    }

    /// Role of a known participant
    pub fn role(&self, id: Id) -> Option<Role> {
        self.mapping.get(&id).map(|p| p.role)
    }

    /// Whether the participant has a tunnel attached
    pub fn is_connected(&self, id: Id) -> bool {
        self.mapping
            .get(&id)
            .is_some_and(|p| p.status() == ConnectionStatus::Connected)
    }

    /// Whether anyone at all is connected
    pub fn any_connected(&self) -> bool {
        self.mapping
            .values()
            .any(|p| p.status() == ConnectionStatus::Connected)
    }

    /// Ids of every participant with the given role, connected or not
    pub fn ids(&self, role: Role) -> impl Iterator<Item = Id> + '_ {
        self.reverse_mapping[role].iter().copied()
    }

    /// Ids of the connected participants with the given role
    pub fn connected_ids(&self, role: Role) -> impl Iterator<Item = Id> + '_ {
        self.ids(role).filter(|id| self.is_connected(*id))
    }

    /// Number of participants with the given role, connected or not
    pub fn count(&self, role: Role) -> usize {
        self.reverse_mapping[role].len()
    }

    /// Number of participants across all roles
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    /// Whether nobody ever joined
    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    /// The participant list, sorted by role then name
    pub fn roster(&self) -> Vec<PresenceEntry> {
        self.mapping
            .iter()
            .map(|(id, p)| PresenceEntry {
                id: *id,
                name: p.name.clone(),
                role: p.role,
                status: p.status(),
            })
            .sorted_by(|a, b| {
                (a.role as u8, &a.name, a.id).cmp(&(b.role as u8, &b.name, b.id))
            })
            .collect_vec()
    }

    fn wrap<M>(&self, message: M) -> OutgoingMessage<M> {
        OutgoingMessage {
            session: self.session,
            message,
        }
    }

    /// Sends an update to one participant, if connected
    pub fn send_message(&self, message: &UpdateMessage, id: Id) {
        let Some(tunnel) = self.mapping.get(&id).and_then(|p| p.tunnel.as_ref()) else {
            return;
        };

        tunnel.send_message(&self.wrap(message.clone()));
    }

    /// Sends a full state sync to one participant, if connected
    pub fn send_state(&self, message: &SyncMessage, id: Id) {
        let Some(tunnel) = self.mapping.get(&id).and_then(|p| p.tunnel.as_ref()) else {
            return;
        };

        tunnel.send_state(&self.wrap(message.clone()));
    }

    /// Sends personalized messages to every connected participant
    ///
    /// The sender is called once per participant and may return `None` to
    /// skip them.
    pub fn announce_with<S>(&self, sender: S)
    where
        S: Fn(Id, Role) -> Option<UpdateMessage>,
    {
        for (id, participant) in &self.mapping {
            let Some(tunnel) = participant.tunnel.as_ref() else {
                continue;
            };
            let Some(message) = sender(*id, participant.role) else {
                continue;
            };

            tunnel.send_message(&self.wrap(message));
        }
    }

    /// Broadcasts an update to every connected participant
    pub fn announce(&self, message: &UpdateMessage) {
        self.announce_with(|_, _| Some(message.clone()));
    }

    /// Sends an update to every connected participant with the given role
    pub fn announce_specific(&self, filter: Role, message: &UpdateMessage) {
        let wrapped = self.wrap(message.clone());
        for id in &self.reverse_mapping[filter] {
            if let Some(tunnel) = self.mapping.get(id).and_then(|p| p.tunnel.as_ref()) {
                tunnel.send_message(&wrapped);
            }
        }
    }
}
