//! # Matchplay
//!
//! Coordination engine for live quiz matches. A manager runs a timed
//! sequence of questions; players and observers join a session by access
//! code, submit answers before a server-enforced deadline, and receive
//! scores and live answer distributions as the match unfolds.
//!
//! Each session is owned by a single task ([`actor`]) that serializes every
//! join, command and timer wake-up through a mailbox. The [`registry`] maps
//! access codes to those tasks. Outbound frames leave through the
//! [`tunnel::Tunnel`] each participant provides.

#![cfg_attr(all(coverage_nightly, test), feature(coverage_attribute))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::ignored_unit_patterns)]
#![allow(clippy::struct_field_names)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_panics_doc)]

use serde::Serialize;

pub mod access_code;
pub mod actor;
pub mod answer;
pub mod config;
pub mod constants;
pub mod error;
pub mod evaluator;
pub mod histogram;
pub mod presence;
pub mod question;
pub mod registry;
pub mod scoreboard;
pub mod session;
pub mod timer;
pub mod tunnel;

pub use error::Error;

/// An outbound frame, tagged with the session it belongs to
#[derive(Debug, Serialize, Clone)]
pub struct OutgoingMessage<M> {
    /// Access code of the originating session
    pub session: access_code::AccessCode,
    /// The payload
    pub message: M,
}

impl<M: Serialize> OutgoingMessage<M> {
    /// Converts the message to a JSON string for transmission
    ///
    /// # Panics
    ///
    /// This method panics if serialization fails, which should never happen
    /// with the default JSON serializer for well-formed data.
    pub fn to_message(&self) -> String {
        serde_json::to_string(self).expect("default serializer cannot fail")
    }
}
