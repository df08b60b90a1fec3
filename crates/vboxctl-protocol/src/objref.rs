//! Opaque object reference tokens.
//!
//! A reference is a generational index into the server's object table,
//! scoped to the logon session that obtained it. The client never looks
//! inside; it only passes tokens back to the server.

use crate::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Handle to a server-side object.
///
/// Rendered on the wire as `ssssssss-oooooooo-gggg` (hex session, slot and
/// generation).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ObjectRef {
    session: u32,
    slot: u32,
    generation: u16,
}

impl ObjectRef {
    /// Build a reference. Only servers mint references.
    pub fn new(session: u32, slot: u32, generation: u16) -> Self {
        Self {
            session,
            slot,
            generation,
        }
    }

    /// Logon session that owns the referenced object.
    pub fn session(&self) -> u32 {
        self.session
    }

    /// Slot in the server's object table.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Generation of the slot when the reference was minted.
    pub fn generation(&self) -> u16 {
        self.generation
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}-{:08x}-{:04x}", self.session, self.slot, self.generation)
    }
}

impl FromStr for ObjectRef {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidObjectRef(s.to_string());

        let mut parts = s.split('-');
        let (Some(session), Some(slot), Some(generation), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        if session.len() != 8 || slot.len() != 8 || generation.len() != 4 {
            return Err(invalid());
        }

        Ok(Self {
            session: u32::from_str_radix(session, 16).map_err(|_| invalid())?,
            slot: u32::from_str_radix(slot, 16).map_err(|_| invalid())?,
            generation: u16::from_str_radix(generation, 16).map_err(|_| invalid())?,
        })
    }
}

impl From<ObjectRef> for String {
    fn from(r: ObjectRef) -> Self {
        r.to_string()
    }
}

impl TryFrom<String> for ObjectRef {
    type Error = ProtocolError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}
