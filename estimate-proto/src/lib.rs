//! Room protocol vocabulary for estimate sessions.
//!
//! This crate defines the wire-level pieces shared by hosts and
//! participants:
//! - The message sum type ([`RoomMessage`]) and its JSON encoding
//! - Room codes and participant IDs ([`RoomCode`], [`ParticipantId`])
//! - The fixed estimation card deck ([`CARD_DECK`])
//! - Per-participant roster entries ([`Participant`], [`Estimate`])
//!
//! Everything here is transport-agnostic: messages are encoded to bytes
//! and handed to whatever link carries them.

pub mod card;
pub mod error;
pub mod id;
pub mod message;
pub mod participant;

pub use card::{is_card, CARD_DECK};
pub use error::{Error, Result};
pub use id::{ParticipantId, RoomCode};
pub use message::RoomMessage;
pub use participant::{Estimate, Participant};
