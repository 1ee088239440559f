use std::str::FromStr;

use nanoid::nanoid;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Length of a room code.
pub const ROOM_CODE_LEN: usize = 8;

/// Alphabet for room codes. Excludes glyphs that are easy to misread
/// when shared verbally or copied by hand (0/O, 1/I).
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Generate a 12-character nanoid for entity IDs
pub fn generate_id() -> String {
    nanoid!(12)
}

/// Human-shareable room code, generated once by the host at room
/// creation and immutable for the room's lifetime. Doubles as the
/// rendezvous key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    /// Generate a fresh room code.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let code: String = (0..ROOM_CODE_LEN)
            .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RoomCode {
    type Err = Error;

    /// Parse a manually entered room code. Lowercase input is accepted
    /// and normalized; length and alphabet are enforced.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_ascii_uppercase();
        if code.len() != ROOM_CODE_LEN
            || !code.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b))
        {
            return Err(Error::InvalidRoomCode(s.to_string()));
        }
        Ok(Self(code))
    }
}

impl std::fmt::Display for RoomCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Participant ID type, stable per device/session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    #[must_use]
    pub fn new() -> Self {
        Self(generate_id())
    }

    #[must_use]
    pub const fn from_string(id: String) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id() {
        let id = generate_id();
        assert_eq!(id.len(), 12);
    }

    #[test]
    fn test_room_code_generation() {
        let code1 = RoomCode::generate();
        let code2 = RoomCode::generate();
        assert_eq!(code1.as_str().len(), ROOM_CODE_LEN);
        assert!(code1
            .as_str()
            .bytes()
            .all(|b| ROOM_CODE_ALPHABET.contains(&b)));
        // Not a guarantee, but a collision here is vanishingly unlikely
        assert_ne!(code1, code2);
    }

    #[test]
    fn test_room_code_parse() {
        let code: RoomCode = "ABCD2345".parse().expect("valid code");
        assert_eq!(code.as_str(), "ABCD2345");

        // Lowercase is normalized
        let code: RoomCode = "abcd2345".parse().expect("valid code");
        assert_eq!(code.as_str(), "ABCD2345");

        // Wrong length
        assert!("ABC".parse::<RoomCode>().is_err());
        // Ambiguous glyphs rejected
        assert!("ABCD0145".parse::<RoomCode>().is_err());
        assert!("ABCDO145".parse::<RoomCode>().is_err());
    }

    #[test]
    fn test_participant_id() {
        let id1 = ParticipantId::new();
        let id2 = ParticipantId::new();
        assert_ne!(id1, id2);
        assert_eq!(id1.as_str().len(), 12);
    }
}
