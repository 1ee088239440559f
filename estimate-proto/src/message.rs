use serde::{Deserialize, Serialize};

use crate::card::is_card;
use crate::error::{Error, Result};
use crate::id::ParticipantId;
use crate::participant::Participant;

/// Messages exchanged between host and participants over a link.
///
/// A closed vocabulary keyed by the `type` tag. Anything that fails to
/// decode as one of these kinds is discarded at the boundary; it is
/// never coerced into another kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RoomMessage {
    /// Participant asks to be admitted. Idempotent on retry.
    Join { id: ParticipantId, name: String },

    /// Host replaces each recipient's cached roster view.
    Participants { participants: Vec<Participant> },

    /// Host starts a round; recipients reset local submission state.
    StartRound { round: u32 },

    /// Participant submits points for a round. The host records them
    /// only if `round` matches its current round.
    Submit {
        round: u32,
        participant_id: ParticipantId,
        points: u32,
    },
}

impl RoomMessage {
    /// Get a short description of the message type
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Participants { .. } => "participants",
            Self::StartRound { .. } => "start-round",
            Self::Submit { .. } => "submit",
        }
    }

    /// Encode to the JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::MalformedMessage(e.to_string()))
    }

    /// Decode and validate a message from the wire.
    ///
    /// Rejects unknown `type` tags, missing or mistyped payload fields,
    /// and `submit` points outside the card deck.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let message: Self =
            serde_json::from_slice(bytes).map_err(|e| Error::MalformedMessage(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Join { id, .. } => {
                if id.as_str().is_empty() {
                    return Err(Error::MalformedMessage("join with empty id".to_string()));
                }
            }
            Self::Submit { points, .. } => {
                if !is_card(*points) {
                    return Err(Error::InvalidCard(*points));
                }
            }
            Self::Participants { .. } | Self::StartRound { .. } => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::Estimate;

    #[test]
    fn test_message_roundtrip() {
        let messages = vec![
            RoomMessage::Join {
                id: ParticipantId::from("device-a"),
                name: "Alice".to_string(),
            },
            RoomMessage::Participants {
                participants: vec![Participant {
                    id: ParticipantId::from("device-a"),
                    name: "Alice".to_string(),
                    estimate: Estimate::Submitted(8),
                }],
            },
            RoomMessage::StartRound { round: 3 },
            RoomMessage::Submit {
                round: 3,
                participant_id: ParticipantId::from("device-a"),
                points: 5,
            },
        ];

        for message in messages {
            let bytes = message.encode().expect("encode");
            let back = RoomMessage::decode(&bytes).expect("decode");
            assert_eq!(back, message);
        }
    }

    #[test]
    fn test_wire_tags() {
        let bytes = RoomMessage::StartRound { round: 2 }.encode().expect("encode");
        let json = String::from_utf8(bytes).expect("utf8");
        assert!(json.contains(r#""type":"start-round""#));

        let bytes = RoomMessage::Join {
            id: ParticipantId::from("x"),
            name: "X".to_string(),
        }
        .encode()
        .expect("encode");
        let json = String::from_utf8(bytes).expect("utf8");
        assert!(json.contains(r#""type":"join""#));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result = RoomMessage::decode(br#"{"type":"kick","id":"a"}"#);
        assert!(matches!(result, Err(Error::MalformedMessage(_))));
    }

    #[test]
    fn test_missing_field_rejected() {
        let result = RoomMessage::decode(br#"{"type":"submit","round":1}"#);
        assert!(matches!(result, Err(Error::MalformedMessage(_))));
    }

    #[test]
    fn test_no_type_coercion() {
        // points as a string must not be coerced into a number
        let result =
            RoomMessage::decode(br#"{"type":"submit","round":1,"participant_id":"a","points":"5"}"#);
        assert!(matches!(result, Err(Error::MalformedMessage(_))));
    }

    #[test]
    fn test_submit_outside_deck_rejected() {
        let result =
            RoomMessage::decode(br#"{"type":"submit","round":1,"participant_id":"a","points":4}"#);
        assert!(matches!(result, Err(Error::InvalidCard(4))));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(RoomMessage::decode(b"not json at all").is_err());
        assert!(RoomMessage::decode(b"").is_err());
        assert!(RoomMessage::decode(b"[1,2,3]").is_err());
    }
}
