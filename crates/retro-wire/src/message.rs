//! Message definitions and JSON codec

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use retro_core::{Category, CategoryLabelSet, Language, ParticipantId, RetroError, RetroResult};

use crate::MAX_FRAME_SIZE;

/// A session message.
///
/// Unrecognized `type` tags decode to [`Message::Unknown`] so receivers can
/// drop them through an explicit match arm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// Sent by the moderator as soon as a link opens
    SyncLabels {
        labels: CategoryLabelSet,
        language: Language,
    },
    /// Sent by the moderator on every heartbeat tick
    Heartbeat {
        labels: CategoryLabelSet,
        language: Language,
    },
    /// A note (or task) submitted by a contributor
    SubmitNote {
        content: String,
        category: Category,
        author: String,
    },
    /// Contributor readiness and display name
    Presence {
        id: ParticipantId,
        name: String,
        #[serde(rename = "isReady")]
        is_ready: bool,
    },
    #[serde(other)]
    Unknown,
}

impl Message {
    pub fn sync_labels(labels: CategoryLabelSet, language: Language) -> Self {
        Message::SyncLabels { labels, language }
    }

    pub fn heartbeat(labels: CategoryLabelSet, language: Language) -> Self {
        Message::Heartbeat { labels, language }
    }

    pub fn submit_note(
        content: impl Into<String>,
        category: Category,
        author: impl Into<String>,
    ) -> Self {
        Message::SubmitNote {
            content: content.into(),
            category,
            author: author.into(),
        }
    }

    pub fn presence(id: ParticipantId, name: impl Into<String>, is_ready: bool) -> Self {
        Message::Presence {
            id,
            name: name.into(),
            is_ready,
        }
    }

    /// Wire tag of this message
    pub fn kind(&self) -> &'static str {
        match self {
            Message::SyncLabels { .. } => "sync-labels",
            Message::Heartbeat { .. } => "heartbeat",
            Message::SubmitNote { .. } => "submit-note",
            Message::Presence { .. } => "presence",
            Message::Unknown => "unknown",
        }
    }

    /// Whether only the moderator may send this message
    pub fn is_from_moderator(&self) -> bool {
        matches!(self, Message::SyncLabels { .. } | Message::Heartbeat { .. })
    }

    /// Encode for the wire
    pub fn encode(&self) -> RetroResult<Bytes> {
        if matches!(self, Message::Unknown) {
            return Err(RetroError::MalformedMessage(
                "cannot encode an unknown message".to_string(),
            ));
        }
        let bytes =
            serde_json::to_vec(self).map_err(|e| RetroError::MalformedMessage(e.to_string()))?;
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(RetroError::FrameTooLarge {
                size: bytes.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(Bytes::from(bytes))
    }

    /// Decode a payload received from a peer
    pub fn decode(buf: &[u8]) -> RetroResult<Self> {
        if buf.len() > MAX_FRAME_SIZE {
            return Err(RetroError::FrameTooLarge {
                size: buf.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        serde_json::from_slice(buf).map_err(|e| RetroError::MalformedMessage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_note_wire_shape() {
        let msg = Message::submit_note("Good retro", Category::Good, "Hans");
        let bytes = msg.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["type"], "submit-note");
        assert_eq!(value["content"], "Good retro");
        assert_eq!(value["category"], "good");
        assert_eq!(value["author"], "Hans");
    }

    #[test]
    fn test_presence_uses_camel_case_ready_flag() {
        let msg = Message::presence(ParticipantId::new("abc"), "Lena", true);
        let bytes = msg.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["type"], "presence");
        assert_eq!(value["isReady"], true);
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_sync_labels_decode() {
        let raw = br#"{"type":"sync-labels","labels":{"good":"Great","neutral":"Meh","bad":"Bad","task":"Todo"},"language":"en"}"#;
        match Message::decode(raw).unwrap() {
            Message::SyncLabels { labels, language } => {
                assert_eq!(labels.good, "Great");
                assert_eq!(language, Language::En);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_tag_is_explicit() {
        let raw = br#"{"type":"drawing-stroke","points":[1,2,3]}"#;
        assert_eq!(Message::decode(raw).unwrap(), Message::Unknown);
        assert!(Message::Unknown.encode().is_err());
    }

    #[test]
    fn test_malformed_payloads_are_errors() {
        assert!(Message::decode(b"not json").is_err());
        assert!(Message::decode(br#"{"content":"no tag"}"#).is_err());
        assert!(Message::decode(br#"{"type":"submit-note","content":"x"}"#).is_err());
        assert!(Message::decode(br#"{"type":"submit-note","content":"x","category":"ugly","author":"a"}"#).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let big = vec![b' '; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            Message::decode(&big),
            Err(RetroError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_direction() {
        let labels = CategoryLabelSet::default();
        assert!(Message::heartbeat(labels.clone(), Language::De).is_from_moderator());
        assert!(Message::sync_labels(labels, Language::De).is_from_moderator());
        assert!(!Message::submit_note("x", Category::Bad, "a").is_from_moderator());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..512)) {
                let _ = Message::decode(&data);
            }
        }
    }
}
