//! Handshake message schema
//!
//! Every message is a record tagged by `type`:
//!
//! | `type` | Variant | Carries `protocolVersion` |
//! |---|---|---|
//! | `sync step 1` | [`HandshakeMessage::VersionOffer`] | yes |
//! | `sync step 2` | [`HandshakeMessage::StateAndOps`] | yes |
//! | `sync done` | [`HandshakeMessage::Done`] | no |
//! | `sync stop` | [`HandshakeMessage::Stop`] | yes |
//! | `update` | [`HandshakeMessage::Update`] | no |
//! | `auth` | [`HandshakeMessage::AuthUpdate`] | no |
//!
//! Frames on a byte transport are the JSON form. The same records can be
//! carried as stanza trees via [`HandshakeMessage::to_tree`]; because the
//! tree encoding stringifies booleans and turns integer-looking strings into
//! numbers, the token and flag fields accept either shape on decode.

use concord_core::{DeleteSet, EncodedOp, StateVector};
use concord_wire::{Element, WireResult};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

/// A message of the sync protocol
///
/// The sender is never part of the payload; it is supplied by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HandshakeMessage {
    /// Phase 1: our state vector, asking the peer for what we lack
    #[serde(rename = "sync step 1", rename_all = "camelCase")]
    VersionOffer {
        state_set: StateVector,
        protocol_version: u32,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "lenient_token"
        )]
        auth: Option<String>,
        #[serde(
            default,
            skip_serializing_if = "is_false",
            deserialize_with = "lenient_bool"
        )]
        prefer_untransformed: bool,
    },

    /// Phase 2: our state, tombstones and the ops the peer is missing
    #[serde(rename = "sync step 2", rename_all = "camelCase")]
    StateAndOps {
        state_set: StateVector,
        delete_set: DeleteSet,
        protocol_version: u32,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "lenient_token"
        )]
        auth: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        os: Option<Vec<EncodedOp>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        os_untransformed: Option<Vec<EncodedOp>>,
    },

    /// The sender has finished serving our handshake
    #[serde(rename = "sync done")]
    Done,

    /// The sender refuses to sync with our protocol version
    #[serde(rename = "sync stop", rename_all = "camelCase")]
    Stop { protocol_version: u32 },

    /// Live operations
    #[serde(rename = "update")]
    Update { ops: Vec<EncodedOp> },

    /// The sender presents a new token
    #[serde(rename = "auth")]
    AuthUpdate {
        #[serde(default, deserialize_with = "lenient_token")]
        auth: Option<String>,
    },
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn lenient_token<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(token)) => Ok(Some(token)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(D::Error::custom(format!("invalid auth token: {}", other))),
    }
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Bool(b) => Ok(b),
        serde_json::Value::String(s) if s == "true" => Ok(true),
        serde_json::Value::String(s) if s == "false" => Ok(false),
        other => Err(D::Error::custom(format!("invalid flag: {}", other))),
    }
}

impl HandshakeMessage {
    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            HandshakeMessage::VersionOffer { .. } => "sync step 1",
            HandshakeMessage::StateAndOps { .. } => "sync step 2",
            HandshakeMessage::Done => "sync done",
            HandshakeMessage::Stop { .. } => "sync stop",
            HandshakeMessage::Update { .. } => "update",
            HandshakeMessage::AuthUpdate { .. } => "auth",
        }
    }

    /// Protocol version, for the message types that carry one
    pub fn protocol_version(&self) -> Option<u32> {
        match self {
            HandshakeMessage::VersionOffer {
                protocol_version, ..
            }
            | HandshakeMessage::StateAndOps {
                protocol_version, ..
            }
            | HandshakeMessage::Stop { protocol_version } => Some(*protocol_version),
            _ => None,
        }
    }

    /// Auth token presented with the message, if any
    pub fn auth_token(&self) -> Option<&str> {
        match self {
            HandshakeMessage::VersionOffer { auth, .. }
            | HandshakeMessage::StateAndOps { auth, .. }
            | HandshakeMessage::AuthUpdate { auth } => auth.as_deref(),
            _ => None,
        }
    }

    /// Encode as a JSON frame
    pub fn to_bytes(&self) -> WireResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a JSON frame
    pub fn from_bytes(frame: &[u8]) -> WireResult<Self> {
        Ok(serde_json::from_slice(frame)?)
    }

    /// Encode as a stanza tree
    pub fn to_tree(&self) -> WireResult<Element> {
        concord_wire::to_tree(self)
    }

    /// Decode a stanza tree
    pub fn from_tree(root: &Element) -> WireResult<Self> {
        concord_wire::from_tree(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::OpId;
    use serde_json::json;

    fn sample_ops() -> Vec<EncodedOp> {
        vec![
            EncodedOp::new("Insert", OpId::new("alice", 0)).with_field("content", "hello"),
            EncodedOp::new("Delete", OpId::new("bob", 4))
                .with_field("target", json!({"user": "alice", "clock": 0})),
        ]
    }

    #[test]
    fn test_offer_wire_shape() {
        let message = HandshakeMessage::VersionOffer {
            state_set: StateVector::new(),
            protocol_version: 11,
            auth: Some("token".into()),
            prefer_untransformed: true,
        };

        let json: serde_json::Value = serde_json::from_slice(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(
            json,
            json!({
                "type": "sync step 1",
                "stateSet": {},
                "protocolVersion": 11,
                "auth": "token",
                "preferUntransformed": true
            })
        );
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let message = HandshakeMessage::VersionOffer {
            state_set: StateVector::new(),
            protocol_version: 11,
            auth: None,
            prefer_untransformed: false,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert!(json.get("auth").is_none());
        assert!(json.get("preferUntransformed").is_none());

        let done = serde_json::to_value(&HandshakeMessage::Done).unwrap();
        assert_eq!(done, json!({"type": "sync done"}));
    }

    #[test]
    fn test_step_two_from_json() {
        let frame = json!({
            "type": "sync step 2",
            "stateSet": {"alice": 2},
            "deleteSet": {},
            "protocolVersion": 11,
            "osUntransformed": []
        });
        let message = HandshakeMessage::from_bytes(frame.to_string().as_bytes()).unwrap();

        let HandshakeMessage::StateAndOps {
            state_set,
            os,
            os_untransformed,
            ..
        } = message
        else {
            panic!("expected sync step 2");
        };
        assert_eq!(state_set.get("alice"), 2);
        assert!(os.is_none());
        assert_eq!(os_untransformed, Some(Vec::new()));
    }

    #[test]
    fn test_kind_and_version() {
        assert_eq!(HandshakeMessage::Done.kind(), "sync done");
        assert_eq!(HandshakeMessage::Done.protocol_version(), None);
        assert_eq!(
            HandshakeMessage::Stop {
                protocol_version: 10
            }
            .protocol_version(),
            Some(10)
        );
        assert_eq!(
            HandshakeMessage::Update { ops: Vec::new() }.protocol_version(),
            None
        );
        assert_eq!(
            HandshakeMessage::AuthUpdate {
                auth: Some("t".into())
            }
            .auth_token(),
            Some("t")
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(HandshakeMessage::from_bytes(br#"{"type": "sync step 9"}"#).is_err());
        assert!(HandshakeMessage::from_bytes(b"not json").is_err());
    }

    #[test]
    fn test_tree_round_trip() {
        let message = HandshakeMessage::StateAndOps {
            state_set: [("alice".to_string(), 1)].into_iter().collect(),
            delete_set: DeleteSet::new(),
            protocol_version: 11,
            auth: Some("writer".into()),
            os: Some(sample_ops()),
            os_untransformed: None,
        };

        let tree = message.to_tree().unwrap();
        assert_eq!(tree.attr("type"), Some("sync step 2"));
        assert_eq!(tree.attr("protocolVersion"), Some("11"));
        assert_eq!(HandshakeMessage::from_tree(&tree).unwrap(), message);
    }

    #[test]
    fn test_tree_recovers_numeric_token_and_flag() {
        let message = HandshakeMessage::VersionOffer {
            state_set: StateVector::new(),
            protocol_version: 11,
            auth: Some("1234".into()),
            prefer_untransformed: true,
        };

        let tree = message.to_tree().unwrap();
        assert_eq!(tree.attr("preferUntransformed"), Some("true"));
        assert_eq!(HandshakeMessage::from_tree(&tree).unwrap(), message);
    }
}
