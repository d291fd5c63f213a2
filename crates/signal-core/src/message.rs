//! Signaling wire format
//!
//! One JSON object per frame:
//!
//! ```text
//! { "type": "offer", "senderId": "alice", "recipientId": "bob", "offer": { ... } }
//! ```
//!
//! The payload field is named after the message type (`offer` carries
//! `offer`, `key` carries `key`, and so on). Session descriptions and
//! candidates are opaque JSON values; only the agents look inside them.
//! The relay reads nothing but the [`RoutingHeader`].

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, SignalError};
use crate::identity::Identity;

/// Opaque negotiated session description (offer or answer blob)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDescription(serde_json::Value);

impl SessionDescription {
    /// Wrap an arbitrary JSON description
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Build the `{type, sdp}` shape browsers produce
    pub fn from_sdp(kind: &str, sdp: impl Into<String>) -> Self {
        Self(serde_json::json!({ "type": kind, "sdp": sdp.into() }))
    }

    /// The `sdp` member, if the description has one
    pub fn sdp(&self) -> Option<&str> {
        self.0.get("sdp").and_then(|s| s.as_str())
    }

    /// The `type` member (`offer` / `answer`), if present
    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(|s| s.as_str())
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// Opaque descriptor of one possible network path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Candidate(serde_json::Value);

impl Candidate {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Build the `{candidate, sdpMid, sdpMLineIndex}` shape browsers produce
    pub fn from_parts(candidate: impl Into<String>, sdp_mid: Option<&str>, sdp_mline_index: Option<u16>) -> Self {
        Self(serde_json::json!({
            "candidate": candidate.into(),
            "sdpMid": sdp_mid,
            "sdpMLineIndex": sdp_mline_index,
        }))
    }

    /// The raw `candidate:` attribute line, if present
    pub fn line(&self) -> Option<&str> {
        self.0.get("candidate").and_then(|c| c.as_str())
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// Public key bytes exchanged between peers
///
/// Serialized as a JSON array of numbers. On input the index-keyed object
/// form (`{"0": 12, "1": 34}`) produced by serializing a typed array is also
/// accepted; bytes are ordered by their numeric index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bytes(Vec<u8>),
            Indexed(BTreeMap<String, u8>),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Bytes(bytes) => Ok(PublicKey(bytes)),
            Repr::Indexed(map) => {
                let mut entries = map
                    .into_iter()
                    .map(|(index, byte)| {
                        index
                            .parse::<usize>()
                            .map(|i| (i, byte))
                            .map_err(|_| D::Error::custom(format!("invalid key index: {}", index)))
                    })
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                entries.sort_by_key(|(i, _)| *i);
                Ok(PublicKey(entries.into_iter().map(|(_, b)| b).collect()))
            }
        }
    }
}

/// Discriminant of a signaling message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Register,
    Offer,
    Answer,
    Candidate,
    Key,
    Reject,
    Hangup,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Register => "register",
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::Candidate => "candidate",
            MessageKind::Key => "key",
            MessageKind::Reject => "reject",
            MessageKind::Hangup => "hangup",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed payload, tagged by the `type` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Payload {
    /// Explicit identity announcement; carries no recipient
    Register,
    Offer {
        offer: SessionDescription,
    },
    Answer {
        answer: SessionDescription,
    },
    Candidate {
        candidate: Candidate,
    },
    Key {
        key: PublicKey,
    },
    /// An incoming call was declined (busy, user reject, prompt timeout)
    Reject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// The remote ended the call
    Hangup,
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Register => MessageKind::Register,
            Payload::Offer { .. } => MessageKind::Offer,
            Payload::Answer { .. } => MessageKind::Answer,
            Payload::Candidate { .. } => MessageKind::Candidate,
            Payload::Key { .. } => MessageKind::Key,
            Payload::Reject { .. } => MessageKind::Reject,
            Payload::Hangup => MessageKind::Hangup,
        }
    }
}

fn optional_identity<'de, D>(deserializer: D) -> std::result::Result<Option<Identity>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(Identity::from_wire(raw))
}

/// The unit of exchange between agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(
        rename = "senderId",
        alias = "userId",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "optional_identity"
    )]
    pub sender_id: Option<Identity>,

    #[serde(
        rename = "recipientId",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "optional_identity"
    )]
    pub recipient_id: Option<Identity>,

    #[serde(flatten)]
    pub payload: Payload,
}

impl SignalingMessage {
    fn addressed(sender: &Identity, recipient: &Identity, payload: Payload) -> Self {
        Self {
            sender_id: Some(sender.clone()),
            recipient_id: Some(recipient.clone()),
            payload,
        }
    }

    pub fn register(sender: &Identity) -> Self {
        Self {
            sender_id: Some(sender.clone()),
            recipient_id: None,
            payload: Payload::Register,
        }
    }

    pub fn offer(sender: &Identity, recipient: &Identity, offer: SessionDescription) -> Self {
        Self::addressed(sender, recipient, Payload::Offer { offer })
    }

    pub fn answer(sender: &Identity, recipient: &Identity, answer: SessionDescription) -> Self {
        Self::addressed(sender, recipient, Payload::Answer { answer })
    }

    pub fn candidate(sender: &Identity, recipient: &Identity, candidate: Candidate) -> Self {
        Self::addressed(sender, recipient, Payload::Candidate { candidate })
    }

    pub fn key(sender: &Identity, recipient: &Identity, key: PublicKey) -> Self {
        Self::addressed(sender, recipient, Payload::Key { key })
    }

    pub fn reject(sender: &Identity, recipient: &Identity, reason: Option<String>) -> Self {
        Self::addressed(sender, recipient, Payload::Reject { reason })
    }

    pub fn hangup(sender: &Identity, recipient: &Identity) -> Self {
        Self::addressed(sender, recipient, Payload::Hangup)
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    pub fn sender(&self) -> Option<&Identity> {
        self.sender_id.as_ref()
    }

    pub fn recipient(&self) -> Option<&Identity> {
        self.recipient_id.as_ref()
    }

    /// Serialize to a single JSON text frame
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame
    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// The only part of a message the relay looks at
///
/// Everything except `type`, `senderId`/`userId` and `recipientId` is
/// ignored, so payloads of any shape (including kinds the relay has never
/// heard of) pass through untouched.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RoutingHeader {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(
        rename = "senderId",
        alias = "userId",
        default,
        deserialize_with = "optional_identity"
    )]
    pub sender_id: Option<Identity>,

    #[serde(rename = "recipientId", default, deserialize_with = "optional_identity")]
    pub recipient_id: Option<Identity>,
}

impl RoutingHeader {
    /// Parse the routing header of a raw frame, enforcing a size limit
    pub fn parse(raw: &str, max_bytes: usize) -> Result<Self> {
        if raw.len() > max_bytes {
            return Err(SignalError::TooLarge {
                size: raw.len(),
                limit: max_bytes,
            });
        }
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    #[test]
    fn test_key_message_format() {
        let msg = SignalingMessage::key(&id("alice"), &id("bob"), PublicKey::new(vec![1, 2, 3]));
        let json = msg.encode().unwrap();

        assert!(json.contains("\"type\":\"key\""));
        assert!(json.contains("\"senderId\":\"alice\""));
        assert!(json.contains("\"recipientId\":\"bob\""));
        assert!(json.contains("\"key\":[1,2,3]"));
    }

    #[test]
    fn test_register_has_no_recipient() {
        let json = SignalingMessage::register(&id("alice")).encode().unwrap();
        assert!(json.contains("\"type\":\"register\""));
        assert!(!json.contains("recipientId"));
    }

    #[test]
    fn test_parse_browser_answer_without_sender() {
        let raw = r#"{"type":"answer","recipientId":"alice","answer":{"type":"answer","sdp":"v=0"}}"#;
        let msg = SignalingMessage::decode(raw).unwrap();

        assert_eq!(msg.kind(), MessageKind::Answer);
        assert_eq!(msg.sender(), None);
        assert_eq!(msg.recipient(), Some(&id("alice")));
        match msg.payload {
            Payload::Answer { answer } => {
                assert_eq!(answer.sdp(), Some("v=0"));
                assert_eq!(answer.kind(), Some("answer"));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_parse_candidate() {
        let raw = r#"{"type":"candidate","senderId":"bob","recipientId":"alice","candidate":{"candidate":"candidate:1 1 UDP 2130706431 192.168.1.1 54321 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
        let msg = SignalingMessage::decode(raw).unwrap();
        match msg.payload {
            Payload::Candidate { candidate } => {
                assert!(candidate.line().unwrap().starts_with("candidate:1"));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_key_accepts_indexed_object() {
        let raw = r#"{"type":"key","senderId":"alice","recipientId":"bob","key":{"1":20,"0":10,"2":30}}"#;
        let msg = SignalingMessage::decode(raw).unwrap();
        match msg.payload {
            Payload::Key { key } => assert_eq!(key.as_bytes(), &[10, 20, 30]),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_user_id_alias_and_blank_ids() {
        let raw = r#"{"type":"hangup","userId":"carol","recipientId":"  "}"#;
        let msg = SignalingMessage::decode(raw).unwrap();
        assert_eq!(msg.sender(), Some(&id("carol")));
        assert_eq!(msg.recipient(), None);
    }

    #[test]
    fn test_unknown_kind_is_malformed_for_agents() {
        let raw = r#"{"type":"hello","senderId":"alice"}"#;
        assert!(matches!(SignalingMessage::decode(raw), Err(SignalError::Malformed(_))));
        assert!(SignalingMessage::decode("not json").is_err());
    }

    #[test]
    fn test_routing_header_ignores_payload() {
        let raw = r#"{"type":"hello","senderId":"alice","recipientId":"bob","whatever":[1,{"x":2}]}"#;
        let header = RoutingHeader::parse(raw, 1024).unwrap();
        assert_eq!(header.kind, "hello");
        assert_eq!(header.sender_id, Some(id("alice")));
        assert_eq!(header.recipient_id, Some(id("bob")));
    }

    #[test]
    fn test_routing_header_rejects_bad_frames() {
        assert!(RoutingHeader::parse("[1,2,3]", 1024).is_err());
        assert!(RoutingHeader::parse(r#"{"senderId":"alice"}"#, 1024).is_err());
        assert!(RoutingHeader::parse(r#"{"type":7}"#, 1024).is_err());
        assert!(matches!(
            RoutingHeader::parse(r#"{"type":"offer"}"#, 4),
            Err(SignalError::TooLarge { limit: 4, .. })
        ));
    }

    #[test]
    fn test_reject_reason_is_optional() {
        let msg = SignalingMessage::reject(&id("bob"), &id("alice"), None);
        let json = msg.encode().unwrap();
        assert!(!json.contains("reason"));

        let parsed = SignalingMessage::decode(r#"{"type":"reject","recipientId":"alice","reason":"busy"}"#).unwrap();
        assert_eq!(
            parsed.payload,
            Payload::Reject {
                reason: Some("busy".to_string())
            }
        );
    }
}
