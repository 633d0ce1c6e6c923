use crate::{MessageId, SessionId, Timestamp};

/// The protocol family a message or interest belongs to.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolType {
    Contract,
    Request,
    Task,
}

impl std::fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProtocolType::Contract => "contract",
            ProtocolType::Request => "request",
            ProtocolType::Task => "task",
        };
        f.write_str(name)
    }
}

/// The class of a message within its protocol.
///
/// Announcement, Rejection, Grant, and Cancellation flow from the contract
/// manager to contractors; Bid, Refusal, UpdateReport, and FinalReport flow
/// back. Request and Response are the two halves of a request exchange.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageClass {
    Announcement,
    Bid,
    Refusal,
    Grant,
    Rejection,
    Cancellation,
    UpdateReport,
    FinalReport,
    Request,
    Response,
}

/// A message destination: a routing key within a shard.
#[derive(Clone, PartialEq, Eq, Hash, Debug, serde::Serialize, serde::Deserialize)]
pub struct Recipient {
    pub key: String,
    pub shard: String,
}

impl Recipient {
    pub fn new(key: impl Into<String>, shard: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            shard: shard.into(),
        }
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.key, self.shard)
    }
}

/// The wire-agnostic message envelope.
///
/// `receiver_id` routes to an existing listener session; a message without
/// one may instead match a registered interest. `reply_to` and `sender_id`
/// are stamped by `send_msg` (unless the send is a handover) so that the
/// receiving side can address its replies.
#[derive(Clone, PartialEq, Debug, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub protocol_type: ProtocolType,
    pub protocol_id: String,
    pub class: MessageClass,
    pub message_id: MessageId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sender_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub receiver_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reply_to: Option<Recipient>,
    pub expiration_time: Timestamp,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Message {
    pub fn new(
        protocol_type: ProtocolType,
        protocol_id: impl Into<String>,
        class: MessageClass,
        expiration_time: Timestamp,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            protocol_type,
            protocol_id: protocol_id.into(),
            class,
            message_id: MessageId::generate(),
            sender_id: None,
            receiver_id: None,
            reply_to: None,
            expiration_time,
            payload,
        }
    }

    /// A reply within the same conversation: same protocol coordinates,
    /// addressed to the peer session that sent `to`.
    pub fn reply_to(
        to: &Message,
        class: MessageClass,
        expiration_time: Timestamp,
        payload: serde_json::Value,
    ) -> Self {
        let mut msg = Self::new(
            to.protocol_type,
            to.protocol_id.clone(),
            class,
            expiration_time,
            payload,
        );
        msg.receiver_id = to.sender_id;
        msg
    }

    pub fn expired_at(&self, now: Timestamp) -> bool {
        self.expiration_time < now
    }
}
