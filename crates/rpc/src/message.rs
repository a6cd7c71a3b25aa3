use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

/// Message type tag of a client request.
pub const TYPE_REQUEST: i32 = 0;

/// The signed part of a request. Its canonical encoding is what gets digested.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestInner {
    pub id: i32,
    pub seq: i32,
    pub view: i32,
    #[serde(rename = "type")]
    pub kind: i32,
    pub msg: Vec<u8>,
    pub timestamp: i64,
}

/// ECDSA signature components, each a 256-bit big-endian integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MsgSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Request {
    pub inner: RequestInner,
    pub digest: Vec<u8>,
    pub signature: Option<MsgSignature>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckLeaderReply {
    pub is_primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnReply {
    pub msg: Vec<u8>,
}

/// A replica refused to take a request, e.g. it is no longer the primary or
/// the request failed verification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[display(fmt = "request rejected: {}", _0)]
pub struct Rejected(pub String);

impl std::error::Error for Rejected {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Call {
    CheckLeader,
    NewTxnRequest(Request),
}

#[derive(Debug, Clone, PartialEq, Eq, From, Serialize, Deserialize)]
pub enum Reply {
    CheckLeader(CheckLeaderReply),
    NewTxnRequest(TxnReply),
    Rejected(Rejected),
}
