//! Wire contract of the replica RPC service.
//!
//! Every replica exposes two calls, `CheckLeader` and `NewTxnRequest`, over
//! TCP. Both directions carry length-prefixed bincode frames.

pub mod frame;
pub mod message;
pub mod tcp;

pub use anyhow::{anyhow as err, bail, Error, Result};

pub use crate::message::{
    Call, CheckLeaderReply, MsgSignature, Rejected, Reply, Request, RequestInner, TxnReply,
    TYPE_REQUEST,
};
pub use crate::tcp::{Connection, Listener, Service};
