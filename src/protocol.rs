//! Request and response records exchanged over the encrypted channel, plus
//! shared protocol constants.

use std::io::{Read, Write};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::wire::SecureConnection;

// Handshake tokens (plaintext phase)
pub const HELLO: &[u8] = b"hello";
pub const OK: &[u8] = b"ok";

pub mod timeouts {
    /// How long the responder will wait on the socket while it holds a
    /// target write lock across a body transfer. A stalled initiator costs
    /// the lock for at most this long.
    pub const LOCKED_TRANSFER_SECS: u64 = 30;
}

/// Request kinds. Numeric values are wire-stable; `ReqType` carries them as
/// integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RequestKind {
    CreateDir = 0,
    CreateFile = 1,
    UpdatePing = 2,
    Update = 3,
    Delete = 4,
}

impl From<RequestKind> for u8 {
    fn from(kind: RequestKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for RequestKind {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, String> {
        Ok(match v {
            0 => Self::CreateDir,
            1 => Self::CreateFile,
            2 => Self::UpdatePing,
            3 => Self::Update,
            4 => Self::Delete,
            other => return Err(format!("unknown request type {other}")),
        })
    }
}

/// One mirroring request. `mod_time` and `del_time` are meaningful only for
/// the request kinds that use them and stay zero otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    #[serde(rename = "ReqType")]
    pub kind: RequestKind,
    #[serde(rename = "relPath", default)]
    pub rel_path: String,
    #[serde(rename = "modTime", default)]
    pub mod_time: i64,
    #[serde(rename = "delTime", default)]
    pub del_time: i64,
}

impl SyncRequest {
    pub fn create_dir(rel: &str, mod_time: i64) -> Self {
        Self { kind: RequestKind::CreateDir, rel_path: rel.into(), mod_time, del_time: 0 }
    }

    pub fn create_file(rel: &str, mod_time: i64) -> Self {
        Self { kind: RequestKind::CreateFile, rel_path: rel.into(), mod_time, del_time: 0 }
    }

    pub fn update_ping(rel: &str) -> Self {
        Self { kind: RequestKind::UpdatePing, rel_path: rel.into(), mod_time: 0, del_time: 0 }
    }

    pub fn update(rel: &str, mod_time: i64) -> Self {
        Self { kind: RequestKind::Update, rel_path: rel.into(), mod_time, del_time: 0 }
    }

    pub fn delete(rel: &str, del_time: i64) -> Self {
        Self { kind: RequestKind::Delete, rel_path: rel.into(), mod_time: 0, del_time }
    }

    pub fn send<S: Read + Write>(&self, conn: &mut SecureConnection<S>) -> Result<()> {
        conn.write_message(&serde_json::to_vec(self)?)
    }

    pub fn recv<S: Read + Write>(conn: &mut SecureConnection<S>) -> Result<Self> {
        serde_json::from_slice(&conn.read_message()?).context("decoding request")
    }
}

/// Response leg of the UPDATE sub-protocol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(rename = "pingOK", default)]
    pub ping_ok: bool,
    #[serde(rename = "sendFile", default)]
    pub send_file: bool,
}

impl SyncResponse {
    /// Acknowledges an UPDATE_PING: the responder holds its write lock.
    pub fn ack_ping() -> Self {
        Self { ping_ok: true, send_file: false }
    }

    /// Answers the UPDATE timestamp comparison.
    pub fn request_body(send_file: bool) -> Self {
        Self { ping_ok: false, send_file }
    }

    pub fn send<S: Read + Write>(&self, conn: &mut SecureConnection<S>) -> Result<()> {
        conn.write_message(&serde_json::to_vec(self)?)
    }

    pub fn recv<S: Read + Write>(conn: &mut SecureConnection<S>) -> Result<Self> {
        serde_json::from_slice(&conn.read_message()?).context("decoding response")
    }
}
