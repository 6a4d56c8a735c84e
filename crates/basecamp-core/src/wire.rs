//! Basecamp wire format — the command envelope and the update protocol
//! vocabulary.
//!
//! Everything here IS the protocol. The frame layer (basecamp-net) moves
//! opaque byte payloads; the bytes of a command payload are always a JSON
//! [`Envelope`]. Idents are stable wire strings — renaming one after a
//! release is a breaking change.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::manifest::FileEntry;

// ── Frame limits ─────────────────────────────────────────────────────────────

/// Maximum frame payload size in bytes.
///
/// Command envelopes must fit in a single frame; file content is split into
/// frames of at most this size by the file sub-protocol.
pub const MAX_FRAME: usize = 64 * 1024;

// ── Envelope ─────────────────────────────────────────────────────────────────

/// The JSON command envelope carried by one frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "_ident")]
    pub ident: String,
    #[serde(rename = "_body")]
    pub body: Value,
}

impl Envelope {
    pub fn new(ident: &str, body: Value) -> Self {
        Self { ident: ident.to_string(), body }
    }

    /// Encode to the exact bytes that go on the wire.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("envelope always serializes")
    }

    /// Decode an envelope from a received frame payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ── Update protocol idents ───────────────────────────────────────────────────

/// Client → releaser: request the approved version list.
pub const REQUEST_VERSIONS: &str = "__request_versions__";
/// Releaser → client: the approved version list (body: array of strings).
pub const RECEIVE_VERSIONS: &str = "__receive_versions__";
/// Client → releaser: request the newest approved version.
pub const REQUEST_LATEST_VERSION: &str = "__request_latest_version__";
/// Releaser → client: the newest approved version (body: string or null).
pub const RECEIVE_LATEST_VERSION: &str = "__receive_latest_version__";
/// Client → releaser: request a version's bundle.
pub const DOWNLOAD_UPDATE: &str = "__download_update__";
/// Releaser → client: bundle transfer starting; file payloads follow.
pub const DOWNLOAD_START: &str = "__download_start__";
/// Releaser → client: every file of the bundle has been sent.
pub const DOWNLOAD_COMPLETE: &str = "__download_complete__";
/// Releaser → client: the download cannot be served.
pub const DOWNLOAD_FAILED: &str = "__download_failed__";
/// Operator → releaser: push an update instruction to a connected peer.
pub const FORCE_UPDATE: &str = "__force_update__";
/// Releaser → client: fetch and install the named version.
pub const APPLY_UPDATE: &str = "__apply_update__";
/// Either side: a forced update could not be carried out.
pub const UPDATE_FAILED: &str = "__update_failed__";

// ── Update protocol bodies ───────────────────────────────────────────────────

/// Body of [`DOWNLOAD_UPDATE`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub version: String,
}

/// Body of [`DOWNLOAD_START`].
///
/// After this envelope the sender streams each file in `files` order through
/// the file sub-protocol: one frame carrying the decimal ASCII byte size,
/// then content frames summing to exactly that size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadStart {
    pub version: String,
    pub files: Vec<FileEntry>,
    pub total_size: u64,
    pub file_count: usize,
}

/// Body of [`DOWNLOAD_COMPLETE`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadComplete {
    pub version: String,
    pub file_count: usize,
}

/// Body of [`DOWNLOAD_FAILED`] and [`UPDATE_FAILED`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferError {
    pub error: String,
}

/// Body of [`FORCE_UPDATE`] and [`APPLY_UPDATE`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceUpdate {
    pub version: String,
    #[serde(default = "default_restart")]
    pub restart: bool,
}

fn default_restart() -> bool {
    true
}
