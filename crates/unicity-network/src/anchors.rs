//! Anchor connections.
//!
//! A couple of long-lived outbound peers are written out at shutdown and
//! reconnected first at the next start. The file is single use: loading
//! always deletes it.

use crate::manager::PeerManager;
use crate::protocol::NetworkAddress;
use crate::{NetworkError, NetworkResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Anchors kept across restarts.
pub const MAX_ANCHORS: usize = 2;

/// File name inside the data directory.
pub const ANCHORS_FILE_NAME: &str = "anchors.json";

const ANCHORS_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct AnchorEntry {
    ip: [u8; 16],
    port: u16,
    services: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnchorsFile {
    version: u32,
    count: usize,
    anchors: Vec<AnchorEntry>,
}

/// Pick anchors among ready regular outbound peers: oldest first, then lowest ping.
pub fn select_anchors(peers: &PeerManager) -> Vec<NetworkAddress> {
    let mut candidates: Vec<_> = peers
        .ready_peers()
        .into_iter()
        .filter(|p| !p.is_inbound() && !p.is_feeler())
        .collect();
    candidates.sort_by(|a, b| {
        a.created_at().cmp(&b.created_at()).then_with(|| {
            let pa = a.ping_time_ms().unwrap_or(u64::MAX);
            let pb = b.ping_time_ms().unwrap_or(u64::MAX);
            pa.cmp(&pb)
        })
    });
    candidates
        .iter()
        .take(MAX_ANCHORS)
        .map(|p| NetworkAddress::from_socket_addr(p.addr(), p.services()))
        .collect()
}

/// Write `anchors` to `path` atomically.
pub fn save_anchors(path: &Path, anchors: &[NetworkAddress]) -> NetworkResult<()> {
    let anchors: Vec<AnchorEntry> = anchors
        .iter()
        .take(MAX_ANCHORS)
        .map(|a| AnchorEntry {
            ip: a.ip,
            port: a.port,
            services: a.services,
        })
        .collect();
    let file = AnchorsFile {
        version: ANCHORS_FORMAT_VERSION,
        count: anchors.len(),
        anchors,
    };
    let json = serde_json::to_string_pretty(&file)
        .map_err(|e| NetworkError::Serialization(e.to_string()))?;

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    info!(path = %path.display(), count = file.count, "Saved anchors");
    Ok(())
}

/// Read and delete the anchors file. Missing or invalid files yield nothing.
pub fn load_anchors(path: &Path) -> Vec<NetworkAddress> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(_) => return Vec::new(),
    };
    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "Failed to delete anchors file");
    }

    let file: AnchorsFile = match serde_json::from_str(&contents) {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring malformed anchors file");
            return Vec::new();
        }
    };
    if file.version != ANCHORS_FORMAT_VERSION
        || file.count != file.anchors.len()
        || file.count > MAX_ANCHORS
    {
        warn!(
            version = file.version,
            count = file.count,
            "Ignoring anchors file with unexpected shape"
        );
        return Vec::new();
    }

    let anchors: Vec<NetworkAddress> = file
        .anchors
        .into_iter()
        .map(|a| NetworkAddress {
            services: a.services,
            ip: a.ip,
            port: a.port,
        })
        .filter(|a| !a.is_unspecified() && a.port != 0)
        .collect();
    debug!(count = anchors.len(), "Loaded anchors");
    anchors
}
