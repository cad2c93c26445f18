//! This module defines types used to configure the engine and its parts.

use std::time::Duration;

use rand::Rng;

use crate::PeerId;

/// The client id prefix our peer ids start with, in the Azureus convention.
pub const TORRLY_CLIENT_ID_PREFIX: &[u8; 8] = b"-TRLY01-";

/// The global configuration for the torrent engine and all its parts.
///
/// There is no global mutable state anywhere in the crate: every tunable is
/// carried on this value and handed down to the part that needs it.
#[derive(Clone, Debug)]
pub struct Conf {
    /// The ID of the client to announce to the tracker and to peers.
    pub client_id: PeerId,

    /// The port we report to the tracker. We never accept inbound
    /// connections, but the tracker request requires one.
    pub listen_port: u16,

    /// How long a TCP connect to a peer may take before the session is
    /// abandoned.
    pub dial_timeout: Duration,

    /// How long we wait for the peer's 68 byte handshake after sending ours.
    pub handshake_timeout: Duration,

    /// A session is closed after this much receive silence. Peers are
    /// expected to keep alive every 2 minutes, so this leaves a 30 second
    /// margin on top of that.
    pub idle_timeout: Duration,

    /// After this much send silence the session emits a keep-alive.
    pub keep_alive_interval: Duration,

    /// The number of block requests a session keeps outstanding to its peer.
    pub request_queue_len: usize,

    /// The largest frame the wire codec will accept from a peer.
    pub max_frame_len: usize,

    /// If the tracker doesn't provide an announce interval, we fall back to
    /// announcing this often.
    pub announce_interval: Duration,

    /// When every session has died with pieces still missing, the torrent
    /// re-announces and tries again at most this many times before giving
    /// up.
    pub announce_retry_budget: usize,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            client_id: generate_client_id(),
            listen_port: 6881,
            dial_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(150),
            keep_alive_interval: Duration::from_secs(120),
            // Keeps the link saturated on typical home connections without
            // flooding slow peers.
            request_queue_len: 5,
            // 2 MiB, far above the largest legitimate message (a block
            // frame is a little over 16 KiB).
            max_frame_len: 2 * 1024 * 1024,
            announce_interval: Duration::from_secs(30 * 60),
            announce_retry_budget: 3,
        }
    }
}

/// Generates a fresh peer id: the client prefix followed by 12 random ASCII
/// digits.
fn generate_client_id() -> PeerId {
    let mut id = [0; 20];
    id[..TORRLY_CLIENT_ID_PREFIX.len()].copy_from_slice(TORRLY_CLIENT_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for b in id.iter_mut().skip(TORRLY_CLIENT_ID_PREFIX.len()) {
        *b = rng.gen_range(b'0'..=b'9');
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_shape() {
        let id = generate_client_id();
        assert_eq!(&id[..8], TORRLY_CLIENT_ID_PREFIX);
        assert!(id[8..].iter().all(u8::is_ascii_digit));
    }
}
