//! The HTTP tracker client: announces our presence in the swarm and returns
//! the peers the tracker knows about.

use std::{
    convert::TryFrom,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str,
    time::Duration,
};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use reqwest::Client;
use serde_bencode::value::Value;
use url::Url;

use crate::{error::*, PeerId, Sha1Hash};

/// The query parameters of an announce request.
pub(crate) struct AnnounceParams {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    /// The port we could be contacted on. Purely informational for a leech.
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// The number of bytes still missing from the download.
    pub left: u64,
}

/// The relevant parts of the tracker's announce response.
#[derive(Debug)]
pub(crate) struct TrackerResponse {
    /// How long to wait before the next announce, if the tracker said.
    pub interval: Option<Duration>,
    /// The number of seeders in the swarm, if reported.
    pub complete: Option<u64>,
    /// The number of leechers in the swarm, if reported.
    pub incomplete: Option<u64>,
    /// The addresses of the peers the tracker handed out.
    pub peers: Vec<SocketAddr>,
}

/// The announce response as it appears on the wire. The `peers` field is
/// polymorphic: either a compact byte string with 6 bytes per peer, or a
/// list of dictionaries; it is decoded generically here and interpreted in
/// [`parse_response`].
#[derive(Debug, Deserialize)]
struct RawTrackerResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<u64>,
    complete: Option<u64>,
    incomplete: Option<u64>,
    peers: Option<Value>,
}

/// Announces to the tracker at `announce_url` and returns the decoded
/// response.
///
/// The `info_hash` and `peer_id` parameters are raw binary and have to be
/// percent-encoded by hand: handing them to a URL builder would encode the
/// percent signs themselves.
pub(crate) async fn announce(
    client: &Client,
    announce_url: &str,
    params: &AnnounceParams,
) -> Result<TrackerResponse> {
    let base = Url::parse(announce_url)
        .map_err(|e| Error::Tracker(format!("invalid announce url: {}", e)))?;
    let separator = if base.query().is_some() { '&' } else { '?' };
    let url = format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}\
         &left={}&compact=1",
        base,
        separator,
        percent_encode(&params.info_hash, NON_ALPHANUMERIC),
        percent_encode(&params.peer_id, NON_ALPHANUMERIC),
        params.port,
        params.uploaded,
        params.downloaded,
        params.left,
    );

    log::debug!("Announce request: {}", url);
    let body = client.get(&url).send().await?.bytes().await?;
    parse_response(&body)
}

/// Decodes a bencoded announce response body.
fn parse_response(body: &[u8]) -> Result<TrackerResponse> {
    let raw: RawTrackerResponse = serde_bencode::from_bytes(body)?;

    if let Some(reason) = raw.failure_reason {
        return Err(Error::Tracker(reason));
    }

    let peers = match raw.peers {
        Some(Value::Bytes(buf)) => parse_compact_peers(&buf)?,
        Some(Value::List(list)) => parse_peer_dicts(&list),
        Some(_) => {
            return Err(Error::Tracker(
                "peers field has an unexpected type".into(),
            ));
        }
        None => Vec::new(),
    };

    Ok(TrackerResponse {
        interval: raw.interval.map(Duration::from_secs),
        complete: raw.complete,
        incomplete: raw.incomplete,
        peers,
    })
}

/// Decodes the compact peer list form: 6 bytes per peer, a big-endian IPv4
/// address followed by a big-endian port.
fn parse_compact_peers(buf: &[u8]) -> Result<Vec<SocketAddr>> {
    if buf.len() % 6 != 0 {
        return Err(Error::Tracker(format!(
            "compact peer list length {} is not a multiple of 6",
            buf.len()
        )));
    }

    Ok(buf
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::from((ip, port))
        })
        .collect())
}

/// Decodes the non-compact peer list form: one dictionary per peer with
/// `ip` and `port` entries (and a `peer id` we have no use for, as the
/// handshake tells us the id anyway). Entries that don't parse are skipped
/// rather than failing the whole announce.
fn parse_peer_dicts(list: &[Value]) -> Vec<SocketAddr> {
    let mut peers = Vec::with_capacity(list.len());
    for entry in list {
        let dict = match entry {
            Value::Dict(dict) => dict,
            _ => {
                log::warn!("Skipping non-dictionary peer entry");
                continue;
            }
        };

        let ip = dict
            .get("ip".as_bytes())
            .and_then(|v| match v {
                Value::Bytes(buf) => str::from_utf8(buf).ok(),
                _ => None,
            })
            .and_then(|s| s.parse::<IpAddr>().ok());
        let port = dict.get("port".as_bytes()).and_then(|v| match v {
            Value::Int(port) => u16::try_from(*port).ok(),
            _ => None,
        });

        match (ip, port) {
            (Some(ip), Some(port)) => {
                peers.push(SocketAddr::new(ip, port));
            }
            _ => {
                log::warn!("Skipping peer entry with unusable ip or port");
            }
        }
    }
    peers
}

#[cfg(test)]
mod tests {
    use mockito::{mock, Matcher};

    use super::*;

    fn test_params() -> AnnounceParams {
        AnnounceParams {
            info_hash: [0x01; 20],
            peer_id: *b"-TRLY01-000000000001",
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 51200,
        }
    }

    #[test]
    fn test_parse_compact_response() {
        let mut body = Vec::new();
        body.extend_from_slice(
            b"d8:completei3e10:incompletei1e8:intervali1800e5:peers12:",
        );
        body.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
        body.extend_from_slice(&[192, 168, 1, 104, 0x1A, 0xE2]);
        body.extend_from_slice(b"e");

        let response = parse_response(&body).unwrap();
        assert_eq!(response.interval, Some(Duration::from_secs(1800)));
        assert_eq!(response.complete, Some(3));
        assert_eq!(response.incomplete, Some(1));
        assert_eq!(
            response.peers,
            vec![
                SocketAddr::from((Ipv4Addr::new(127, 0, 0, 1), 6881)),
                SocketAddr::from((Ipv4Addr::new(192, 168, 1, 104), 6882)),
            ]
        );
    }

    #[test]
    fn test_parse_dictionary_response() {
        let body = b"d8:intervali900e5:peersl\
                     d2:ip9:127.0.0.17:peer id20:-TRLY01-0000000000024:porti6881ee\
                     d2:ip3:bad4:porti6882ee\
                     ee";

        let response = parse_response(&body[..]).unwrap();
        assert_eq!(response.interval, Some(Duration::from_secs(900)));
        // the entry with an unparseable ip is skipped
        assert_eq!(
            response.peers,
            vec![SocketAddr::from((Ipv4Addr::new(127, 0, 0, 1), 6881))]
        );
    }

    #[test]
    fn test_parse_failure_reason() {
        let body = b"d14:failure reason12:unregisterede";
        let result = parse_response(&body[..]);
        match result {
            Err(Error::Tracker(reason)) => {
                assert_eq!(reason, "unregistered")
            }
            other => panic!("expected a tracker error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_reject_truncated_compact_peers() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers5:");
        body.extend_from_slice(&[127, 0, 0, 1, 0x1A]);
        body.extend_from_slice(b"e");
        assert!(matches!(parse_response(&body), Err(Error::Tracker(_))));
    }

    #[tokio::test]
    async fn test_announce_round_trip() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers6:");
        body.extend_from_slice(&[10, 0, 0, 2, 0x1B, 0x39]);
        body.extend_from_slice(b"e");

        let _m = mock(
            "GET",
            Matcher::Regex(r"^/announce\?.*info_hash=.*".to_string()),
        )
        .with_body(body)
        .create();

        let client = Client::new();
        let url = format!("{}/announce", mockito::server_url());
        let response =
            announce(&client, &url, &test_params()).await.unwrap();
        assert_eq!(
            response.peers,
            vec![SocketAddr::from((Ipv4Addr::new(10, 0, 0, 2), 6969))]
        );
    }
}
