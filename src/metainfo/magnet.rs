//! Magnet URI (BEP 9 + BEP 53) parsing and generation.
//!
//! A magnet link carries only the torrent's identity (and optionally hints
//! like trackers and peers); a torrent added this way stays metadata-pending
//! until the info dictionary arrives from the swarm. `Display` renders the
//! link back out, so a host can generate shareable magnets from a loaded
//! torrent.

use std::fmt;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use url::Url;

use crate::{error::MagnetError, InfoHash, Sha1Hash, Sha256Hash};

/// Everything that must be escaped in a magnet query value: controls plus
/// the characters that would terminate or restructure the query string.
const QUERY_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'=')
    .add(b'?');

/// The parsed contents of a magnet URI.
#[derive(Clone, Debug, Default)]
pub struct MagnetUri {
    /// The torrent identity: v1, v2, or both (hybrid links carry two `xt`
    /// parameters).
    pub info_hash: InfoHash,
    /// The display name (`dn`), a hint until real metadata arrives.
    pub name: Option<String>,
    /// Tracker URLs (`tr`).
    pub trackers: Vec<String>,
    /// Web seed URLs (`ws`).
    pub web_seeds: Vec<String>,
    /// Direct peer addresses (`x.pe`), as `host:port` strings.
    pub peers: Vec<String>,
    /// DHT bootstrap nodes (`dht`), as `host:port` strings.
    pub dht_nodes: Vec<String>,
    /// Selected file indices (`so`, BEP 53). When present, every file not
    /// listed is set to priority 0 on add.
    pub file_selection: Option<Vec<usize>>,
}

impl MagnetUri {
    pub fn parse(input: &str) -> Result<Self, MagnetError> {
        let url = Url::parse(input)
            .map_err(|e| MagnetError::Url(e.to_string()))?;
        if url.scheme() != "magnet" {
            return Err(MagnetError::InvalidScheme);
        }

        let mut magnet = Self::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => magnet.parse_topic(&value)?,
                "dn" => magnet.name = Some(value.into_owned()),
                "tr" => magnet.trackers.push(value.into_owned()),
                "ws" => magnet.web_seeds.push(value.into_owned()),
                "x.pe" => {
                    magnet.peers.push(parse_endpoint(&value)?);
                }
                "dht" => {
                    magnet.dht_nodes.push(parse_endpoint(&value)?);
                }
                "so" => {
                    magnet.file_selection =
                        Some(parse_file_selection(&value)?);
                }
                // unknown parameters are ignored
                _ => {}
            }
        }

        if magnet.info_hash.is_empty() {
            return Err(MagnetError::MissingTopic);
        }
        Ok(magnet)
    }

    /// Parses one `xt` (exact topic) parameter: `urn:btih:` (v1, 40 hex or
    /// 32 base32 characters) or `urn:btmh:` (v2, a hex sha2-256 multihash).
    fn parse_topic(&mut self, topic: &str) -> Result<(), MagnetError> {
        if let Some(encoded) = topic.strip_prefix("urn:btih:") {
            let hash: Sha1Hash = match encoded.len() {
                40 => {
                    let bytes = hex::decode(encoded)
                        .map_err(|_| MagnetError::InvalidTopic)?;
                    let mut hash = [0; 20];
                    hash.copy_from_slice(&bytes);
                    hash
                }
                32 => {
                    let bytes = base32_decode(encoded)
                        .ok_or(MagnetError::InvalidTopic)?;
                    if bytes.len() != 20 {
                        return Err(MagnetError::InvalidTopic);
                    }
                    let mut hash = [0; 20];
                    hash.copy_from_slice(&bytes);
                    hash
                }
                _ => return Err(MagnetError::InvalidTopic),
            };
            self.info_hash.v1 = Some(hash);
            Ok(())
        } else if let Some(encoded) = topic.strip_prefix("urn:btmh:") {
            let bytes = hex::decode(encoded)
                .map_err(|_| MagnetError::InvalidTopic)?;
            // multihash header: 0x12 = sha2-256, 0x20 = 32 bytes
            if bytes.len() != 34 || bytes[0] != 0x12 || bytes[1] != 0x20 {
                return Err(MagnetError::InvalidTopic);
            }
            let mut hash: Sha256Hash = [0; 32];
            hash.copy_from_slice(&bytes[2..]);
            self.info_hash.v2 = Some(hash);
            Ok(())
        } else {
            Err(MagnetError::InvalidTopic)
        }
    }
}

/// Renders the magnet URI with percent-escaped parameter values, the
/// inverse of [`MagnetUri::parse`].
impl fmt::Display for MagnetUri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut params = Vec::new();
        if let Some(v1) = &self.info_hash.v1 {
            params.push(format!("xt=urn:btih:{}", hex::encode(v1)));
        }
        if let Some(v2) = &self.info_hash.v2 {
            params.push(format!("xt=urn:btmh:1220{}", hex::encode(v2)));
        }
        if let Some(name) = &self.name {
            params.push(format!(
                "dn={}",
                utf8_percent_encode(name, QUERY_ESCAPE)
            ));
        }
        for tracker in &self.trackers {
            params.push(format!(
                "tr={}",
                utf8_percent_encode(tracker, QUERY_ESCAPE)
            ));
        }
        for web_seed in &self.web_seeds {
            params.push(format!(
                "ws={}",
                utf8_percent_encode(web_seed, QUERY_ESCAPE)
            ));
        }
        for peer in &self.peers {
            params.push(format!("x.pe={}", peer));
        }
        for node in &self.dht_nodes {
            params.push(format!("dht={}", node));
        }
        if let Some(selection) = &self.file_selection {
            params.push(format!(
                "so={}",
                format_file_selection(selection)
            ));
        }
        write!(f, "magnet:?{}", params.join("&"))
    }
}

/// Renders a sorted index list back into the compact BEP 53 form,
/// collapsing consecutive runs into `a-b` ranges.
fn format_file_selection(indices: &[usize]) -> String {
    let mut out = String::new();
    let mut iter = indices.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end = iter.next().expect("peeked");
        }
        push_run(&mut out, start, end);
    }
    out
}

fn push_run(out: &mut String, start: usize, end: usize) {
    if !out.is_empty() {
        out.push(',');
    }
    if start == end {
        out.push_str(&start.to_string());
    } else {
        out.push_str(&format!("{}-{}", start, end));
    }
}

/// Validates a `host:port` endpoint parameter.
fn parse_endpoint(value: &str) -> Result<String, MagnetError> {
    let port = value
        .rsplit(':')
        .next()
        .and_then(|port| port.parse::<u16>().ok());
    match port {
        Some(_) if value.contains(':') => Ok(value.to_string()),
        _ => Err(MagnetError::InvalidPeerAddress),
    }
}

/// Parses the BEP 53 `so` parameter: comma separated zero-based indices or
/// `a-b` inclusive ranges. Returns a sorted, deduplicated index list.
fn parse_file_selection(value: &str) -> Result<Vec<usize>, MagnetError> {
    let mut indices = Vec::new();
    if value.is_empty() {
        return Ok(indices);
    }
    for part in value.split(',') {
        match part.split_once('-') {
            Some((start, end)) => {
                let start: usize = start
                    .parse()
                    .map_err(|_| MagnetError::InvalidFileSelection)?;
                let end: usize = end
                    .parse()
                    .map_err(|_| MagnetError::InvalidFileSelection)?;
                if end < start {
                    return Err(MagnetError::InvalidFileSelection);
                }
                indices.extend(start..=end);
            }
            None => {
                indices.push(
                    part.parse()
                        .map_err(|_| MagnetError::InvalidFileSelection)?,
                );
            }
        }
    }
    indices.sort_unstable();
    indices.dedup();
    Ok(indices)
}

/// RFC 4648 base32 (no padding), as used for v1 info hashes in older
/// magnet links.
fn base32_decode(input: &str) -> Option<Vec<u8>> {
    let mut bits: u32 = 0;
    let mut bit_count = 0;
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    for c in input.bytes() {
        let value = match c {
            b'A'..=b'Z' => c - b'A',
            b'a'..=b'z' => c - b'a',
            b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        bits = (bits << 5) | value as u32;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
        }
    }
    Some(out)
}
