//! Magnet links
//!
//! A magnet link names a transfer by info hash only; the metadata arrives
//! later from peers. Both the 40-character hex and the 32-character base32
//! forms of `xt=urn:btih:` are accepted.

use anyhow::{anyhow, bail, Result};
use tracing::{debug, warn};
use url::Url;

use crate::torrent::InfoHash;
use crate::tracker::AnnounceEntry;

/// What a magnet link says about a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetInfo {
    pub info_hash: InfoHash,
    /// `dn` parameter
    pub display_name: Option<String>,
    /// `tr` parameters in link order, without duplicates
    pub trackers: Vec<String>,
}

impl MagnetInfo {
    /// Name to show until metadata arrives: `dn`, or the hex info hash
    pub fn name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.info_hash.to_hex())
    }

    /// Each `tr` gets its own tier, tried in link order
    pub fn announce_entries(&self) -> Vec<AnnounceEntry> {
        self.trackers
            .iter()
            .enumerate()
            .map(|(tier, url)| AnnounceEntry::new(url.clone(), tier as u32))
            .collect()
    }
}

pub struct MagnetParser;

impl MagnetParser {
    /// Parse a `magnet:?` URI
    ///
    /// The first `urn:btih:` topic wins; other topics (`urn:sha1:`,
    /// `urn:btmh:`) and unknown parameters are skipped.
    pub fn parse(magnet_uri: &str) -> Result<MagnetInfo> {
        let url = Url::parse(magnet_uri.trim()).map_err(|e| anyhow!("Invalid magnet URI: {}", e))?;
        if url.scheme() != "magnet" {
            bail!("Not a magnet URI (scheme '{}')", url.scheme());
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers: Vec<String> = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" if info_hash.is_none() => {
                    if let Some(hash) = value.strip_prefix("urn:btih:") {
                        info_hash = Some(Self::decode_btih(hash)?);
                    } else {
                        debug!("Skipping exact topic {}", value);
                    }
                }
                "dn" => display_name = Some(value.into_owned()),
                "tr" => {
                    if trackers.iter().any(|t| t.as_str() == value.as_ref()) {
                        debug!("Duplicate tracker {}", value);
                    } else {
                        trackers.push(value.into_owned());
                    }
                }
                _ => debug!("Ignoring magnet parameter {}", key),
            }
        }

        let Some(info_hash) = info_hash else {
            warn!("Magnet URI without urn:btih topic");
            bail!("Magnet URI must contain xt=urn:btih:<info hash>");
        };
        debug!("Magnet for {} with {} trackers", info_hash, trackers.len());

        Ok(MagnetInfo {
            info_hash,
            display_name,
            trackers,
        })
    }

    fn decode_btih(hash: &str) -> Result<InfoHash> {
        match hash.len() {
            40 => hash
                .parse::<InfoHash>()
                .map_err(|e| anyhow!("Info hash is not valid hex: {}", e)),
            32 => base32_decode(hash).map(InfoHash::new),
            n => bail!("Info hash has {} characters, expected 40 (hex) or 32 (base32)", n),
        }
    }

    /// Whether the input should be treated as a magnet URI rather than a path
    pub fn is_magnet_link(input: &str) -> bool {
        input.trim().starts_with("magnet:?")
    }
}

/// RFC 4648 base32, 32 characters to 20 bytes, case-insensitive
fn base32_decode(text: &str) -> Result<[u8; 20]> {
    let mut out = [0u8; 20];
    let mut buffer: u64 = 0;
    let mut bits = 0;
    let mut pos = 0;

    for c in text.bytes() {
        let value = match c.to_ascii_uppercase() {
            c @ b'A'..=b'Z' => c - b'A',
            c @ b'2'..=b'7' => c - b'2' + 26,
            _ => bail!("Info hash is not valid base32: '{}'", c as char),
        };
        buffer = (buffer << 5) | u64::from(value);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out[pos] = (buffer >> bits) as u8;
            pos += 1;
        }
    }
    Ok(out)
}
