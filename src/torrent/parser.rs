//! Torrent file parser
//!
//! Handles parsing of .torrent files and bare info dictionaries received as
//! metadata from peers.

use std::collections::HashMap;
use std::path::{Component, Path};

use anyhow::{anyhow, Result};
use serde_bencode::value::Value;
use tracing::{debug, error, info, trace};

use crate::torrent::info::{TorrentFile, TorrentInfo};
use crate::torrent::InfoHash;
use crate::error::TorrentError;

type Dict = HashMap<Vec<u8>, Value>;

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentInfo> {
        info!("Parsing torrent file from {} bytes", data.len());
        trace!("Torrent data (first 100 bytes): {:?}", &data[..data.len().min(100)]);

        let root = match serde_bencode::from_bytes::<Value>(data).map_err(TorrentError::from)? {
            Value::Dict(d) => d,
            _ => return Err(anyhow!("Root must be a dictionary")),
        };

        let info_value = root
            .get(b"info".as_ref())
            .ok_or_else(|| anyhow!("Missing info dictionary"))?;
        // Canonical re-encoding; sorted keys give the bytes peers hash
        let metadata = serde_bencode::to_bytes(info_value).map_err(TorrentError::from)?;

        let mut torrent = Self::convert_info_dict(info_value, metadata)?;
        torrent.announce_tiers = Self::announce_tiers(&root);
        info!(
            "Successfully parsed torrent: {} ({} pieces, {} trackers)",
            torrent.name,
            torrent.piece_count(),
            torrent.announce_tiers.iter().map(Vec::len).sum::<usize>()
        );
        Ok(torrent)
    }

    /// Parse a .torrent file from a file path
    pub fn parse_file(path: &Path) -> Result<TorrentInfo> {
        info!("Loading torrent file from: {}", path.display());

        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to read torrent file", path.display().to_string(), e.to_string())
        })?;

        debug!("Read {} bytes from torrent file", data.len());
        Self::parse_bytes(&data)
    }

    /// Parse a raw info dictionary, as delivered by the metadata exchange
    ///
    /// The info hash is computed over `bytes` exactly as given.
    pub fn parse_info_dict(bytes: &[u8]) -> Result<TorrentInfo> {
        debug!("Parsing info dictionary from {} bytes", bytes.len());
        let value = serde_bencode::from_bytes::<Value>(bytes).map_err(TorrentError::from)?;
        let mut torrent = Self::convert_info_dict(&value, bytes.to_vec())?;
        torrent.info_hash = InfoHash::of_info_dict(bytes);
        Ok(torrent)
    }

    fn convert_info_dict(info_value: &Value, metadata: Vec<u8>) -> Result<TorrentInfo> {
        let info_dict = match info_value {
            Value::Dict(d) => d,
            _ => return Err(anyhow!("Info must be a dictionary")),
        };

        let name = get_bytes(info_dict, b"name")
            .map(|b| String::from_utf8_lossy(b).to_string())
            .ok_or_else(|| anyhow!("Missing name field"))?;
        check_path_component(&name)?;

        let piece_length = get_int(info_dict, b"piece length")
            .filter(|&l| l > 0)
            .ok_or_else(|| anyhow!("Missing or invalid piece length"))? as u64;

        let pieces_bytes = get_bytes(info_dict, b"pieces").ok_or_else(|| anyhow!("Missing pieces field"))?;
        let pieces = TorrentInfo::parse_piece_hashes(pieces_bytes)?;

        let (files, multi_file) = if let Some(length) = get_int(info_dict, b"length") {
            if length < 0 {
                return Err(anyhow!("Invalid length field"));
            }
            (
                vec![TorrentFile {
                    path: vec![name.clone()],
                    length: length as u64,
                }],
                false,
            )
        } else if let Some(Value::List(file_list)) = info_dict.get(b"files".as_ref()) {
            let mut torrent_files = Vec::with_capacity(file_list.len());
            for file_entry in file_list {
                let file_dict = match file_entry {
                    Value::Dict(d) => d,
                    _ => return Err(anyhow!("File entry must be a dictionary")),
                };
                let length = get_int(file_dict, b"length")
                    .filter(|&l| l >= 0)
                    .ok_or_else(|| anyhow!("Missing file length"))? as u64;
                let path = match file_dict.get(b"path".as_ref()) {
                    Some(Value::List(components)) => components
                        .iter()
                        .filter_map(|c| match c {
                            Value::Bytes(b) => Some(String::from_utf8_lossy(b).to_string()),
                            _ => None,
                        })
                        .collect::<Vec<_>>(),
                    _ => return Err(anyhow!("Missing file path")),
                };
                if path.is_empty() {
                    return Err(anyhow!("Empty file path"));
                }
                for component in &path {
                    check_path_component(component)?;
                }
                torrent_files.push(TorrentFile { path, length });
            }
            (torrent_files, true)
        } else {
            return Err(anyhow!("Neither length nor files found in info dict"));
        };

        let total: u64 = files.iter().map(|f| f.length).sum();
        let expected_pieces = total.div_ceil(piece_length) as usize;
        if expected_pieces != pieces.len() {
            return Err(anyhow!(
                "Piece count mismatch: {} hashes for {} bytes at piece length {}",
                pieces.len(),
                total,
                piece_length
            ));
        }

        Ok(TorrentInfo {
            info_hash: InfoHash::of_info_dict(&metadata),
            name,
            piece_length,
            pieces,
            files,
            multi_file,
            announce_tiers: Vec::new(),
            metadata,
        })
    }

    fn announce_tiers(root: &Dict) -> Vec<Vec<String>> {
        let mut tiers: Vec<Vec<String>> = Vec::new();
        if let Some(Value::List(list)) = root.get(b"announce-list".as_ref()) {
            for tier in list {
                if let Value::List(urls) = tier {
                    let urls: Vec<String> = urls
                        .iter()
                        .filter_map(|u| match u {
                            Value::Bytes(b) => Some(String::from_utf8_lossy(b).to_string()),
                            _ => None,
                        })
                        .collect();
                    if !urls.is_empty() {
                        tiers.push(urls);
                    }
                }
            }
        }
        // announce-list supersedes announce when both are present
        if tiers.is_empty() {
            if let Some(announce) = get_bytes(root, b"announce") {
                tiers.push(vec![String::from_utf8_lossy(announce).to_string()]);
            }
        }
        tiers
    }
}

/// A file path part must name exactly one entry below the save path
fn check_path_component(component: &str) -> Result<()> {
    if component.is_empty() {
        return Err(anyhow!("Invalid torrent: empty file path component"));
    }
    if component.contains(['/', '\\']) {
        return Err(anyhow!("Invalid torrent: file path component '{}' contains a separator", component));
    }
    let mut parts = Path::new(component).components();
    match (parts.next(), parts.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        (Some(Component::ParentDir), _) => Err(anyhow!(
            "Invalid torrent: file path contains parent directory reference (..)"
        )),
        (Some(Component::RootDir | Component::Prefix(_)), _) => {
            Err(anyhow!("Invalid torrent: file path contains absolute path"))
        }
        _ => Err(anyhow!("Invalid torrent: file path component '{}'", component)),
    }
}

fn get_bytes<'a>(dict: &'a Dict, key: &[u8]) -> Option<&'a [u8]> {
    match dict.get(key) {
        Some(Value::Bytes(b)) => Some(b),
        _ => None,
    }
}

fn get_int(dict: &Dict, key: &[u8]) -> Option<i64> {
    match dict.get(key) {
        Some(Value::Int(i)) => Some(*i),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn bytes(s: &str) -> Value {
        Value::Bytes(s.as_bytes().to_vec())
    }

    /// Bencoded info dictionary for a single file of `length` bytes
    pub(crate) fn single_file_info(name: &str, piece_length: i64, length: i64, hashes: &[[u8; 20]]) -> Value {
        let mut info = HashMap::new();
        info.insert(b"name".to_vec(), bytes(name));
        info.insert(b"piece length".to_vec(), Value::Int(piece_length));
        info.insert(b"length".to_vec(), Value::Int(length));
        info.insert(b"pieces".to_vec(), Value::Bytes(hashes.concat()));
        Value::Dict(info)
    }

    /// Bencoded .torrent wrapping `info` with the given trackers
    pub(crate) fn torrent_bytes(info: Value, announce: &str, tiers: &[&[&str]]) -> Vec<u8> {
        let mut root = HashMap::new();
        root.insert(b"announce".to_vec(), bytes(announce));
        if !tiers.is_empty() {
            let list = tiers
                .iter()
                .map(|tier| Value::List(tier.iter().map(|u| bytes(u)).collect()))
                .collect();
            root.insert(b"announce-list".to_vec(), Value::List(list));
        }
        root.insert(b"info".to_vec(), info);
        serde_bencode::to_bytes(&Value::Dict(root)).unwrap()
    }

    #[test]
    fn test_parse_single_file() {
        let info = single_file_info("movie.mkv", 1024, 1500, &[[1u8; 20], [2u8; 20]]);
        let data = torrent_bytes(info, "http://tracker.example.com/announce", &[]);

        let torrent = TorrentParser::parse_bytes(&data).unwrap();
        assert_eq!(torrent.name, "movie.mkv");
        assert_eq!(torrent.piece_length, 1024);
        assert_eq!(torrent.piece_count(), 2);
        assert_eq!(torrent.total_size(), 1500);
        assert!(!torrent.multi_file);
        assert_eq!(torrent.announce_tiers, vec![vec!["http://tracker.example.com/announce".to_string()]]);
    }

    #[test]
    fn test_info_hash_covers_info_dict_only() {
        let info = single_file_info("a", 16, 16, &[[3u8; 20]]);
        let encoded_info = serde_bencode::to_bytes(&info).unwrap();
        let data = torrent_bytes(info, "http://t/announce", &[]);

        let torrent = TorrentParser::parse_bytes(&data).unwrap();
        assert_eq!(torrent.info_hash, InfoHash::of_info_dict(&encoded_info));
        assert_eq!(torrent.metadata, encoded_info);
    }

    #[test]
    fn test_announce_list_takes_precedence() {
        let info = single_file_info("a", 16, 16, &[[3u8; 20]]);
        let data = torrent_bytes(info, "http://primary/announce", &[&["http://a", "http://b"], &["http://c"]]);

        let torrent = TorrentParser::parse_bytes(&data).unwrap();
        assert_eq!(torrent.announce_tiers.len(), 2);
        assert_eq!(torrent.announce_tiers[0], vec!["http://a", "http://b"]);
        assert_eq!(torrent.announce_tiers[1], vec!["http://c"]);
    }

    #[test]
    fn test_parse_multi_file() {
        let mut file_a = HashMap::new();
        file_a.insert(b"length".to_vec(), Value::Int(10));
        file_a.insert(b"path".to_vec(), Value::List(vec![bytes("dir"), bytes("a.txt")]));
        let mut file_b = HashMap::new();
        file_b.insert(b"length".to_vec(), Value::Int(30));
        file_b.insert(b"path".to_vec(), Value::List(vec![bytes("b.txt")]));

        let mut info = HashMap::new();
        info.insert(b"name".to_vec(), bytes("bundle"));
        info.insert(b"piece length".to_vec(), Value::Int(16));
        info.insert(b"files".to_vec(), Value::List(vec![Value::Dict(file_a), Value::Dict(file_b)]));
        info.insert(b"pieces".to_vec(), Value::Bytes([[0u8; 20]; 3].concat()));

        let data = torrent_bytes(Value::Dict(info), "http://t/announce", &[]);
        let torrent = TorrentParser::parse_bytes(&data).unwrap();
        assert!(torrent.multi_file);
        assert_eq!(torrent.files.len(), 2);
        assert_eq!(torrent.files[0].path, vec!["dir", "a.txt"]);
        assert_eq!(torrent.total_size(), 40);
    }

    /// Raw info dictionary with one 16-byte file at `path` inside `name`
    fn info_with_path(name: &str, path: &[&str]) -> Vec<u8> {
        let mut file = HashMap::new();
        file.insert(b"length".to_vec(), Value::Int(16));
        file.insert(b"path".to_vec(), Value::List(path.iter().map(|c| bytes(c)).collect()));

        let mut info = HashMap::new();
        info.insert(b"name".to_vec(), bytes(name));
        info.insert(b"piece length".to_vec(), Value::Int(16));
        info.insert(b"files".to_vec(), Value::List(vec![Value::Dict(file)]));
        info.insert(b"pieces".to_vec(), Value::Bytes([0u8; 20].to_vec()));
        serde_bencode::to_bytes(&Value::Dict(info)).unwrap()
    }

    #[test]
    fn test_parent_dir_path_rejected() {
        let raw = info_with_path("bundle", &["..", "..", "escaped.bin"]);
        assert!(TorrentParser::parse_info_dict(&raw).is_err());
        let raw = info_with_path("bundle", &["dir", "..", "x.bin"]);
        assert!(TorrentParser::parse_info_dict(&raw).is_err());
    }

    #[test]
    fn test_absolute_path_rejected() {
        let raw = info_with_path("bundle", &["/tmp", "outside.bin"]);
        assert!(TorrentParser::parse_info_dict(&raw).is_err());
        let raw = info_with_path("bundle", &["/"]);
        assert!(TorrentParser::parse_info_dict(&raw).is_err());
    }

    #[test]
    fn test_current_dir_and_empty_parts_rejected() {
        assert!(TorrentParser::parse_info_dict(&info_with_path("bundle", &[".", "a.bin"])).is_err());
        assert!(TorrentParser::parse_info_dict(&info_with_path("bundle", &["", "a.bin"])).is_err());
        assert!(TorrentParser::parse_info_dict(&info_with_path("bundle", &[])).is_err());
    }

    #[test]
    fn test_separator_inside_part_rejected() {
        assert!(TorrentParser::parse_info_dict(&info_with_path("bundle", &["dir/a.bin"])).is_err());
        assert!(TorrentParser::parse_info_dict(&info_with_path("bundle", &["..\\a.bin"])).is_err());
    }

    #[test]
    fn test_unsafe_name_rejected() {
        assert!(TorrentParser::parse_info_dict(&info_with_path("..", &["a.bin"])).is_err());
        assert!(TorrentParser::parse_info_dict(&info_with_path("/etc", &["a.bin"])).is_err());
        let single = serde_bencode::to_bytes(&single_file_info("../up.bin", 16, 16, &[[0u8; 20]])).unwrap();
        assert!(TorrentParser::parse_info_dict(&single).is_err());

        let ok = TorrentParser::parse_info_dict(&info_with_path("bundle", &["dir", "a..b.bin"])).unwrap();
        assert_eq!(ok.files[0].path, vec!["dir", "a..b.bin"]);
    }

    #[test]
    fn test_piece_count_mismatch_rejected() {
        let info = single_file_info("a", 16, 40, &[[3u8; 20]]);
        let data = torrent_bytes(info, "http://t/announce", &[]);
        assert!(TorrentParser::parse_bytes(&data).is_err());
    }

    #[test]
    fn test_missing_info_rejected() {
        assert!(TorrentParser::parse_bytes(b"d8:announce3:fooe").is_err());
        assert!(TorrentParser::parse_bytes(b"i42e").is_err());
    }

    #[test]
    fn test_parse_info_dict_hashes_raw_bytes() {
        let info = single_file_info("raw", 16, 20, &[[1u8; 20], [2u8; 20]]);
        let raw = serde_bencode::to_bytes(&info).unwrap();

        let torrent = TorrentParser::parse_info_dict(&raw).unwrap();
        assert_eq!(torrent.info_hash, InfoHash::of_info_dict(&raw));
        assert!(torrent.announce_tiers.is_empty());
        assert_eq!(torrent.piece_size(1), 4);
    }
}
