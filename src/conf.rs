//! This module defines the two plain text inputs every peer is started from:
//! the common configuration shared by the whole swarm and the peer manifest
//! that fixes the neighbor topology.

use std::{fs, path::Path, time::Duration};

use crate::{
    error::{Error, Result},
    PeerId,
};

/// The swarm-wide configuration, shared verbatim by every peer.
///
/// Parsed from a plain text file of `key=value` lines, one setting per line,
/// with no whitespace around the `=`.
#[derive(Clone, Debug)]
pub struct Conf {
    /// How many neighbors a peer serves at once. One of these slots is
    /// rotated optimistically, the rest are awarded by recent download
    /// contribution.
    pub preferred_neighbor_count: usize,

    /// The period of the contribution-ranked unchoke evaluation.
    pub unchoke_interval: Duration,

    /// The period of the optimistic unchoke rotation.
    pub optimistic_unchoke_interval: Duration,

    /// The name of the shared file. Seeds read it, leeches create it in
    /// their own download directory.
    pub file_name: String,

    /// The total size of the shared file, in bytes.
    pub file_len: u64,

    /// The size of a piece, in bytes. The last piece may be shorter.
    pub piece_len: u32,
}

impl Conf {
    /// Reads and parses the common configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parses the configuration from its `key=value` text form.
    ///
    /// Every key must be present exactly once; unknown keys, missing keys,
    /// and non-numeric values are fatal.
    pub fn parse(text: &str) -> Result<Self> {
        let mut preferred_neighbor_count = None;
        let mut unchoke_interval = None;
        let mut optimistic_unchoke_interval = None;
        let mut file_name = None;
        let mut file_len = None;
        let mut piece_len = None;

        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let mut split = line.trim().splitn(2, '=');
            let key = split.next().unwrap_or_default();
            let value = split
                .next()
                .ok_or_else(|| Error::Config(format!("line without '=': {:?}", line)))?;
            match key {
                "NumberOfPreferredNeighbors" => {
                    preferred_neighbor_count = Some(parse_int(key, value)? as usize)
                }
                "UnchokingInterval" => {
                    unchoke_interval = Some(Duration::from_secs(parse_int(key, value)?))
                }
                "OptimisticUnchokingInterval" => {
                    optimistic_unchoke_interval =
                        Some(Duration::from_secs(parse_int(key, value)?))
                }
                "FileName" => file_name = Some(value.to_string()),
                "FileSize" => file_len = Some(parse_int(key, value)?),
                "PieceSize" => piece_len = Some(parse_int(key, value)? as u32),
                _ => {
                    return Err(Error::Config(format!("unknown key {:?}", key)));
                }
            }
        }

        let conf = Self {
            preferred_neighbor_count: require(preferred_neighbor_count, "NumberOfPreferredNeighbors")?,
            unchoke_interval: require(unchoke_interval, "UnchokingInterval")?,
            optimistic_unchoke_interval: require(
                optimistic_unchoke_interval,
                "OptimisticUnchokingInterval",
            )?,
            file_name: require(file_name, "FileName")?,
            file_len: require(file_len, "FileSize")?,
            piece_len: require(piece_len, "PieceSize")?,
        };

        if conf.piece_len == 0 {
            return Err(Error::Config("PieceSize must be positive".into()));
        }
        if conf.file_len == 0 {
            return Err(Error::Config("FileSize must be positive".into()));
        }

        Ok(conf)
    }
}

fn parse_int(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{} is not a number: {:?}", key, value)))
}

fn require<T>(value: Option<T>, key: &str) -> Result<T> {
    value.ok_or_else(|| Error::Config(format!("missing key {}", key)))
}

/// One line of the peer manifest.
///
/// The manifest order is significant: a starting peer dials exactly the
/// peers whose entries appear above its own.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerEntry {
    pub id: PeerId,
    pub host: String,
    pub port: u16,
    /// Whether the peer starts out with the complete file.
    pub has_file: bool,
}

/// Reads and parses the peer manifest file.
pub fn load_manifest(path: impl AsRef<Path>) -> Result<Vec<PeerEntry>> {
    let text = fs::read_to_string(path)?;
    parse_manifest(&text)
}

/// Parses the manifest from its text form: one peer per line, as
/// `peer_id host port has_file`, where `has_file` is `1` or `0`.
pub fn parse_manifest(text: &str) -> Result<Vec<PeerEntry>> {
    let mut entries = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(Error::Manifest(format!(
                "expected 4 fields, got {}: {:?}",
                fields.len(),
                line
            )));
        }
        let id = fields[0]
            .parse()
            .map_err(|_| Error::Manifest(format!("bad peer id {:?}", fields[0])))?;
        let port = fields[2]
            .parse()
            .map_err(|_| Error::Manifest(format!("bad port {:?}", fields[2])))?;
        let has_file = match fields[3] {
            "1" => true,
            "0" => false,
            other => {
                return Err(Error::Manifest(format!("bad has_file flag {:?}", other)));
            }
        };
        entries.push(PeerEntry {
            id,
            host: fields[1].to_string(),
            port,
            has_file,
        });
    }
    Ok(entries)
}
