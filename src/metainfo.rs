use std::{fmt, path::PathBuf};

use bytes::Bytes;
pub use hashes::Hashes;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::warn;

use crate::bencode::{self, BencodeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        InfoHash(hasher.finalize().into())
    }

    pub fn from_hex(hex_hash: &str) -> Option<Self> {
        let bytes = hex::decode(hex_hash).ok()?;
        Some(InfoHash(bytes.try_into().ok()?))
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

mod hashes {
    use serde::de::{self, Visitor};
    use serde::ser::{Serialize, Serializer};
    use serde::{Deserialize, Deserializer};
    use std::fmt;

    /// The concatenated SHA-1 hashes of all pieces, split into 20 byte chunks.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Hashes(pub Vec<[u8; 20]>);
    struct HashesVisitor;

    impl Serialize for Hashes {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_bytes(&self.0.concat())
        }
    }

    impl<'de> Visitor<'de> for HashesVisitor {
        type Value = Hashes;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("Bytes which length is a multiple of 20")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 20 != 0 {
                return Err(de::Error::custom(format!(
                    "Bytes which length is a multiple of 20. Got {:?}",
                    v.len()
                )));
            }
            Ok(Hashes(
                v.chunks_exact(20)
                    .map(|chunk| {
                        let mut hash = [0; 20];
                        hash.copy_from_slice(chunk);
                        hash
                    })
                    .collect(),
            ))
        }
    }

    impl<'de> Deserialize<'de> for Hashes {
        fn deserialize<D>(deserializer: D) -> Result<Hashes, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_bytes(HashesVisitor)
        }
    }
}

/// A parsed metainfo document together with the exact bytes its info hash was computed from.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// Tracker urls in announce-list order, without duplicates.
    pub announce: Vec<url::Url>,
    pub info: Info,
    pub info_hash: InfoHash,
    /// The raw bencoded info dictionary, served to peers asking for metadata.
    pub info_bytes: Bytes,
}

#[derive(Debug, Deserialize)]
struct RawMetainfo {
    announce: Option<String>,
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
}

impl Metainfo {
    pub fn read_from_file(path: &PathBuf) -> Result<Self, MetainfoError> {
        let bytes = std::fs::read(path).map_err(|error| MetainfoError::IOReadError {
            error,
            path: path.clone(),
        })?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MetainfoError> {
        let raw: RawMetainfo = bencode::decode(bytes)?;
        let span = bencode::dict_entry_span(bytes, b"info")?.ok_or(MetainfoError::MissingInfo)?;
        let info_bytes = Bytes::copy_from_slice(&bytes[span]);
        let info: Info = bencode::decode(&info_bytes)?;
        info.validate()?;

        let announce = raw
            .announce_list
            .into_iter()
            .flatten()
            .flatten()
            .chain(raw.announce)
            .collect::<Vec<_>>();

        Ok(Self {
            announce: parse_trackers(announce),
            info_hash: InfoHash::of(&info_bytes),
            info,
            info_bytes,
        })
    }

    /// Builds the metainfo for info bytes received from peers, checking them against the hash
    /// the torrent was started with.
    pub fn from_metadata(
        info_bytes: Bytes,
        expected: InfoHash,
        announce: Vec<url::Url>,
    ) -> Result<Self, MetainfoError> {
        let info_hash = InfoHash::of(&info_bytes);
        if info_hash != expected {
            return Err(MetainfoError::HashMismatch {
                expected,
                got: info_hash,
            });
        }
        let info: Info = bencode::decode(&info_bytes)?;
        info.validate()?;
        Ok(Self {
            announce,
            info,
            info_hash,
            info_bytes,
        })
    }
}

/// Parses tracker urls, dropping duplicates and anything that isn't a url.
pub(crate) fn parse_trackers(urls: impl IntoIterator<Item = String>) -> Vec<url::Url> {
    let mut trackers: Vec<url::Url> = Vec::new();
    for raw in urls {
        match url::Url::parse(&raw) {
            Ok(url) if !trackers.contains(&url) => trackers.push(url),
            Ok(_) => {}
            Err(error) => warn!(url = raw, %error, "ignoring invalid tracker url"),
        }
    }
    trackers
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Info {
    /// The name key maps to a UTF-8 encoded string.
    /// In the single file case, the name key is the name of a file, in the muliple file case,
    /// it's the name of a directory.
    pub name: String,
    /// `piece length` maps to the number of bytes in each piece the file is split into.
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    /// pieces is to be subdivided into strings of length 20,
    /// each of which is the SHA1 hash of the piece at the corresponding index.
    pub pieces: Hashes,
    /// If length is present then the download represents a single file,
    /// otherwise it represents a set of files which go in a directory structure.
    #[serde(flatten)]
    pub files: Key,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Key {
    /// In the single file case, length maps to the length of the file in bytes.
    SingleFile { length: u64 },
    /// For the purposes of the other keys, the multi-file case is treated as only having
    /// a single file by concatenating the files in the order they appear in the files list.
    MultiFile { files: Vec<File> },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {
    /// The length of the file, in bytes.
    pub length: u64,
    /// A list of UTF-8 encoded strings corresponding to subdirectory names,
    /// the last of which is the actual file name (a zero length list is an error case).
    pub path: Vec<String>,
}

/// A file of the torrent placed in the concatenated byte stream.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    /// Path relative to the download directory.
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
}

impl Info {
    pub fn total_length(&self) -> u64 {
        match &self.files {
            Key::SingleFile { length } => *length,
            Key::MultiFile { files } => files.iter().map(|f| f.length).sum(),
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.0.len()
    }

    /// Length of the piece at `index`; only the last piece may be shorter.
    pub fn piece_len(&self, index: usize) -> u64 {
        let total = self.total_length();
        let offset = index as u64 * self.piece_length;
        self.piece_length.min(total.saturating_sub(offset))
    }

    pub fn is_private(&self) -> bool {
        self.private == Some(1)
    }

    /// The files in stream order with their offsets.
    pub fn file_entries(&self) -> Vec<FileEntry> {
        match &self.files {
            Key::SingleFile { length } => vec![FileEntry {
                path: PathBuf::from(&self.name),
                offset: 0,
                length: *length,
            }],
            Key::MultiFile { files } => {
                let mut offset = 0;
                files
                    .iter()
                    .map(|file| {
                        let mut path = PathBuf::from(&self.name);
                        path.extend(&file.path);
                        let entry = FileEntry {
                            path,
                            offset,
                            length: file.length,
                        };
                        offset += file.length;
                        entry
                    })
                    .collect()
            }
        }
    }

    fn validate(&self) -> Result<(), MetainfoError> {
        if self.piece_length == 0 {
            return Err(MetainfoError::Invalid("piece length is zero".to_string()));
        }
        let expected = self.total_length().div_ceil(self.piece_length) as usize;
        if expected != self.piece_count() {
            return Err(MetainfoError::Invalid(format!(
                "expected {expected} piece hashes, got {}",
                self.piece_count()
            )));
        }
        let mut components = vec![self.name.as_str()];
        if let Key::MultiFile { files } = &self.files {
            if files.iter().any(|f| f.path.is_empty()) {
                return Err(MetainfoError::Invalid("file with an empty path".to_string()));
            }
            components.extend(files.iter().flat_map(|f| f.path.iter().map(String::as_str)));
        }
        if let Some(bad) = components
            .into_iter()
            .find(|c| c.is_empty() || *c == "." || *c == ".." || c.contains('/'))
        {
            return Err(MetainfoError::Invalid(format!(
                "unsafe path component `{bad}`"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
impl Info {
    /// A single file torrent over `content`.
    pub(crate) fn single_file(name: &str, piece_length: u64, content: &[u8]) -> Self {
        let pieces = content
            .chunks(piece_length as usize)
            .map(|piece| InfoHash::of(piece).0)
            .collect();
        Self {
            name: name.to_string(),
            piece_length,
            pieces: Hashes(pieces),
            files: Key::SingleFile {
                length: content.len() as u64,
            },
            private: None,
        }
    }
}

#[cfg(test)]
impl Metainfo {
    pub(crate) fn from_info(info: Info) -> Self {
        let info_bytes = Bytes::from(bencode::encode(&info).expect("info encodes"));
        Self {
            announce: Vec::new(),
            info_hash: InfoHash::of(&info_bytes),
            info,
            info_bytes,
        }
    }
}

#[derive(Error, Debug)]
pub enum MetainfoError {
    #[error("Failed with error `{error}` to read file with path `{path}`")]
    IOReadError {
        error: std::io::Error,
        path: PathBuf,
    },
    #[error("Failed to deserialize the torrent bencode: `{0}`")]
    InvalidBencode(#[from] BencodeError),
    #[error("The metainfo has no info dictionary.")]
    MissingInfo,
    #[error("The metainfo is invalid: {0}")]
    Invalid(String),
    #[error("The metadata hashes to `{got}` but `{expected}` was expected.")]
    HashMismatch { expected: InfoHash, got: InfoHash },
}
