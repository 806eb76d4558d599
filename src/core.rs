use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use flate2::Compression as Level;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use sha1::Digest as _;

use crate::error::ManifestError;
use crate::utils::hex;

/// Hash function used to address content in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgo {
    #[serde(rename = "sha-1")]
    Sha1,
    #[serde(rename = "sha-256")]
    Sha256,
    #[serde(rename = "blake3")]
    Blake3,
}

impl HashAlgo {
    /// The name written into `.isolated` files.
    pub fn name(self) -> &'static str {
        match self {
            HashAlgo::Sha1 => "sha-1",
            HashAlgo::Sha256 => "sha-256",
            HashAlgo::Blake3 => "blake3",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, ManifestError> {
        match name {
            "sha-1" => Ok(HashAlgo::Sha1),
            "sha-256" => Ok(HashAlgo::Sha256),
            "blake3" => Ok(HashAlgo::Blake3),
            other => Err(ManifestError::Algorithm(other.to_string())),
        }
    }

    /// Length of a hex-encoded digest.
    pub fn hex_len(self) -> usize {
        match self {
            HashAlgo::Sha1 => 40,
            HashAlgo::Sha256 | HashAlgo::Blake3 => 64,
        }
    }

    pub fn hasher(self) -> Hasher {
        match self {
            HashAlgo::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
            HashAlgo::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            HashAlgo::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }
}

/// Incremental hasher for any [`HashAlgo`].
pub enum Hasher {
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    pub fn update(&mut self, buffer: &[u8]) -> &mut Self {
        match self {
            Hasher::Sha1(h) => h.update(buffer),
            Hasher::Sha256(h) => h.update(buffer),
            Hasher::Blake3(h) => {
                h.update(buffer);
            }
        }
        self
    }

    pub fn finalize(self) -> Digest {
        let hex = match self {
            Hasher::Sha1(h) => hex(&h.finalize()),
            Hasher::Sha256(h) => hex(&h.finalize()),
            Hasher::Blake3(h) => hex(h.finalize().as_bytes()),
        };

        Digest(hex.into())
    }
}

/// Hex-encoded content digest. The universal key for dedup and caching.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(Box<str>);

impl Digest {
    /// Accepts a hex digest if it has the right shape for `algo`.
    pub fn parse(value: &str, algo: HashAlgo) -> Option<Self> {
        let valid = value.len() == algo.hex_len()
            && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));

        valid.then(|| Digest(value.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.0)
    }
}

/// Digest of an in-memory buffer.
pub fn digest(buffer: impl AsRef<[u8]>, algo: HashAlgo) -> Digest {
    let mut hasher = algo.hasher();
    hasher.update(buffer.as_ref());
    hasher.finalize()
}

/// Digest of a file on disk, streamed so large inputs never sit in memory.
pub fn digest_file(path: impl AsRef<Path>, algo: HashAlgo) -> io::Result<Digest> {
    if algo == HashAlgo::Blake3 {
        let hash = blake3::Hasher::new().update_mmap_rayon(path)?.finalize();
        return Ok(Digest(hex(hash.as_bytes()).into()));
    }

    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = algo.hasher();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hasher.finalize())
}

/// Transit compression. Digests are always over the uncompressed bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Zlib,
}

impl Compression {
    pub fn compress(self, buffer: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Compression::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Level::default());
                encoder.write_all(buffer)?;
                encoder.finish()
            }
        }
    }

    pub fn decompress(self, buffer: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Compression::Zlib => {
                let mut out = Vec::new();
                ZlibDecoder::new(buffer).read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}

/// Server-side bucket name, together with the hash and compression it implies.
///
/// * `default`, `default-gzip` → sha-1
/// * `sha256-…` → sha-256
/// * `blake3-…` → blake3
///
/// A `-gzip` or `-deflate` suffix selects zlib transit compression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    name: String,
    algo: HashAlgo,
    compression: Option<Compression>,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();

        let algo = if name.starts_with("sha256-") {
            HashAlgo::Sha256
        } else if name.starts_with("blake3-") {
            HashAlgo::Blake3
        } else {
            HashAlgo::Sha1
        };

        let compression = (name.ends_with("-gzip") || name.ends_with("-deflate"))
            .then_some(Compression::Zlib);

        Self {
            name,
            algo,
            compression,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn algo(&self) -> HashAlgo {
        self.algo
    }

    pub fn compression(&self) -> Option<Compression> {
        self.compression
    }

    pub fn digest(&self, buffer: impl AsRef<[u8]>) -> Digest {
        digest(buffer, self.algo)
    }

    /// Converts stored bytes into what goes over the wire.
    pub fn encode(&self, buffer: &[u8]) -> io::Result<Vec<u8>> {
        match self.compression {
            Some(compression) => compression.compress(buffer),
            None => Ok(buffer.to_vec()),
        }
    }

    /// Converts wire bytes back into the stored content.
    pub fn decode(&self, buffer: Vec<u8>) -> io::Result<Vec<u8>> {
        match self.compression {
            Some(compression) => compression.decompress(&buffer),
            None => Ok(buffer),
        }
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Namespace::new("default-gzip")
    }
}
