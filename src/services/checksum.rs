//! Content digests for local files and `algorithm:hexdigest` checksum strings.

use md5::Context;
use sha2::{Digest, Sha256, Sha512};
use std::{fmt, io, path::Path, str::FromStr};
use thiserror::Error;
use tokio::{fs::File, io::AsyncReadExt};

const READ_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("malformed checksum `{0}`, expected `algorithm:hexdigest`")]
    Malformed(String),
    #[error("unsupported digest algorithm `{0}`")]
    UnsupportedAlgorithm(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
    Sha512,
}

impl FromStr for DigestAlgorithm {
    type Err = ChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            _ => Err(ChecksumError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        })
    }
}

/// A parsed `algorithm:hexdigest` reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: DigestAlgorithm,
    pub hex: String,
}

impl FromStr for Checksum {
    type Err = ChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| ChecksumError::Malformed(s.to_string()))?;
        let hex = hex.trim();
        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ChecksumError::Malformed(s.to_string()));
        }
        Ok(Self {
            algorithm: algorithm.trim().parse()?,
            hex: hex.to_string(),
        })
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl Checksum {
    pub fn matches(&self, hex: &str) -> bool {
        self.hex.eq_ignore_ascii_case(hex)
    }
}

/// Incremental digest over one of the supported algorithms.
pub enum Hasher {
    Md5(Context),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Md5 => Self::Md5(Context::new()),
            DigestAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => Self::Sha512(Sha512::new()),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        match self {
            Self::Md5(ctx) => ctx.consume(chunk),
            Self::Sha256(h) => h.update(chunk),
            Self::Sha512(h) => h.update(chunk),
        }
    }

    /// Lowercase hex digest.
    pub fn finish(self) -> String {
        match self {
            Self::Md5(ctx) => format!("{:x}", ctx.compute()),
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Digest of an in-memory buffer, formatted as `algorithm:hexdigest`.
pub fn digest_bytes(algorithm: DigestAlgorithm, data: &[u8]) -> String {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    format!("{}:{}", algorithm, hasher.finish())
}

/// Stream a file through the digest and return the lowercase hex value.
pub async fn file_digest(path: &Path, algorithm: DigestAlgorithm) -> io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finish())
}

/// Compare a local file against an `algorithm:hexdigest` reference.
///
/// A malformed reference or unknown algorithm is an error; a digest mismatch
/// is `Ok(false)`.
pub async fn verify_file(path: &Path, expected: &str) -> Result<bool, ChecksumError> {
    let checksum: Checksum = expected.parse()?;
    let actual = file_digest(path, checksum.algorithm).await?;
    Ok(checksum.matches(&actual))
}
