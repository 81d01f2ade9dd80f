use data_encoding::HEXLOWER;
use thiserror::Error;

/// A 20-byte Git object id.
///
/// This is an opaque content identifier handed to us by the upstream Git
/// store; equality is byte equality. The 40-character lowercase hex form is
/// used as the textual key in caches and the wire protocol.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct GitSha1([u8; GIT_SHA1_LEN]);

pub const GIT_SHA1_LEN: usize = 20;

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("invalid digest length: {0}")]
    InvalidDigestLen(usize),
    #[error("invalid hex digest: {0:?}")]
    InvalidHexDigest(String),
}

impl GitSha1 {
    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    /// Parses the 40-character hex form.
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let bytes = HEXLOWER
            .decode(s.to_ascii_lowercase().as_bytes())
            .map_err(|_| Error::InvalidHexDigest(s.to_string()))?;
        bytes.try_into()
    }

    /// Returns the 40-character hex form.
    pub fn hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }
}

impl From<&[u8; GIT_SHA1_LEN]> for GitSha1 {
    fn from(value: &[u8; GIT_SHA1_LEN]) -> Self {
        Self(*value)
    }
}

impl TryFrom<Vec<u8>> for GitSha1 {
    type Error = Error;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        let len = value.len();
        let arr: [u8; GIT_SHA1_LEN] = value.try_into().map_err(|_| Error::InvalidDigestLen(len))?;
        Ok(Self(arr))
    }
}

impl TryFrom<&[u8]> for GitSha1 {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; GIT_SHA1_LEN] = value
            .try_into()
            .map_err(|_| Error::InvalidDigestLen(value.len()))?;
        Ok(Self(arr))
    }
}

impl std::fmt::Display for GitSha1 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.hex())
    }
}

impl std::fmt::Debug for GitSha1 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.hex())
    }
}
