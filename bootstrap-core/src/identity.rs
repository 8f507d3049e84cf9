// Identity of the running firmware image, sent to the update server as `Hash`

use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const IDENTITY_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("identity must be {expected} hex characters, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("invalid hex digit at position {0}")]
    Digit(usize),
}

/// SHA-256 of the running image. Rendered as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FirmwareIdentity([u8; IDENTITY_LEN]);

impl FirmwareIdentity {
    pub const fn from_bytes(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self(bytes)
    }

    /// Hash a complete image. Used on the host and by simulated devices;
    /// the device reads the digest the build embedded in its app descriptor.
    pub fn of_image(image: &[u8]) -> Self {
        Self(Sha256::digest(image).into())
    }

    pub fn from_hex(text: &str) -> Result<Self, IdentityError> {
        let text = text.trim_end_matches('\0').trim();
        let length_error = || IdentityError::Length {
            expected: IDENTITY_LEN * 2,
            actual: text.len(),
        };
        if text.len() != IDENTITY_LEN * 2 {
            return Err(length_error());
        }

        let mut bytes = [0u8; IDENTITY_LEN];
        hex::decode_to_slice(text, &mut bytes).map_err(|e| match e {
            hex::FromHexError::InvalidHexCharacter { index, .. } => IdentityError::Digit(index),
            _ => length_error(),
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for FirmwareIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = [0u8; IDENTITY_LEN * 2];
        hex::encode_to_slice(self.0, &mut buf).map_err(|_| fmt::Error)?;
        // hex output is always ASCII
        f.write_str(std::str::from_utf8(&buf).map_err(|_| fmt::Error)?)
    }
}

impl fmt::Debug for FirmwareIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FirmwareIdentity({})", self)
    }
}

impl FromStr for FirmwareIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trips_through_display() {
        let id = FirmwareIdentity::of_image(b"firmware image");
        let parsed: FirmwareIdentity = id.to_hex().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.to_hex().len(), 64);
        assert!(id.to_hex().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn known_digest() {
        let id = FirmwareIdentity::of_image(b"");
        assert_eq!(
            id.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn accepts_nul_terminated_buffer() {
        let hex = format!("{}\0", "ab".repeat(32));
        assert_eq!(FirmwareIdentity::from_hex(&hex).unwrap().as_bytes(), &[0xab; 32]);
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(
            FirmwareIdentity::from_hex("abcd"),
            Err(IdentityError::Length { expected: 64, actual: 4 })
        );
        let mut hex = "00".repeat(32);
        hex.replace_range(10..11, "g");
        assert_eq!(FirmwareIdentity::from_hex(&hex), Err(IdentityError::Digit(10)));
    }

    #[test]
    fn accepts_uppercase_and_renders_lowercase() {
        let upper = "AB".repeat(32);
        let id = FirmwareIdentity::from_hex(&upper).unwrap();
        assert_eq!(id.to_hex(), "ab".repeat(32));
        assert_eq!(id.to_string(), id.to_hex());
        assert_eq!(format!("{:?}", id), format!("FirmwareIdentity({})", "ab".repeat(32)));
    }
}
