use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CredentialError {
    #[error("{field}: invalid hex: {source}")]
    BadHex {
        field: &'static str,
        source: hex::FromHexError,
    },

    #[error("{field}: expected {expected} bytes, got {got}")]
    BadLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AppKey([u8; 16]);

impl AppKey {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// Network join credentials. Parsed once at startup; a bad value is a
/// configuration error, never a runtime retry condition.
#[derive(Clone)]
pub struct Credentials {
    pub dev_eui: [u8; 8],
    pub join_eui: [u8; 8],
    app_key: AppKey,
}

impl Credentials {
    pub fn parse(dev_eui: &str, join_eui: &str, app_key: &str) -> Result<Self, CredentialError> {
        Ok(Self {
            dev_eui: decode_fixed("dev_eui", dev_eui)?,
            join_eui: decode_fixed("join_eui", join_eui)?,
            app_key: AppKey(decode_fixed("app_key", app_key)?),
        })
    }

    pub fn app_key(&self) -> &AppKey {
        &self.app_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("dev_eui", &hex::encode_upper(self.dev_eui))
            .field("join_eui", &hex::encode_upper(self.join_eui))
            .field("app_key", &"<redacted>")
            .finish()
    }
}

fn decode_fixed<const N: usize>(field: &'static str, s: &str) -> Result<[u8; N], CredentialError> {
    let raw = hex::decode(s.trim()).map_err(|source| CredentialError::BadHex { field, source })?;
    let got = raw.len();
    raw.try_into()
        .map_err(|_| CredentialError::BadLength { field, expected: N, got })
}
