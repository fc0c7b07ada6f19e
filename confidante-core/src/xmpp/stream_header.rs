use std::fmt::{Display, Formatter};

use base64::prelude::*;
use rand::{RngCore, SeedableRng};

use super::jid::Jid;

/// Opaque per-stream token, used both as the `id` attribute on the
/// server's stream root and as the digest seed for legacy IQ-auth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamId(String);

impl StreamId {
    pub fn new() -> Self {
        let mut rng = rand_chacha::ChaCha20Rng::from_entropy();
        let mut id_raw = [0u8; 16];
        rng.fill_bytes(&mut id_raw);
        Self(BASE64_STANDARD.encode(id_raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StreamId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for StreamId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct LanguageTag(pub String);

/// Declared version of the stream root, driving the legacy-vs-modern
/// sub-variant split: absence selects the legacy sub-variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamVersion {
    pub major: u32,
    pub minor: u32,
}

impl StreamVersion {
    pub const V1_0: StreamVersion = StreamVersion { major: 1, minor: 0 };

    pub fn is_modern(&self) -> bool {
        *self >= Self::V1_0
    }
}

impl std::str::FromStr for StreamVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| anyhow::anyhow!("malformed stream version `{s}`"))?;
        Ok(StreamVersion {
            major: major.parse()?,
            minor: minor.parse()?,
        })
    }
}

#[derive(Debug, Default)]
pub struct StreamHeader {
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub id: Option<StreamId>,
    pub language: Option<LanguageTag>,
    pub version: Option<StreamVersion>,
    /// The root element's default (unprefixed) `xmlns`, e.g.
    /// `jabber:client` or `jabber:server`.
    pub default_namespace: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_1_0_is_modern() {
        assert!("1.0".parse::<StreamVersion>().unwrap().is_modern());
    }

    #[test]
    fn version_above_1_0_is_modern() {
        assert!("2.3".parse::<StreamVersion>().unwrap().is_modern());
    }

    #[test]
    fn version_below_1_0_is_not_modern() {
        assert!(!"0.9".parse::<StreamVersion>().unwrap().is_modern());
    }
}
