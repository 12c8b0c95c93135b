use std::fmt::{Debug, Display, Formatter};
use bytes::Bytes;

/// A peer's public key as it appears on the wire. The key is opaque here: it is neither parsed
///  nor checked for well-formedness, and its lowercase hex representation serves as the lookup key
///  for the connection registry.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct PeerKey(Bytes);

impl PeerKey {
    pub fn new(raw: impl Into<Bytes>) -> PeerKey {
        PeerKey(raw.into())
    }

    pub fn from_hex(hex_str: &str) -> Result<PeerKey, hex::FromHexError> {
        Ok(PeerKey(hex::decode(hex_str)?.into()))
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl Debug for PeerKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerKey({})", self.hex())
    }
}

impl Display for PeerKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hex())
    }
}
