use std::fmt;

use rand::Rng as _;

const PREFIX: &[u8] = b"-UR1010-";

/// A 20-byte peer identity: the client tag followed by 12 random bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Generates a fresh id from the process-wide generator.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..PREFIX.len()].copy_from_slice(PREFIX);
        rand::rng().fill(&mut id[PREFIX.len()..]);
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    /// Two hex digits per byte, matching the shell's id rendering.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}
