//! Connection identifiers.
//!
//! An id is a random 63-bit non-negative integer, rendered as lowercase hex
//! without a prefix for every external API.

use crate::error::{GatewayError, GatewayResult};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::str::FromStr;

/// Identifies one registered connection in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Largest representable id (`i64::MAX`).
    pub const MAX: u64 = i64::MAX as u64;

    /// Wrap a raw value. Returns `None` if it does not fit in 63 bits.
    pub fn new(raw: u64) -> Option<Self> {
        (raw <= Self::MAX).then_some(Self(raw))
    }

    /// Draw a fresh id from the OS secure random source.
    ///
    /// Collisions with ids already in use are not checked.
    pub fn generate() -> GatewayResult<Self> {
        let mut buf = [0u8; 8];
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| GatewayError::IdGeneration(e.to_string()))?;
        Ok(Self(u64::from_be_bytes(buf) & Self::MAX))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // from_str_radix tolerates a leading '+', the wire format does not.
        if s.is_empty() || s.starts_with('+') {
            return Err(GatewayError::InvalidId(format!("{s:?}")));
        }
        let raw = u64::from_str_radix(s, 16)
            .map_err(|e| GatewayError::InvalidId(format!("{s:?}: {e}")))?;
        Self::new(raw).ok_or_else(|| GatewayError::InvalidId(format!("{s:?}: out of range")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn renders_lowercase_hex() {
        let id = ConnectionId::new(123456).unwrap();
        assert_eq!(id.to_string(), "1e240");
        assert_eq!(ConnectionId::new(0x7b).unwrap().to_string(), "7b");
    }

    #[test]
    fn parses_rendered_form() {
        let id = ConnectionId::new(123456).unwrap();
        let parsed: ConnectionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        let max = ConnectionId::new(ConnectionId::MAX).unwrap();
        assert_eq!(max.to_string().parse::<ConnectionId>().unwrap(), max);
    }

    #[test]
    fn generated_ids_survive_hex() {
        for _ in 0..64 {
            let id = ConnectionId::generate().unwrap();
            assert!(id.get() <= ConnectionId::MAX);
            assert_eq!(id.to_string().parse::<ConnectionId>().unwrap(), id);
        }
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["", "z", "-1", "+1", "0x7b", "8000000000000000", "1 2"] {
            assert!(bad.parse::<ConnectionId>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn accepts_uppercase_digits() {
        assert_eq!("7B".parse::<ConnectionId>().unwrap().get(), 0x7b);
    }

    #[test]
    fn new_rejects_high_bit() {
        assert!(ConnectionId::new(1 << 63).is_none());
    }

    #[test]
    fn generated_ids_are_distinct() {
        let ids: HashSet<_> = (0..1000).map(|_| ConnectionId::generate().unwrap()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
