//! Chip identification
//!
//! The ROM answers `ReadInfo` with a 32-byte, NUL-padded ASCII string such
//! as `"K230D ..."`. Only the prefix decides the family.

use core::fmt;

use crate::error::ProtocolError;

/// Length of the CPU info block returned by the ROM
pub const CPU_INFO_LEN: usize = 0x20;

/// Signature at the start of every handshake response
pub const HANDSHAKE_SIGNATURE: &[u8; 4] = b"KDBR";

/// Base address of the mask ROM; executing here re-enters the loader
pub const MASK_ROM_BASE: u32 = 0x9120_0000;

/// Recognised SoC families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipFamily {
    /// K230 (external DRAM)
    K230,
    /// K230D (in-package DRAM)
    K230D,
}

impl ChipFamily {
    /// Family name as printed by the ROM
    pub fn name(&self) -> &'static str {
        match self {
            ChipFamily::K230 => "K230",
            ChipFamily::K230D => "K230D",
        }
    }
}

impl fmt::Display for ChipFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity reported by the ROM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipIdentity {
    /// Chip family
    pub family: ChipFamily,
    /// Full CPU info string with NUL padding removed
    pub info: String,
}

impl ChipIdentity {
    /// Parse the `ReadInfo` payload
    ///
    /// Unrecognised strings are fatal: staging firmware for the wrong SoC
    /// is never attempted.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let raw = &payload[..payload.len().min(CPU_INFO_LEN)];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let info = String::from_utf8_lossy(&raw[..end]).trim_end().to_string();

        // K230D must be tested first since it shares the K230 prefix
        let family = if info.starts_with("K230D") {
            ChipFamily::K230D
        } else if info.starts_with("K230") {
            ChipFamily::K230
        } else {
            return Err(ProtocolError::UnsupportedDevice(info));
        };

        Ok(Self { family, info })
    }
}

impl fmt::Display for ChipIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.info.is_empty() {
            write!(f, "{}", self.family)
        } else {
            f.write_str(&self.info)
        }
    }
}

/// Protocol version negotiated during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProtocolVersion {
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
}

impl ProtocolVersion {
    /// Create a protocol version
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Parse a handshake payload: signature followed by major and minor
    pub fn from_handshake(payload: &[u8]) -> Result<Self, ProtocolError> {
        match payload {
            [s0, s1, s2, s3, major, minor, ..] if [*s0, *s1, *s2, *s3] == *HANDSHAKE_SIGNATURE => {
                Ok(Self::new(*major, *minor))
            }
            _ => Err(ProtocolError::BadSignature(payload.to_vec())),
        }
    }

    /// Encode as a handshake payload
    pub fn to_handshake(&self) -> Vec<u8> {
        let mut payload = HANDSHAKE_SIGNATURE.to_vec();
        payload.push(self.major);
        payload.push(self.minor);
        payload
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_block(s: &str) -> Vec<u8> {
        let mut buf = vec![0u8; CPU_INFO_LEN];
        buf[..s.len()].copy_from_slice(s.as_bytes());
        buf
    }

    #[test]
    fn test_parse_k230d() {
        let id = ChipIdentity::parse(&info_block("K230D-V1.0")).unwrap();
        assert_eq!(id.family, ChipFamily::K230D);
        assert_eq!(id.info, "K230D-V1.0");
    }

    #[test]
    fn test_parse_k230() {
        let id = ChipIdentity::parse(&info_block("K230 rev B")).unwrap();
        assert_eq!(id.family, ChipFamily::K230);
        assert_eq!(id.to_string(), "K230 rev B");
    }

    #[test]
    fn test_parse_unsupported() {
        assert_eq!(
            ChipIdentity::parse(&info_block("K210")),
            Err(ProtocolError::UnsupportedDevice("K210".into()))
        );
        assert!(ChipIdentity::parse(&[0u8; CPU_INFO_LEN]).is_err());
    }

    #[test]
    fn test_handshake_payload() {
        let version = ProtocolVersion::new(1, 2);
        let payload = version.to_handshake();
        assert_eq!(&payload[..4], b"KDBR");
        assert_eq!(ProtocolVersion::from_handshake(&payload).unwrap(), version);
        assert_eq!(version.to_string(), "1.2");
    }

    #[test]
    fn test_handshake_bad_signature() {
        assert!(matches!(
            ProtocolVersion::from_handshake(b"KDBX\x01\x00"),
            Err(ProtocolError::BadSignature(_))
        ));
        assert!(matches!(
            ProtocolVersion::from_handshake(b"KDBR"),
            Err(ProtocolError::BadSignature(_))
        ));
    }
}
