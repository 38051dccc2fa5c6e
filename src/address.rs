//! 128-bit interface address: parse/format/equality and RFC 4193 derivation
//! (spec §3, §4.1).

use std::fmt;

use rand_core::{CryptoRngCore, RngCore};
use sha1::{Digest, Sha1};

use crate::error::BusError;

pub const ADDRESS_LEN: usize = 16;

/// A 128-bit host identifier, byte-wise equal and hashed, rendered like an
/// IPv6 address (but not routable IPv6 traffic — see GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceAddress([u8; ADDRESS_LEN]);

impl InterfaceAddress {
    /// Construct from 16 octets, copying the input.
    pub const fn new(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    pub const fn new_zero() -> Self {
        Self([0u8; ADDRESS_LEN])
    }

    /// Parse the colon-separated hex-word form produced by [`Display`].
    ///
    /// No `::` zero-compression is accepted — exactly eight words are
    /// required, matching the format this core itself emits.
    pub fn parse(text: &str) -> Result<Self, BusError> {
        let words: Vec<&str> = text.split(':').collect();
        if words.len() != 8 {
            return Err(BusError::MalformedAddress(format!(
                "expected 8 colon-separated words, got {}",
                words.len()
            )));
        }

        let mut bytes = [0u8; ADDRESS_LEN];
        for (i, word) in words.iter().enumerate() {
            if word.is_empty() || word.len() > 4 {
                return Err(BusError::MalformedAddress(format!("bad word {:?}", word)));
            }
            let value = u16::from_str_radix(word, 16)
                .map_err(|e| BusError::MalformedAddress(format!("bad hex word {:?}: {e}", word)))?;
            bytes[i * 2] = (value >> 8) as u8;
            bytes[i * 2 + 1] = (value & 0xff) as u8;
        }

        Ok(Self(bytes))
    }

    /// Derive a unique-local address from a hardware MAC per RFC 4193:
    /// `0xfd` + 5 octets of `SHA1(random 64-bit seed || modified-EUI-64(mac))`
    /// + 2 zero octets + the modified-EUI-64 itself.
    pub fn from_mac_rfc4193<R: CryptoRngCore>(mac: &[u8], mut rng: R) -> Result<Self, BusError> {
        let eui64 = modified_eui64(mac)?;

        let mut seed = [0u8; 8];
        rng.fill_bytes(&mut seed);

        let mut hasher = Sha1::new();
        hasher.update(seed);
        hasher.update(eui64);
        let digest = hasher.finalize();

        let mut bytes = [0u8; ADDRESS_LEN];
        bytes[0] = 0xfd;
        bytes[1..6].copy_from_slice(&digest[..5]);
        bytes[6] = 0;
        bytes[7] = 0;
        bytes[8..16].copy_from_slice(&eui64);

        Ok(Self(bytes))
    }

    pub const fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl Default for InterfaceAddress {
    fn default() -> Self {
        Self::new_zero()
    }
}

impl fmt::Display for InterfaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..8 {
            let word = u16::from_be_bytes([self.0[i * 2], self.0[i * 2 + 1]]);
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:x}", word)?;
        }
        Ok(())
    }
}

impl TryFrom<&str> for InterfaceAddress {
    type Error = BusError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

/// Expand a 48-bit (or already-64-bit) hardware address into a modified
/// EUI-64: for a 48-bit MAC, split it, insert `ff:fe`, and flip the
/// universal/local bit of the first octet.
fn modified_eui64(mac: &[u8]) -> Result<[u8; 8], BusError> {
    match mac.len() {
        6 => {
            let mut eui = [0u8; 8];
            eui[0..3].copy_from_slice(&mac[0..3]);
            eui[3] = 0xff;
            eui[4] = 0xfe;
            eui[5..8].copy_from_slice(&mac[3..6]);
            eui[0] ^= 0x02;
            Ok(eui)
        }
        8 => {
            let mut eui = [0u8; 8];
            eui.copy_from_slice(mac);
            eui[0] ^= 0x02;
            Ok(eui)
        }
        other => Err(BusError::MalformedAddress(format!(
            "hardware address must be 6 or 8 octets, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn round_trips_through_string_form() {
        let bytes = [
            0xfd, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x01,
        ];
        let addr = InterfaceAddress::new(bytes);
        assert_eq!(addr.to_string(), "fd00:0:0:0:0:0:0:1");
        assert_eq!(InterfaceAddress::parse(&addr.to_string()).unwrap(), addr);
    }

    #[test]
    fn round_trip_is_exhaustive_over_byte_patterns() {
        for pattern in [0x00u8, 0xff, 0x5a, 0xa5] {
            let addr = InterfaceAddress::new([pattern; ADDRESS_LEN]);
            let text = addr.to_string();
            let parsed = InterfaceAddress::parse(&text).expect("parses back");
            assert_eq!(parsed.as_bytes(), addr.as_bytes());
        }
    }

    #[test]
    fn rejects_wrong_word_count() {
        assert!(InterfaceAddress::parse("fd00:0:0:0:0:0:0").is_err());
        assert!(InterfaceAddress::parse("fd00:0:0:0:0:0:0:1:2").is_err());
    }

    #[test]
    fn rejects_non_hex_word() {
        assert!(InterfaceAddress::parse("fd00:0:0:0:0:0:0:zz").is_err());
    }

    #[test]
    fn rfc4193_derivation_has_local_prefix_and_embeds_eui64() {
        let mac = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
        let addr = InterfaceAddress::from_mac_rfc4193(&mac, OsRng).expect("derives");
        let bytes = addr.as_bytes();

        assert_eq!(bytes[0], 0xfd);
        assert_eq!(bytes[6], 0);
        assert_eq!(bytes[7], 0);

        let eui = modified_eui64(&mac).unwrap();
        assert_eq!(&bytes[8..16], &eui[..]);
    }

    #[test]
    fn rfc4193_derivation_rejects_bad_mac_length() {
        let mac = [0u8; 5];
        assert!(InterfaceAddress::from_mac_rfc4193(&mac, OsRng).is_err());
    }
}
