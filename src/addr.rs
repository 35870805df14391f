/* 48-bit Bluetooth device address, stored in the wire byte order used by
 * the L2CAP sockaddr (least significant byte first). */

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid Bluetooth address: {0:?}")]
pub struct AddrParseError(String);

/* Peer or adapter address. `BdAddr::ANY` binds a listener to every local
 * adapter, like the kernel's BDADDR_ANY. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    pub const ANY: BdAddr = BdAddr([0; 6]);

    pub fn is_any(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl fmt::Display for BdAddr {
    /* Conventional colon-separated rendering, most significant byte first. */
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[5], b[4], b[3], b[2], b[1], b[0]
        )
    }
}

impl FromStr for BdAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = 0;
        for (i, part) in s.split(':').enumerate() {
            if i >= 6 || part.len() != 2 {
                return Err(AddrParseError(s.to_string()));
            }
            bytes[5 - i] =
                u8::from_str_radix(part, 16).map_err(|_| AddrParseError(s.to_string()))?;
            parts += 1;
        }
        if parts != 6 {
            return Err(AddrParseError(s.to_string()));
        }
        Ok(BdAddr(bytes))
    }
}
