//! Small formatting helpers shared by the modules.

use std::fmt::{self, Display, Formatter};


/// Implement `Debug` by forwarding to `Display`.
macro_rules! debug_display {
    ($type:ident) => {
        impl std::fmt::Debug for $type {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                std::fmt::Display::fmt(self, f)
            }
        }
    };
}

/// Write a signed value as hex with an explicit sign, e.g. `+0x19` or `-0x35`.
pub fn write_signed_hex(f: &mut Formatter, value: i64) -> fmt::Result {
    if value >= 0 {
        write!(f, "+{:#x}", value)
    } else {
        write!(f, "-{:#x}", (value as i128).abs())
    }
}

/// Displays the wrapped value like [`write_signed_hex`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SignedHex(pub i64);

impl Display for SignedHex {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write_signed_hex(f, self.0)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_hex() {
        assert_eq!(SignedHex(0x19).to_string(), "+0x19");
        assert_eq!(SignedHex(-0x35).to_string(), "-0x35");
        assert_eq!(SignedHex(0).to_string(), "+0x0");
        assert_eq!(SignedHex(i64::MIN).to_string(), "-0x8000000000000000");
    }
}
