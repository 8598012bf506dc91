//! Boolean rule language used to select and colour features.

pub mod expr;
pub mod parser;
pub mod style;

use std::fmt;

use sha2::{Digest, Sha256};

pub use self::expr::{Expression, TriState};
pub use self::parser::{parse, ParseError, Rule};
pub use self::style::{ColorRule, Style};

/// Content hash of a rule tree, a style or a cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn builder() -> FingerprintBuilder {
        FingerprintBuilder(Sha256::new())
    }

    /// First eight bytes in hex, enough to name output files.
    pub fn short(&self) -> String {
        self.0[..8].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

pub struct FingerprintBuilder(Sha256);

impl FingerprintBuilder {
    pub fn bytes(mut self, bytes: &[u8]) -> Self {
        self.0.update(bytes);
        self
    }

    pub fn byte(self, byte: u8) -> Self {
        self.bytes(&[byte])
    }

    /// Length prefixed so that adjacent strings cannot run into each other.
    pub fn str(self, s: &str) -> Self {
        self.bytes(&(s.len() as u64).to_le_bytes()).bytes(s.as_bytes())
    }

    pub fn f64(self, value: f64) -> Self {
        self.bytes(&value.to_le_bytes())
    }

    pub fn fingerprint(self, other: &Fingerprint) -> Self {
        self.bytes(&other.0)
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.0.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_is_deterministic_and_order_sensitive() {
        let a = Fingerprint::builder().str("ab").str("c").finish();
        let b = Fingerprint::builder().str("ab").str("c").finish();
        let c = Fingerprint::builder().str("a").str("bc").finish();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string().len(), 64);
        assert_eq!(a.short().len(), 16);
    }
}
