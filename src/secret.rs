//! Redacting wrappers for credential material.
//!
//! `spec.md` §7's Sensitive-data policy says device_key, nonce_M, the
//! decrypted credential, and per-attempt IVs must never reach a required
//! diagnostic surface. The teacher's `telemetry::redact` module enforces a
//! similar policy by scanning free-form trace text for secret-shaped
//! substrings after the fact; here the fields that must never be logged are
//! wrapped in a type whose `Debug`/`Display` never print the payload, so the
//! guarantee holds structurally instead of depending on every call site
//! remembering to redact.

use std::fmt;

use zeroize::Zeroize;

/// A value that must never appear in logs, and is wiped from memory on drop.
#[derive(Clone)]
pub struct Secret<T: Zeroize + Clone>(T);

impl<T: Zeroize + Clone> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Explicit, deliberately-named accessor — callers must opt in to
    /// touching the raw bytes, which makes it easy to grep for every place
    /// that does.
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T: Zeroize + Clone> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

impl<T: Zeroize + Clone> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T: Zeroize + Clone> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_prints_payload() {
        let s = Secret::new([0xAAu8; 16]);
        assert_eq!(format!("{:?}", s), "Secret([REDACTED])");
        assert_eq!(format!("{}", s), "[REDACTED]");
    }

    #[test]
    fn expose_returns_the_value() {
        let s = Secret::new(*b"0123456789abcdef");
        assert_eq!(s.expose(), b"0123456789abcdef");
    }
}
