//! Symmetric crypto primitives: AES-128-CBC with PKCS#7 padding, and a
//! CSPRNG. Pure functions, no state — the counterpart of the teacher's
//! `relay/crypto.rs`, which builds a ChaCha20-Poly1305 session from an X25519
//! exchange. This module stays in the same RustCrypto trait family (`aes`,
//! `cbc`) but implements the block-cipher-plus-padding mode the wire codec
//! (`crate::codec`) requires instead of an AEAD.

use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

pub const KEY_LEN: usize = 16;
pub const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key size: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeySize(usize),
    #[error("invalid iv size: expected {IV_LEN} bytes, got {0}")]
    InvalidIvSize(usize),
    #[error("ciphertext is empty or not a multiple of the block size")]
    CipherFailure,
    #[error("invalid PKCS#7 padding")]
    InvalidPadding,
    #[error("secure random generation failed")]
    RandomFailure,
}

/// Result of [`encrypt`] — the IV used (generated if the caller didn't
/// supply one) plus the ciphertext.
#[derive(Debug, Clone)]
pub struct Encrypted {
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
}

/// `CBC(key, iv, PKCS7(plaintext))`. Generates a fresh random IV when `iv`
/// is `None`.
pub fn encrypt(
    key: &[u8],
    plaintext: &[u8],
    iv: Option<[u8; IV_LEN]>,
) -> Result<Encrypted, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeySize(key.len()));
    }
    let iv = match iv {
        Some(iv) => iv,
        None => {
            let bytes = random(IV_LEN)?;
            let mut buf = [0u8; IV_LEN];
            buf.copy_from_slice(&bytes);
            buf
        }
    };

    let cipher = Aes128CbcEnc::new_from_slices(key, &iv)
        .map_err(|_| CryptoError::InvalidIvSize(iv.len()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    Ok(Encrypted { iv, ciphertext })
}

/// `stripPKCS7(CBC⁻¹(key, iv, ciphertext))`.
///
/// Requires `ciphertext` to be non-empty and a multiple of the AES block
/// size; padding is validated strictly by the underlying `Pkcs7` unpadder
/// (last byte `p` in `1..=16`, the trailing `p` bytes all equal `p`, and `p`
/// no larger than the buffer itself) — any violation is `InvalidPadding`.
pub fn decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeySize(key.len()));
    }
    if iv.len() != IV_LEN {
        return Err(CryptoError::InvalidIvSize(iv.len()));
    }
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::CipherFailure);
    }

    let cipher =
        Aes128CbcDec::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidIvSize(iv.len()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::InvalidPadding)
}

/// `n` bytes from an OS-grade CSPRNG.
pub fn random(n: usize) -> Result<Vec<u8>, CryptoError> {
    let mut buf = vec![0u8; n];
    rand::rngs::OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|_| CryptoError::RandomFailure)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key16() -> [u8; KEY_LEN] {
        let mut k = [0u8; KEY_LEN];
        for (i, b) in k.iter_mut().enumerate() {
            *b = i as u8;
        }
        k
    }

    #[test]
    fn round_trip_empty_and_typical_plaintexts() {
        let key = key16();
        for pt in [&b""[..], b"a", b"prod-pin_access_tool-7603489", &[0u8; 64]] {
            let enc = encrypt(&key, pt, None).unwrap();
            let dec = decrypt(&key, &enc.iv, &enc.ciphertext).unwrap();
            assert_eq!(dec, pt);
        }
    }

    #[test]
    fn rejects_wrong_key_size() {
        let short_key = [0u8; 8];
        assert_eq!(
            encrypt(&short_key, b"x", None).unwrap_err(),
            CryptoError::InvalidKeySize(8)
        );
        assert_eq!(
            decrypt(&short_key, &[0u8; IV_LEN], &[0u8; 16]).unwrap_err(),
            CryptoError::InvalidKeySize(8)
        );
    }

    #[test]
    fn rejects_wrong_iv_size() {
        let key = key16();
        assert_eq!(
            decrypt(&key, &[0u8; 4], &[0u8; 16]).unwrap_err(),
            CryptoError::InvalidIvSize(4)
        );
    }

    #[test]
    fn rejects_empty_or_unaligned_ciphertext() {
        let key = key16();
        let iv = [0u8; IV_LEN];
        assert_eq!(decrypt(&key, &iv, &[]).unwrap_err(), CryptoError::CipherFailure);
        assert_eq!(
            decrypt(&key, &iv, &[0u8; 17]).unwrap_err(),
            CryptoError::CipherFailure
        );
    }

    #[test]
    fn flipping_last_ciphertext_byte_trips_padding_or_succeeds_deterministically() {
        // A single flipped ciphertext byte scrambles the final plaintext
        // block (CBC) and very likely invalidates its PKCS#7 padding. We
        // assert it is never silently accepted with a different length.
        let key = key16();
        let enc = encrypt(&key, b"a full sixteen byte block!", None).unwrap();
        let mut tampered = enc.ciphertext.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xFF;
        match decrypt(&key, &enc.iv, &tampered) {
            Err(CryptoError::InvalidPadding) => {}
            Ok(pt) => assert_ne!(pt, b"a full sixteen byte block!"),
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    proptest! {
        #[test]
        fn round_trip_holds_for_arbitrary_plaintexts(pt in proptest::collection::vec(any::<u8>(), 0..512)) {
            let key = key16();
            let enc = encrypt(&key, &pt, None).unwrap();
            let dec = decrypt(&key, &enc.iv, &enc.ciphertext).unwrap();
            prop_assert_eq!(dec, pt);
        }
    }
}
