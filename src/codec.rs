//! Wire codec — builders and parsers for the five framed GATT messages.
//!
//! Stateless transforms, first byte is the message type (§4.2). Every length
//! and type check lives here so `crate::presentation` never has to reason
//! about byte offsets. Grounded the way the teacher keeps wire-model types
//! next to their `From`/`TryFrom` conversions in `pairing/model.rs`, but
//! binary rather than JSON since the link is a single GATT characteristic.

use subtle::ConstantTimeEq;

use crate::crypto::{self, CryptoError, IV_LEN};

pub const TYPE_AUTH_REQUEST: u8 = 0x01;
pub const TYPE_AUTH_RESPONSE: u8 = 0x02;
pub const TYPE_CREDENTIAL: u8 = 0x03;
pub const TYPE_CREDENTIAL_RESPONSE: u8 = 0x04;
pub const TYPE_ERROR: u8 = 0xFF;

pub const NONCE_LEN: usize = 16;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("reader sent an empty response")]
    EmptyResponse,
    #[error("expected message type 0x{expected:02X}, got 0x{got:02X}")]
    UnexpectedType { expected: u8, got: u8 },
    #[error("response too short: expected at least {expected} bytes, got {got}")]
    ResponseTooShort { expected: usize, got: usize },
    #[error("unknown credential status byte: 0x{0:02X}")]
    UnknownStatus(u8),
    #[error("unknown reader error code: 0x{0:02X}")]
    UnknownError(u8),
    #[error("reader returned error: {0}")]
    ReaderError(ReaderErrorCode),
    #[error("reader echoed an unexpected Nonce_M — possible key mismatch or MitM")]
    NonceMismatch,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Fixed error-code → message table (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderErrorCode {
    InvalidMessage,
    UnknownDevice,
    DecryptionFailed,
    InvalidState,
    AuthFailed,
    Timeout,
}

impl ReaderErrorCode {
    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => Self::InvalidMessage,
            0x02 => Self::UnknownDevice,
            0x03 => Self::DecryptionFailed,
            0x04 => Self::InvalidState,
            0x05 => Self::AuthFailed,
            0x06 => Self::Timeout,
            _ => return None,
        })
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::InvalidMessage => "Communication error",
            Self::UnknownDevice => "Device not recognized",
            Self::DecryptionFailed => "Authentication failed",
            Self::InvalidState => "Protocol error",
            Self::AuthFailed => "Authentication failed",
            Self::Timeout => "Reader timeout",
        }
    }
}

impl std::fmt::Display for ReaderErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl CodecError {
    /// The user-visible terminal message for this error (§6's error table).
    /// `ReaderError` is surfaced as its table entry verbatim rather than
    /// through `Display`'s "reader returned error: ..." wrapper.
    pub fn terminal_message(&self) -> String {
        match self {
            Self::ReaderError(code) => code.message().to_string(),
            other => other.to_string(),
        }
    }
}

/// Fixed status-byte → message table (§6), used by `CREDENTIAL_RESPONSE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Success,
    Rejected,
    Expired,
    Revoked,
    InvalidFormat,
}

impl CredentialStatus {
    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x00 => Self::Success,
            0x01 => Self::Rejected,
            0x02 => Self::Expired,
            0x03 => Self::Revoked,
            0x04 => Self::InvalidFormat,
            _ => return None,
        })
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::Success => "Access granted",
            Self::Rejected => "Access denied",
            Self::Expired => "Credential expired",
            Self::Revoked => "Credential revoked",
            Self::InvalidFormat => "Invalid credential",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// `(success, message)` produced by parsing `CREDENTIAL_RESPONSE`, or by a
/// terminal engine failure.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PresentationResult {
    pub success: bool,
    pub message: String,
}

/// Checks the first byte of any inbound frame for emptiness or the shared
/// `ERROR` encoding. `Some(e)` means the caller should return `Err(e)`
/// immediately; `None` means keep parsing as the expected message type.
fn check_error_frame(bytes: &[u8]) -> Option<CodecError> {
    if bytes.is_empty() {
        return Some(CodecError::EmptyResponse);
    }
    if bytes[0] == TYPE_ERROR {
        return Some(match bytes.get(1).and_then(|b| ReaderErrorCode::from_byte(*b)) {
            Some(code) => CodecError::ReaderError(code),
            None => CodecError::UnknownError(*bytes.get(1).unwrap_or(&0)),
        });
    }
    None
}

/// Build `AUTH_REQUEST`: a fresh Nonce_M, encrypted under `device_key`.
///
/// Returns `(frame, nonce_m)` — the engine must hold on to `nonce_m` to
/// verify the reader's echo in `parse_auth_response`, and discard it the
/// moment the attempt leaves the Authenticating state.
pub fn build_auth_request(
    device_id: &[u8; 16],
    device_key: &[u8; crypto::KEY_LEN],
) -> Result<(Vec<u8>, [u8; NONCE_LEN]), CodecError> {
    let nonce_bytes = crypto::random(NONCE_LEN)?;
    let mut nonce_m = [0u8; NONCE_LEN];
    nonce_m.copy_from_slice(&nonce_bytes);

    let enc = crypto::encrypt(device_key, &nonce_m, None)?;

    let mut frame = Vec::with_capacity(1 + 16 + IV_LEN + enc.ciphertext.len());
    frame.push(TYPE_AUTH_REQUEST);
    frame.extend_from_slice(device_id);
    frame.extend_from_slice(&enc.iv);
    frame.extend_from_slice(&enc.ciphertext);
    Ok((frame, nonce_m))
}

/// Parse `AUTH_RESPONSE`, verifying the echoed Nonce_M in constant time.
///
/// Returns the reader's Nonce_R on success.
pub fn parse_auth_response(
    bytes: &[u8],
    device_key: &[u8; crypto::KEY_LEN],
    expected_nonce_m: &[u8; NONCE_LEN],
) -> Result<[u8; NONCE_LEN], CodecError> {
    if let Some(err) = check_error_frame(bytes) {
        return Err(err);
    }
    if bytes[0] != TYPE_AUTH_RESPONSE {
        return Err(CodecError::UnexpectedType {
            expected: TYPE_AUTH_RESPONSE,
            got: bytes[0],
        });
    }
    if bytes.len() < 65 {
        return Err(CodecError::ResponseTooShort {
            expected: 65,
            got: bytes.len(),
        });
    }

    let iv = &bytes[1..17];
    let ciphertext = &bytes[17..65];
    let plaintext = crypto::decrypt(device_key, iv, ciphertext)?;
    if plaintext.len() != 32 {
        return Err(CodecError::ResponseTooShort {
            expected: 32,
            got: plaintext.len(),
        });
    }

    let echoed = &plaintext[0..16];
    let matches: bool = echoed.ct_eq(expected_nonce_m).into();
    if !matches {
        return Err(CodecError::NonceMismatch);
    }

    let mut nonce_r = [0u8; NONCE_LEN];
    nonce_r.copy_from_slice(&plaintext[16..32]);
    Ok(nonce_r)
}

/// Build `CREDENTIAL`: the UTF-8 credential string encrypted under
/// `device_key`.
pub fn build_credential(
    device_key: &[u8; crypto::KEY_LEN],
    credential: &str,
) -> Result<Vec<u8>, CodecError> {
    let enc = crypto::encrypt(device_key, credential.as_bytes(), None)?;
    let mut frame = Vec::with_capacity(1 + IV_LEN + enc.ciphertext.len());
    frame.push(TYPE_CREDENTIAL);
    frame.extend_from_slice(&enc.iv);
    frame.extend_from_slice(&enc.ciphertext);
    Ok(frame)
}

/// Parse `CREDENTIAL_RESPONSE`.
pub fn parse_credential_response(bytes: &[u8]) -> Result<PresentationResult, CodecError> {
    if let Some(err) = check_error_frame(bytes) {
        return Err(err);
    }
    if bytes[0] != TYPE_CREDENTIAL_RESPONSE {
        return Err(CodecError::UnexpectedType {
            expected: TYPE_CREDENTIAL_RESPONSE,
            got: bytes[0],
        });
    }
    if bytes.len() < 2 {
        return Err(CodecError::ResponseTooShort {
            expected: 2,
            got: bytes.len(),
        });
    }

    let status = CredentialStatus::from_byte(bytes[1]).ok_or(CodecError::UnknownStatus(bytes[1]))?;
    Ok(PresentationResult {
        success: status.is_success(),
        message: status.message().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_ID: [u8; 16] = *b"a1b2c3d4e5f6a1b2";
    const DEVICE_KEY: [u8; 16] = *b"13f75379273f324d";

    #[test]
    fn build_then_parse_auth_round_trip() {
        let (frame, nonce_m) = build_auth_request(&DEVICE_ID, &DEVICE_KEY).unwrap();
        assert_eq!(frame.len(), 65);
        assert_eq!(frame[0], TYPE_AUTH_REQUEST);
        assert_eq!(&frame[1..17], &DEVICE_ID);

        // Simulate a reader echoing nonce_m and appending its own nonce_r.
        let nonce_r = [0x42u8; 16];
        let mut plaintext = nonce_m.to_vec();
        plaintext.extend_from_slice(&nonce_r);
        let enc = crypto::encrypt(&DEVICE_KEY, &plaintext, None).unwrap();
        let mut response = vec![TYPE_AUTH_RESPONSE];
        response.extend_from_slice(&enc.iv);
        response.extend_from_slice(&enc.ciphertext);

        let got_nonce_r = parse_auth_response(&response, &DEVICE_KEY, &nonce_m).unwrap();
        assert_eq!(got_nonce_r, nonce_r);
    }

    #[test]
    fn auth_response_rejects_empty() {
        assert_eq!(
            parse_auth_response(&[], &DEVICE_KEY, &[0u8; 16]).unwrap_err(),
            CodecError::EmptyResponse
        );
    }

    #[test]
    fn auth_response_rejects_wrong_type() {
        let bytes = vec![0x03u8; 65];
        assert_eq!(
            parse_auth_response(&bytes, &DEVICE_KEY, &[0u8; 16]).unwrap_err(),
            CodecError::UnexpectedType {
                expected: TYPE_AUTH_RESPONSE,
                got: 0x03
            }
        );
    }

    #[test]
    fn auth_response_rejects_short_length() {
        let mut bytes = vec![TYPE_AUTH_RESPONSE];
        bytes.extend_from_slice(&[0u8; 10]);
        assert_eq!(
            parse_auth_response(&bytes, &DEVICE_KEY, &[0u8; 16]).unwrap_err(),
            CodecError::ResponseTooShort {
                expected: 65,
                got: 11
            }
        );
    }

    #[test]
    fn auth_response_maps_error_frame() {
        let bytes = vec![TYPE_ERROR, 0x03];
        assert_eq!(
            parse_auth_response(&bytes, &DEVICE_KEY, &[0u8; 16]).unwrap_err(),
            CodecError::ReaderError(ReaderErrorCode::DecryptionFailed)
        );
    }

    #[test]
    fn auth_response_rejects_single_bit_flip_in_nonce_slot() {
        let (_, nonce_m) = build_auth_request(&DEVICE_ID, &DEVICE_KEY).unwrap();
        let nonce_r = [0x11u8; 16];
        let mut plaintext = nonce_m.to_vec();
        plaintext.extend_from_slice(&nonce_r);
        plaintext[0] ^= 0x01; // flip one bit of the echoed nonce
        let enc = crypto::encrypt(&DEVICE_KEY, &plaintext, None).unwrap();
        let mut response = vec![TYPE_AUTH_RESPONSE];
        response.extend_from_slice(&enc.iv);
        response.extend_from_slice(&enc.ciphertext);

        assert_eq!(
            parse_auth_response(&response, &DEVICE_KEY, &nonce_m).unwrap_err(),
            CodecError::NonceMismatch
        );
    }

    #[test]
    fn credential_round_trip_and_response_table() {
        let frame = build_credential(&DEVICE_KEY, "prod-pin_access_tool-7603489").unwrap();
        assert_eq!(frame[0], TYPE_CREDENTIAL);

        let cases = [
            (0x00u8, true, "Access granted"),
            (0x01, false, "Access denied"),
            (0x02, false, "Credential expired"),
            (0x03, false, "Credential revoked"),
            (0x04, false, "Invalid credential"),
        ];
        for (status, success, message) in cases {
            let resp = vec![TYPE_CREDENTIAL_RESPONSE, status];
            let result = parse_credential_response(&resp).unwrap();
            assert_eq!(result.success, success);
            assert_eq!(result.message, message);
        }
    }

    #[test]
    fn credential_response_rejects_unknown_status() {
        let resp = vec![TYPE_CREDENTIAL_RESPONSE, 0x99];
        assert_eq!(
            parse_credential_response(&resp).unwrap_err(),
            CodecError::UnknownStatus(0x99)
        );
    }

    #[test]
    fn credential_response_maps_error_frame() {
        let resp = vec![TYPE_ERROR, 0x06];
        assert_eq!(
            parse_credential_response(&resp).unwrap_err(),
            CodecError::ReaderError(ReaderErrorCode::Timeout)
        );
    }
}
