//! AES-128-CBC segment decryption (§4.1/§4.5).
//!
//! Mirrors the RustCrypto usage pattern for the `cbc`/`aes`/`cipher` crates:
//! construct a `cbc::Decryptor<Aes128>` from the raw key/IV and decrypt in
//! place. PKCS#7 unpadding is applied only to the stream's terminal segment —
//! HLS encrypts each segment independently but padding exists solely to round
//! the final segment out to a block boundary, so every non-terminal segment
//! is decrypted with `NoPadding` and kept at full length.

use aes::Aes128;
use cbc::cipher::{block_padding::NoPadding, block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};

use crate::error::DomainError;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Decrypt one HLS segment's ciphertext.
///
/// `is_terminal` selects whether PKCS#7 padding is stripped from the
/// decrypted output (the last segment of the stream) or the full
/// block-aligned plaintext is kept (every other segment).
pub fn decrypt_segment(
    ciphertext: &[u8],
    key: &[u8; 16],
    iv: &[u8; 16],
    is_terminal: bool,
) -> Result<Vec<u8>, DomainError> {
    let mut buffer = ciphertext.to_vec();
    let cipher = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|e| DomainError::DecryptionFailure(e.to_string()))?;

    let plaintext_len = if is_terminal {
        cipher
            .decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map_err(|e| DomainError::DecryptionFailure(e.to_string()))?
            .len()
    } else {
        cipher
            .decrypt_padded_mut::<NoPadding>(&mut buffer)
            .map_err(|e| DomainError::DecryptionFailure(e.to_string()))?
            .len()
    };
    buffer.truncate(plaintext_len);
    Ok(buffer)
}

/// Parse an explicit IV attribute: 32 hex chars, optionally `0x`-prefixed.
pub fn parse_iv_hex(iv_attr: &str) -> Result<[u8; 16], DomainError> {
    let trimmed = iv_attr.trim_start_matches("0x").trim_start_matches("0X");
    let mut iv = [0u8; 16];
    hex::decode_to_slice(trimmed, &mut iv)
        .map_err(|_| DomainError::KeyInvalid)?;
    Ok(iv)
}

/// Derive the IV from a segment's media sequence number when `EXT-X-KEY`
/// carries no explicit `IV` attribute: big-endian, zero-padded to 16 bytes.
pub fn derive_iv_from_sequence(media_sequence: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&media_sequence.to_be_bytes());
    iv
}

/// Resolve the IV to use for a segment: explicit attribute wins, otherwise
/// derive from the media sequence number.
pub fn resolve_iv(explicit: Option<&str>, media_sequence: u64) -> Result<[u8; 16], DomainError> {
    match explicit {
        Some(hex_str) => parse_iv_hex(hex_str),
        None => Ok(derive_iv_from_sequence(media_sequence)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::{BlockEncryptMut, KeyIvInit as _};

    type Aes128CbcEnc = cbc::Encryptor<Aes128>;

    fn encrypt_for_test(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16], pad: bool) -> Vec<u8> {
        let cipher = Aes128CbcEnc::new_from_slices(key, iv).unwrap();
        if pad {
            cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext)
        } else {
            cipher.encrypt_padded_vec_mut::<NoPadding>(plaintext)
        }
    }

    #[test]
    fn decrypts_terminal_segment_with_padding() {
        let key = [0x42u8; 16];
        let iv = [0x24u8; 16];
        let plaintext = b"hello hls segment data!";
        let ciphertext = encrypt_for_test(plaintext, &key, &iv, true);
        let out = decrypt_segment(&ciphertext, &key, &iv, true).unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn decrypts_non_terminal_segment_without_padding() {
        let key = [0x11u8; 16];
        let iv = [0x22u8; 16];
        let plaintext = [0x99u8; 32]; // exactly two blocks, no padding needed
        let ciphertext = encrypt_for_test(&plaintext, &key, &iv, false);
        let out = decrypt_segment(&ciphertext, &key, &iv, false).unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn parses_iv_with_and_without_0x_prefix() {
        let a = parse_iv_hex("0x000000000000000000000000000000ab").unwrap();
        let b = parse_iv_hex("000000000000000000000000000000ab").unwrap();
        assert_eq!(a, b);
        assert_eq!(a[15], 0xab);
    }

    #[test]
    fn derives_iv_from_sequence_number_big_endian() {
        let iv = derive_iv_from_sequence(42);
        assert_eq!(&iv[0..8], &[0u8; 8]);
        assert_eq!(&iv[8..], &42u64.to_be_bytes());
    }

    #[test]
    fn resolve_iv_prefers_explicit_over_derived() {
        let explicit = resolve_iv(Some("0x00000000000000000000000000000001"), 99).unwrap();
        assert_eq!(explicit[15], 1);
        let derived = resolve_iv(None, 99).unwrap();
        assert_eq!(derived, derive_iv_from_sequence(99));
    }
}
