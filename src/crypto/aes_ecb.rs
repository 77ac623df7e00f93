//! AES-128-ECB with the non-standard zero-padding both wire protocols use.
//!
//! Ciphertext length is always a multiple of 16; trailing plaintext bytes
//! beyond the caller's data are zero. This is *not* PKCS#7 padding and must
//! not be "fixed" to look like it — stripping padding by content length,
//! not by a padding byte, is the only correct approach (callers know the
//! real length from a LEN field elsewhere in the frame).

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::error::{Error, Result};

/// How to handle an AES key that isn't exactly 16 bytes.
///
/// The spec requires rejecting non-16-byte keys by default; leniency is an
/// explicit, caller-opted-into exception, never the default path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyLeniency {
    /// Reject anything but a 16-byte key.
    Strict,
    /// Truncate keys longer than 16 bytes, zero-pad keys shorter than 16.
    /// A `log::warn!` is emitted whenever this path actually changes the key.
    TruncateOrZeroPad,
}

fn normalize_key(key: &[u8], leniency: KeyLeniency) -> Result<[u8; 16]> {
    if key.len() == 16 {
        let mut out = [0u8; 16];
        out.copy_from_slice(key);
        return Ok(out);
    }

    match leniency {
        KeyLeniency::Strict => Err(Error::decoding(format!(
            "AES key must be exactly 16 bytes, got {}",
            key.len()
        ))),
        KeyLeniency::TruncateOrZeroPad => {
            log::warn!(
                "AES key length {} is not 16 bytes; truncating/zero-padding to fit (non-standard leniency enabled)",
                key.len()
            );
            let mut out = [0u8; 16];
            let n = key.len().min(16);
            out[..n].copy_from_slice(&key[..n]);
            Ok(out)
        }
    }
}

fn zero_padded_blocks(plaintext: &[u8]) -> Vec<u8> {
    let padded_len = plaintext.len().div_ceil(16) * 16;
    let mut buf = vec![0u8; padded_len];
    buf[..plaintext.len()].copy_from_slice(plaintext);
    buf
}

/// Encrypts `plaintext`, zero-padding it up to the next 16-byte multiple.
/// Ciphertext length equals the padded length.
pub fn encrypt_zero_padded(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    encrypt_zero_padded_with(plaintext, key, KeyLeniency::Strict)
}

pub fn encrypt_zero_padded_with(plaintext: &[u8], key: &[u8], leniency: KeyLeniency) -> Result<Vec<u8>> {
    let key = normalize_key(key, leniency)?;
    let cipher = Aes128::new(&key.into());

    let mut buf = zero_padded_blocks(plaintext);
    for block in buf.chunks_exact_mut(16) {
        let generic = aes::cipher::generic_array::GenericArray::from_mut_slice(block);
        cipher.encrypt_block(generic);
    }
    Ok(buf)
}

/// Decrypts `ciphertext`, which must be a multiple of 16 bytes. The caller
/// is responsible for truncating the zero-padded tail back to the real
/// content length (known from a LEN field, not from the padding itself).
pub fn decrypt_zero_padded(ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    decrypt_zero_padded_with(ciphertext, key, KeyLeniency::Strict)
}

pub fn decrypt_zero_padded_with(ciphertext: &[u8], key: &[u8], leniency: KeyLeniency) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(Error::decoding(format!(
            "AES-ECB ciphertext length {} is not a non-zero multiple of 16",
            ciphertext.len()
        )));
    }

    let key = normalize_key(key, leniency)?;
    let cipher = Aes128::new(&key.into());

    let mut buf = ciphertext.to_vec();
    for block in buf.chunks_exact_mut(16) {
        let generic = aes::cipher::generic_array::GenericArray::from_mut_slice(block);
        cipher.decrypt_block(generic);
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = *b"1234567890123456";

    #[test]
    fn round_trip_recovers_plaintext_modulo_padding() {
        let plaintext = b"hello lock world";
        let ct = encrypt_zero_padded(plaintext, &KEY).unwrap();
        assert_eq!(ct.len(), 32);

        let pt = decrypt_zero_padded(&ct, &KEY).unwrap();
        assert_eq!(&pt[..plaintext.len()], plaintext);
        assert!(pt[plaintext.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn encrypt_pads_up_to_block_multiple() {
        let ct = encrypt_zero_padded(&[0u8; 1], &KEY).unwrap();
        assert_eq!(ct.len(), 16);

        let ct = encrypt_zero_padded(&[0u8; 16], &KEY).unwrap();
        assert_eq!(ct.len(), 16);

        let ct = encrypt_zero_padded(&[0u8; 17], &KEY).unwrap();
        assert_eq!(ct.len(), 32);
    }

    #[test]
    fn strict_leniency_rejects_bad_key_length() {
        let bad_key = [0u8; 8];
        assert!(encrypt_zero_padded(b"x", &bad_key).is_err());
    }

    #[test]
    fn lenient_leniency_accepts_short_key() {
        let bad_key = [1u8; 8];
        assert!(encrypt_zero_padded_with(b"x", &bad_key, KeyLeniency::TruncateOrZeroPad).is_ok());
    }

    #[test]
    fn decrypt_rejects_non_multiple_of_16() {
        assert!(decrypt_zero_padded(&[0u8; 15], &KEY).is_err());
        assert!(decrypt_zero_padded(&[], &KEY).is_err());
    }
}
