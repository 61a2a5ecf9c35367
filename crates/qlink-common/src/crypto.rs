//! Session crypto for the robot's local signaling handshake.
//!
//! The robot hands out an RSA public key wrapped in a notify blob. The
//! client answers with its offer encrypted under a fresh AES-256-ECB key,
//! and with that key encrypted under the robot's RSA key (PKCS#1 v1.5).
//! After the data channel opens, the robot issues validation challenges
//! answered with an MD5 digest.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyInit};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use md5::{Digest, Md5};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256EcbEnc = ecb::Encryptor<aes::Aes256>;
type Aes256EcbDec = ecb::Decryptor<aes::Aes256>;

/// Length of the notify blob prefix and suffix wrapped around the key body.
const BLOB_MARGIN: usize = 10;

/// Alphabet used to encode the digits of the connect path suffix.
const PATH_ALPHABET: &str = "ABCDEFGHIJ";

/// PKCS#1 v1.5 padding overhead in bytes.
const PKCS1_OVERHEAD: usize = 11;

/// Errors from session crypto primitives.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Symmetric key is not 32 bytes.
    #[error("invalid AES key length: {0} (expected 32)")]
    KeyLength(usize),
    /// Ciphertext was not valid base64.
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    /// Ciphertext length or padding was wrong for the key.
    #[error("AES decryption failed: bad padding or block length")]
    Padding,
    /// Decrypted text was not UTF-8.
    #[error("decrypted text is not UTF-8")]
    Utf8,
    /// The robot's public key could not be parsed.
    #[error("invalid RSA public key")]
    PublicKey,
    /// RSA encryption failed.
    #[error("RSA encryption failed: {0}")]
    Rsa(#[from] rsa::Error),
    /// The notify blob is too short or not ASCII.
    #[error("notify blob too short or malformed ({0} bytes)")]
    Blob(usize),
}

/// Ephemeral symmetric key for exactly one handshake.
///
/// Held as 32 lowercase hex characters; the ASCII bytes of that text are the
/// AES-256 key. Wiped on drop and never persisted.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionSecret(String);

impl SessionSecret {
    /// Generates a fresh secret from 16 bytes of OS randomness.
    ///
    /// # Examples
    ///
    /// ```
    /// use qlink_common::crypto::SessionSecret;
    ///
    /// let a = SessionSecret::generate();
    /// let b = SessionSecret::generate();
    /// assert_eq!(a.as_str().len(), 32);
    /// assert_ne!(a.as_str(), b.as_str());
    /// ```
    #[must_use]
    pub fn generate() -> Self {
        let mut raw = [0u8; 16];
        OsRng.fill_bytes(&mut raw);
        let hex: String = raw.iter().map(|b| format!("{b:02x}")).collect();
        raw.zeroize();
        Self(hex)
    }

    /// Hex text of the secret. This is also what gets RSA-encrypted.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// AES key bytes.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionSecret(..)")
    }
}

/// Encrypts `plaintext` with AES-256-ECB/PKCS#7 and returns base64.
///
/// # Errors
///
/// Returns [`CryptoError::KeyLength`] if `key` is not 32 bytes.
pub fn aes_ecb_encrypt(key: &[u8], plaintext: &[u8]) -> Result<String, CryptoError> {
    let cipher = Aes256EcbEnc::new_from_slice(key).map_err(|_| CryptoError::KeyLength(key.len()))?;
    let ct = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    Ok(STANDARD.encode(ct))
}

/// Decrypts base64 AES-256-ECB/PKCS#7 ciphertext into UTF-8 text.
///
/// Surrounding whitespace in `ciphertext_b64` is ignored.
///
/// # Errors
///
/// Returns an error on a bad key length, invalid base64, wrong padding or
/// non-UTF-8 plaintext.
pub fn aes_ecb_decrypt(key: &[u8], ciphertext_b64: &str) -> Result<String, CryptoError> {
    let cipher = Aes256EcbDec::new_from_slice(key).map_err(|_| CryptoError::KeyLength(key.len()))?;
    let ct = STANDARD.decode(ciphertext_b64.trim())?;
    let pt = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&ct)
        .map_err(|_| CryptoError::Padding)?;
    String::from_utf8(pt).map_err(|_| CryptoError::Utf8)
}

/// Parses the base64 DER body of a PEM public key.
///
/// Accepts SubjectPublicKeyInfo and falls back to bare PKCS#1.
///
/// # Errors
///
/// Returns [`CryptoError::Base64`] or [`CryptoError::PublicKey`].
pub fn parse_public_key(key_body: &str) -> Result<RsaPublicKey, CryptoError> {
    let compact: String = key_body.chars().filter(|c| !c.is_whitespace()).collect();
    let der = STANDARD.decode(compact)?;
    RsaPublicKey::from_public_key_der(&der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(&der))
        .map_err(|_| CryptoError::PublicKey)
}

/// RSA-encrypts `plaintext` (PKCS#1 v1.5) and returns base64.
///
/// Input longer than one block is split at `k - 11` bytes and the
/// ciphertext blocks are concatenated.
///
/// # Errors
///
/// Returns an error if the key body is unparseable or encryption fails.
pub fn rsa_encrypt(key_body: &str, plaintext: &[u8]) -> Result<String, CryptoError> {
    use rsa::traits::PublicKeyParts;

    let key = parse_public_key(key_body)?;
    let chunk = key.size().saturating_sub(PKCS1_OVERHEAD).max(1);
    let mut out = Vec::with_capacity(key.size() * plaintext.len().div_ceil(chunk).max(1));
    for block in plaintext.chunks(chunk) {
        out.extend(key.encrypt(&mut OsRng, Pkcs1v15Encrypt, block)?);
    }
    Ok(STANDARD.encode(out))
}

/// Splits a notify blob into the RSA key body and the connect path suffix.
///
/// The first and last 10 characters wrap the key. The trailing 10 encode
/// the suffix: in each 2-character chunk, the second character's index in
/// `A..J` is one decimal digit. Characters outside `A..J` are skipped.
///
/// # Errors
///
/// Returns [`CryptoError::Blob`] if the blob is shorter than 20 characters
/// or not ASCII.
///
/// # Examples
///
/// ```
/// use qlink_common::crypto::split_notify_blob;
///
/// let blob = "0123456789KEYBODYxAxBxCxDxE";
/// let (key, path) = split_notify_blob(blob).unwrap();
/// assert_eq!(key, "KEYBODY");
/// assert_eq!(path, "01234");
/// ```
pub fn split_notify_blob(blob: &str) -> Result<(&str, String), CryptoError> {
    if !blob.is_ascii() || blob.len() < 2 * BLOB_MARGIN {
        return Err(CryptoError::Blob(blob.len()));
    }
    let tail_start = blob.len() - BLOB_MARGIN;
    let key_body = &blob[BLOB_MARGIN..tail_start];
    let path_ending = blob.as_bytes()[tail_start..]
        .chunks(2)
        .filter_map(|chunk| chunk.get(1))
        .filter_map(|&c| PATH_ALPHABET.find(char::from(c)))
        .map(|idx| char::from(b'0' + idx as u8))
        .collect();
    Ok((key_body, path_ending))
}

/// Answer to a validation challenge: base64 of the raw MD5 digest of
/// `"{prefix}_{challenge}"`.
///
/// # Examples
///
/// ```
/// use qlink_common::crypto::validation_reply;
///
/// assert_eq!(validation_reply("X", "hello"), "C1kNi7MNPIbmtBT4eTVhuA==");
/// ```
#[must_use]
pub fn validation_reply(prefix: &str, challenge: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(prefix.as_bytes());
    hasher.update(b"_");
    hasher.update(challenge.as_bytes());
    STANDARD.encode(hasher.finalize())
}
