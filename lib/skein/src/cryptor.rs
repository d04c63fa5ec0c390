use keel::crypto;
use keel::encoding::hex;

/// Additional-data length prepended to every AEAD sealed message.
pub const AAD_LEN: usize = 16;

/// Upper bound on derived key material, set by the sha256 hexdigest width.
pub const MAX_KEY_LEN: usize = 64;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CipherKind {
    Aes256Gcm,
    Chacha20Poly1305,
    Chacha20,
}

impl CipherKind {
    pub fn from_name(name: &str) -> Option<CipherKind> {
        match name {
            "aes-256-gcm" => Some(CipherKind::Aes256Gcm),
            "chacha20-poly1305" => Some(CipherKind::Chacha20Poly1305),
            "chacha20" => Some(CipherKind::Chacha20),
            _ => None,
        }
    }

    #[inline]
    pub fn key_len(self) -> usize {
        match self {
            CipherKind::Chacha20 => crypto::STREAM_KEY_SIZE,
            _ => crypto::AEAD_KEY_SIZE,
        }
    }

    #[inline]
    pub fn nonce_len(self) -> usize {
        match self {
            CipherKind::Chacha20 => crypto::STREAM_NONCE_SIZE,
            _ => crypto::AEAD_NONCE_SIZE,
        }
    }

    #[inline]
    pub fn is_aead(self) -> bool {
        match self {
            CipherKind::Chacha20 => false,
            _ => true,
        }
    }
}

/// Derives key material from the shared password: the trailing `len` bytes
/// of the sha256 hexdigest.
pub fn derive_key(password: &str, len: usize) -> Vec<u8> {
    if len > MAX_KEY_LEN {
        panic!("key length {} exceeds the maximum of {}", len, MAX_KEY_LEN);
    }

    let digest = hex::encode(&crypto::sha256(password.as_bytes()));
    digest.as_bytes()[digest.len() - len..].to_vec()
}

/// Derives the bootstrap IV from the shared password: the trailing `len`
/// bytes of the twice-hashed hexdigest. This IV seeds the very first
/// connection to a peer and never rotates.
pub fn derive_default_iv(password: &str, len: usize) -> Vec<u8> {
    let first = hex::encode(&crypto::sha256(password.as_bytes()));
    let second = hex::encode(&crypto::sha256(first.as_bytes()));
    second.as_bytes()[second.len() - len..].to_vec()
}

#[derive(Debug, Eq, PartialEq)]
pub enum CryptoError {
    Truncated,
    Verification,
}

/// Holds the password-derived key material of a node and mints cryptors for
/// whichever IV a connection slot currently carries.
pub struct Keyring {
    kind: CipherKind,
    key: Vec<u8>,
    default_iv: Vec<u8>,
}

impl Keyring {
    /// Cipher and IV length come straight from the configuration, so any
    /// violation here is a startup error.
    pub fn new(cipher: &str, password: &str, iv_len: usize) -> Keyring {
        let kind = match CipherKind::from_name(cipher) {
            Some(kind) => kind,
            None => panic!("Unsupported cipher: {}", cipher),
        };

        if kind == CipherKind::Aes256Gcm && !crypto::aes256gcm_available() {
            panic!("aes-256-gcm is not available on this platform");
        }

        if iv_len != kind.nonce_len() {
            panic!(
                "iv_len must be {} for cipher {}, got {}",
                kind.nonce_len(),
                cipher,
                iv_len
            );
        }

        Keyring {
            kind,
            key: derive_key(password, kind.key_len()),
            default_iv: derive_default_iv(password, iv_len),
        }
    }

    #[inline]
    pub fn iv_len(&self) -> usize {
        self.default_iv.len()
    }

    /// Cryptor bound to a connection IV.
    #[inline]
    pub fn cryptor(&self, iv: &[u8]) -> Cryptor {
        Cryptor::new(self.kind, self.key.clone(), iv.to_vec())
    }

    /// Cryptor bound to the never-rotating bootstrap IV.
    #[inline]
    pub fn default_cryptor(&self) -> Cryptor {
        self.cryptor(&self.default_iv)
    }
}

/// Symmetric encrypt/decrypt state for one (cipher, key, iv) binding.
///
/// For the stream cipher the keystream position advances across calls;
/// `reset` rewinds it to the start of the IV. The datagram path resets
/// around every packet so that datagram loss cannot desynchronize peers.
/// AEAD sealing is per-message and carries `AAD_LEN` bytes of random
/// additional data plus the 16-byte tag, so sealed output is always
/// `AAD_LEN + len + 16` bytes.
pub struct Cryptor {
    kind: CipherKind,
    key: Vec<u8>,
    iv: Vec<u8>,
    counter: u32,
}

impl Cryptor {
    pub fn new(kind: CipherKind, key: Vec<u8>, iv: Vec<u8>) -> Cryptor {
        if key.len() != kind.key_len() {
            panic!("key must be {} bytes, got {}", kind.key_len(), key.len());
        }

        if iv.len() != kind.nonce_len() {
            panic!("iv must be {} bytes, got {}", kind.nonce_len(), iv.len());
        }

        Cryptor {
            kind,
            key,
            iv,
            counter: 0,
        }
    }

    pub fn encrypt(&mut self, plain: &[u8]) -> Vec<u8> {
        match self.kind {
            CipherKind::Chacha20 => {
                let mut data = plain.to_vec();
                let ok = crypto::chacha20_xor(&mut data, &self.iv, self.counter, &self.key);
                self.advance(plain.len());

                if !ok {
                    panic!("Stream cipher failure during encryption");
                }

                data
            }
            kind => {
                let mut aad = [0u8; AAD_LEN];
                crypto::random_bytes(&mut aad);

                let mut out = Vec::with_capacity(AAD_LEN + plain.len() + crypto::AEAD_TAG_SIZE);
                out.extend_from_slice(&aad);
                out.resize(AAD_LEN + plain.len() + crypto::AEAD_TAG_SIZE, 0);

                let ok = match kind {
                    CipherKind::Aes256Gcm => {
                        crypto::aes256gcm_encrypt(&mut out[AAD_LEN..], plain, &aad, &self.iv, &self.key)
                    }
                    _ => crypto::chacha20poly1305_encrypt(&mut out[AAD_LEN..], plain, &aad, &self.iv, &self.key),
                };

                if !ok {
                    panic!("AEAD failure during encryption");
                }

                out
            }
        }
    }

    pub fn decrypt(&mut self, cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self.kind {
            CipherKind::Chacha20 => {
                let mut data = cipher.to_vec();
                let ok = crypto::chacha20_xor(&mut data, &self.iv, self.counter, &self.key);
                self.advance(cipher.len());

                if !ok {
                    return Err(CryptoError::Verification);
                }

                Ok(data)
            }
            kind => {
                if cipher.len() < AAD_LEN + crypto::AEAD_TAG_SIZE {
                    return Err(CryptoError::Truncated);
                }

                let (aad, sealed) = cipher.split_at(AAD_LEN);
                let mut plain = vec![0u8; sealed.len() - crypto::AEAD_TAG_SIZE];

                let ok = match kind {
                    CipherKind::Aes256Gcm => {
                        crypto::aes256gcm_decrypt(&mut plain, sealed, aad, &self.iv, &self.key)
                    }
                    _ => crypto::chacha20poly1305_decrypt(&mut plain, sealed, aad, &self.iv, &self.key),
                };

                if !ok {
                    return Err(CryptoError::Verification);
                }

                Ok(plain)
            }
        }
    }

    /// Returns the cipher state to its initial IV.
    #[inline]
    pub fn reset(&mut self) {
        self.counter = 0;
    }

    #[inline]
    fn advance(&mut self, len: usize) {
        let blocks = (len + crypto::STREAM_BLOCK_SIZE - 1) / crypto::STREAM_BLOCK_SIZE;
        self.counter = self.counter.wrapping_add(blocks as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    const PASSWORD: &str = "an-exceedingly-shared-secret";

    fn random_payload(len: usize) -> Vec<u8> {
        let mut payload = vec![0u8; len];
        thread_rng().fill_bytes(&mut payload);
        payload
    }

    #[test]
    fn test_derive_key_shape() {
        let key = derive_key(PASSWORD, 32);

        assert_eq!(key.len(), 32);
        assert_eq!(key, derive_key(PASSWORD, 32));
        assert!(key.iter().all(|byte| byte.is_ascii_hexdigit()));
        assert_ne!(key, derive_key("another password", 32));
    }

    #[test]
    fn test_default_iv_differs_from_key() {
        let iv = derive_default_iv(PASSWORD, 12);

        assert_eq!(iv.len(), 12);
        assert_ne!(iv[..], derive_key(PASSWORD, 12)[..]);
    }

    #[test]
    #[should_panic(expected = "exceeds the maximum")]
    fn test_derive_key_bounded() {
        let _ = derive_key(PASSWORD, MAX_KEY_LEN + 1);
    }

    #[test]
    fn test_gcm_roundtrip_with_overhead() {
        if !keel::crypto::aes256gcm_available() {
            return;
        }

        let keyring = Keyring::new("aes-256-gcm", PASSWORD, 12);
        let plain = random_payload(40_000);

        let cipher = keyring.default_cryptor().encrypt(&plain);
        assert_eq!(cipher.len(), plain.len() + AAD_LEN + keel::crypto::AEAD_TAG_SIZE);

        let decrypted = keyring.default_cryptor().decrypt(&cipher).unwrap();
        assert_eq!(decrypted, plain);
    }

    #[test]
    fn test_chacha20poly1305_roundtrip_with_overhead() {
        let keyring = Keyring::new("chacha20-poly1305", PASSWORD, 12);
        let plain = random_payload(40_000);

        let cipher = keyring.default_cryptor().encrypt(&plain);
        assert_eq!(cipher.len(), plain.len() + AAD_LEN + keel::crypto::AEAD_TAG_SIZE);

        let decrypted = keyring.default_cryptor().decrypt(&cipher).unwrap();
        assert_eq!(decrypted, plain);
    }

    #[test]
    fn test_aead_rejects_tampering() {
        let keyring = Keyring::new("chacha20-poly1305", PASSWORD, 12);

        let mut cipher = keyring.default_cryptor().encrypt(b"payload");
        let last = cipher.len() - 1;
        cipher[last] ^= 0x01;

        let result = keyring.default_cryptor().decrypt(&cipher);

        assert_eq!(result.unwrap_err(), CryptoError::Verification);
    }

    #[test]
    fn test_aead_rejects_truncated_input() {
        let keyring = Keyring::new("chacha20-poly1305", PASSWORD, 12);

        let result = keyring.default_cryptor().decrypt(&[0u8; AAD_LEN]);

        assert_eq!(result.unwrap_err(), CryptoError::Truncated);
    }

    #[test]
    fn test_stream_roundtrip() {
        let keyring = Keyring::new("chacha20", PASSWORD, 12);
        let plain = random_payload(40_000);

        let cipher = keyring.default_cryptor().encrypt(&plain);
        assert_eq!(cipher.len(), plain.len());

        let decrypted = keyring.default_cryptor().decrypt(&cipher).unwrap();
        assert_eq!(decrypted, plain);
    }

    #[test]
    fn test_stream_counter_and_reset() {
        let keyring = Keyring::new("chacha20", PASSWORD, 12);

        let mut whole = keyring.default_cryptor();
        let joined = whole.encrypt(&[0x77; 256]);

        let mut split = keyring.default_cryptor();
        let mut first = split.encrypt(&[0x77; 128]);
        let second = split.encrypt(&[0x77; 128]);

        first.extend_from_slice(&second);
        assert_eq!(joined, first);

        // After a reset the keystream starts over.
        split.reset();
        assert_eq!(split.encrypt(&[0x77; 128]), &joined[..128]);
    }

    #[test]
    fn test_connection_iv_changes_sealed_bytes() {
        let keyring = Keyring::new("chacha20", PASSWORD, 12);

        let a = keyring.cryptor(&[1u8; 12]).encrypt(b"same plaintext");
        let b = keyring.cryptor(&[2u8; 12]).encrypt(b"same plaintext");

        assert_ne!(a, b);
    }

    #[test]
    #[should_panic(expected = "Unsupported cipher")]
    fn test_unknown_cipher_is_fatal() {
        let _ = Keyring::new("rot13", PASSWORD, 12);
    }

    #[test]
    #[should_panic(expected = "iv_len must be")]
    fn test_wrong_iv_len_is_fatal() {
        let _ = Keyring::new("chacha20-poly1305", PASSWORD, 8);
    }
}
