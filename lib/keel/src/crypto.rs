use ctor::ctor;
use libsodium_sys;
use std::mem;

pub const SHA256_SIZE: usize = libsodium_sys::crypto_hash_sha256_BYTES as usize;

pub const AEAD_TAG_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_ABYTES as usize;
pub const AEAD_KEY_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_KEYBYTES as usize;
pub const AEAD_NONCE_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_NPUBBYTES as usize;

pub const STREAM_KEY_SIZE: usize = libsodium_sys::crypto_stream_chacha20_ietf_KEYBYTES as usize;
pub const STREAM_NONCE_SIZE: usize = libsodium_sys::crypto_stream_chacha20_ietf_NONCEBYTES as usize;
pub const STREAM_BLOCK_SIZE: usize = 64;

/// Initialize the sodium infrastructure
#[ctor]
fn INIT_SODIUM() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

/// Fills the provided buffer with cryptographically secure random bytes
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}

/// Computes the sha256 digest of the supplied data in one shot.
#[inline]
pub fn sha256(data: &[u8]) -> [u8; SHA256_SIZE] {
    let mut digest = [0u8; SHA256_SIZE];

    unsafe {
        libsodium_sys::crypto_hash_sha256(digest.as_mut_ptr(), data.as_ptr(), data.len() as u64);
    }

    digest
}

/// Incremental sha256 state. Used where the digest input is assembled from
/// disjoint buffer regions and concatenating them first would mean an extra
/// copy of a whole datagram.
pub struct Sha256 {
    state: libsodium_sys::crypto_hash_sha256_state,
}

impl Sha256 {
    #[inline]
    pub fn new() -> Sha256 {
        unsafe {
            let mut state = mem::zeroed::<libsodium_sys::crypto_hash_sha256_state>();
            libsodium_sys::crypto_hash_sha256_init(&mut state);
            Sha256 { state }
        }
    }

    #[inline]
    pub fn update(&mut self, data: &[u8]) {
        unsafe {
            libsodium_sys::crypto_hash_sha256_update(&mut self.state, data.as_ptr(), data.len() as u64);
        }
    }

    #[inline]
    pub fn finalize(mut self) -> [u8; SHA256_SIZE] {
        let mut digest = [0u8; SHA256_SIZE];

        unsafe {
            libsodium_sys::crypto_hash_sha256_final(&mut self.state, digest.as_mut_ptr());
        }

        digest
    }
}

/// Returns true when the CPU supports hardware accelerated AES-256-GCM.
/// Callers must not select the GCM cipher on platforms where this is false.
#[inline]
pub fn aes256gcm_available() -> bool {
    unsafe { libsodium_sys::crypto_aead_aes256gcm_is_available() == 1 }
}

macro_rules! check_aead_lengths {
    ($op: expr, $cipher: expr, $plain: expr) => {
        if $cipher.len() != $plain.len() + AEAD_TAG_SIZE {
            panic!(
                "{}: cipher data length ({}) must be plain data length ({}) + tag size ({})",
                $op,
                $cipher.len(),
                $plain.len(),
                AEAD_TAG_SIZE
            )
        }
    };
}

/// Encrypts the plain text into the cipher buffer with ChaCha20-Poly1305
/// (IETF). The cipher buffer must be exactly the plain text size plus the tag
/// size. The additional data, nonce and key must match on decryption.
#[inline]
pub fn chacha20poly1305_encrypt(
    cipher: &mut [u8],
    plain: &[u8],
    additional_data: &[u8],
    nonce: &[u8],
    key: &[u8],
) -> bool {
    check_aead_lengths!("Encryption", cipher, plain);

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_encrypt(
            cipher.as_mut_ptr(),
            ::std::ptr::null_mut(),
            plain.as_ptr(),
            plain.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            ::std::ptr::null(),
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Decrypts ChaCha20-Poly1305 (IETF) cipher text into the plain buffer.
/// Returns false when the tag does not authenticate.
#[inline]
pub fn chacha20poly1305_decrypt(
    plain: &mut [u8],
    cipher: &[u8],
    additional_data: &[u8],
    nonce: &[u8],
    key: &[u8],
) -> bool {
    check_aead_lengths!("Decryption", cipher, plain);

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_decrypt(
            plain.as_mut_ptr(),
            ::std::ptr::null_mut(),
            ::std::ptr::null_mut(),
            cipher.as_ptr(),
            cipher.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// AES-256-GCM counterpart of `chacha20poly1305_encrypt`. Only valid on
/// platforms where `aes256gcm_available` returns true.
#[inline]
pub fn aes256gcm_encrypt(
    cipher: &mut [u8],
    plain: &[u8],
    additional_data: &[u8],
    nonce: &[u8],
    key: &[u8],
) -> bool {
    check_aead_lengths!("Encryption", cipher, plain);

    unsafe {
        let result = libsodium_sys::crypto_aead_aes256gcm_encrypt(
            cipher.as_mut_ptr(),
            ::std::ptr::null_mut(),
            plain.as_ptr(),
            plain.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            ::std::ptr::null(),
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// AES-256-GCM counterpart of `chacha20poly1305_decrypt`.
#[inline]
pub fn aes256gcm_decrypt(
    plain: &mut [u8],
    cipher: &[u8],
    additional_data: &[u8],
    nonce: &[u8],
    key: &[u8],
) -> bool {
    check_aead_lengths!("Decryption", cipher, plain);

    unsafe {
        let result = libsodium_sys::crypto_aead_aes256gcm_decrypt(
            plain.as_mut_ptr(),
            ::std::ptr::null_mut(),
            ::std::ptr::null_mut(),
            cipher.as_ptr(),
            cipher.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// XORs the buffer with the ChaCha20 (IETF) keystream in place, starting at
/// the given block counter. Encryption and decryption are the same operation.
#[inline]
pub fn chacha20_xor(data: &mut [u8], nonce: &[u8], block_counter: u32, key: &[u8]) -> bool {
    unsafe {
        let result = libsodium_sys::crypto_stream_chacha20_ietf_xor_ic(
            data.as_mut_ptr(),
            data.as_ptr(),
            data.len() as u64,
            nonce.as_ptr(),
            block_counter,
            key.as_ptr(),
        );

        result >= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_incremental_matches_oneshot() {
        let data = b"the quick brown fox jumps over the lazy dog";

        let mut state = Sha256::new();
        state.update(&data[..9]);
        state.update(&data[9..]);

        assert_eq!(state.finalize(), sha256(&data[..]));
    }

    #[test]
    fn test_chacha20poly1305_roundtrip() {
        let key = [7u8; AEAD_KEY_SIZE];
        let nonce = [3u8; AEAD_NONCE_SIZE];
        let ad = [1u8; 16];
        let plain = b"forwarding overlay";

        let mut cipher = vec![0u8; plain.len() + AEAD_TAG_SIZE];
        assert!(chacha20poly1305_encrypt(&mut cipher, &plain[..], &ad, &nonce, &key));

        let mut decrypted = vec![0u8; plain.len()];
        assert!(chacha20poly1305_decrypt(&mut decrypted, &cipher, &ad, &nonce, &key));

        assert_eq!(&decrypted[..], &plain[..]);
    }

    #[test]
    fn test_chacha20poly1305_rejects_forgery() {
        let key = [7u8; AEAD_KEY_SIZE];
        let nonce = [3u8; AEAD_NONCE_SIZE];
        let ad = [1u8; 16];
        let plain = b"forwarding overlay";

        let mut cipher = vec![0u8; plain.len() + AEAD_TAG_SIZE];
        assert!(chacha20poly1305_encrypt(&mut cipher, &plain[..], &ad, &nonce, &key));

        cipher[0] ^= 0x80;

        let mut decrypted = vec![0u8; plain.len()];
        assert!(!chacha20poly1305_decrypt(&mut decrypted, &cipher, &ad, &nonce, &key));
    }

    #[test]
    fn test_chacha20_xor_symmetric() {
        let key = [9u8; STREAM_KEY_SIZE];
        let nonce = [4u8; STREAM_NONCE_SIZE];

        let plain: Vec<u8> = (0..200).map(|unit| unit as u8).collect();
        let mut data = plain.clone();

        assert!(chacha20_xor(&mut data, &nonce, 0, &key));
        assert_ne!(data, plain);

        assert!(chacha20_xor(&mut data, &nonce, 0, &key));
        assert_eq!(data, plain);
    }

    #[test]
    fn test_chacha20_xor_counter_continuation() {
        let key = [9u8; STREAM_KEY_SIZE];
        let nonce = [4u8; STREAM_NONCE_SIZE];

        // Two blocks in one call must equal two calls with an advanced counter.
        let mut whole = [0x55u8; STREAM_BLOCK_SIZE * 2];
        assert!(chacha20_xor(&mut whole, &nonce, 0, &key));

        let mut first = [0x55u8; STREAM_BLOCK_SIZE];
        let mut second = [0x55u8; STREAM_BLOCK_SIZE];
        assert!(chacha20_xor(&mut first, &nonce, 0, &key));
        assert!(chacha20_xor(&mut second, &nonce, 1, &key));

        assert_eq!(&whole[..STREAM_BLOCK_SIZE], &first[..]);
        assert_eq!(&whole[STREAM_BLOCK_SIZE..], &second[..]);
    }

    #[test]
    fn test_random_bytes_fills() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];

        random_bytes(&mut a);
        random_bytes(&mut b);

        assert_ne!(a, b);
    }
}
