//! AEAD cipher abstraction and key derivation for the Shadowsocks stream
//! protocol: `[salt][chunk]*`, `chunk := [enc(len)][tag][enc(payload)][tag]`.
//!
//! Two independent pieces live here, deliberately kept apart from the
//! `tokio` I/O glue in [`super::session`]: [`AeadCipher`] seals/opens single
//! already-length-known buffers, while [`ChunkDecoder`] folds a three-valued
//! streaming discipline (`Ready`/`NeedMore`/`Error`) on top of it, so the
//! decode logic is testable without a socket.

use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;
use thiserror::Error;

use super::config::CipherKind;
use crate::config::SHADOWSOCKS_MAX_CHUNK_SIZE;

/// HKDF info string every AEAD Shadowsocks cipher derives its per-salt
/// subkey with.
const SUBKEY_INFO: &[u8] = b"ss-subkey";

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("AEAD authentication failed")]
    AuthenticationFailed,
    #[error("chunk payload length {0} exceeds the maximum frame size")]
    FrameTooLarge(usize),
}

enum Cipher {
    ChaCha20Poly1305(ChaCha20Poly1305),
    Aes128Gcm(Aes128Gcm),
    Aes256Gcm(Aes256Gcm),
}

/// One direction's AEAD context: a derived subkey plus the per-chunk nonce
/// counter, which starts at zero and increments once per sealed/opened
/// chunk (never reset for the lifetime of the direction).
pub struct AeadCipher {
    cipher: Cipher,
    nonce_counter: u64,
}

impl AeadCipher {
    pub fn new(kind: CipherKind, subkey: &[u8]) -> AeadCipher {
        let cipher = match kind {
            CipherKind::ChaCha20IetfPoly1305 => {
                Cipher::ChaCha20Poly1305(ChaCha20Poly1305::new_from_slice(subkey).expect(
                    "subkey length matches CipherKind::key_len",
                ))
            }
            CipherKind::Aes128Gcm => {
                Cipher::Aes128Gcm(Aes128Gcm::new_from_slice(subkey).expect(
                    "subkey length matches CipherKind::key_len",
                ))
            }
            CipherKind::Aes256Gcm => {
                Cipher::Aes256Gcm(Aes256Gcm::new_from_slice(subkey).expect(
                    "subkey length matches CipherKind::key_len",
                ))
            }
        };
        AeadCipher {
            cipher,
            nonce_counter: 0,
        }
    }

    /// 96-bit nonce: the chunk counter as little-endian bytes in the low
    /// 8 bytes, zero-padded, incrementing after every seal/open.
    fn next_nonce(&mut self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..8].copy_from_slice(&self.nonce_counter.to_le_bytes());
        self.nonce_counter = self.nonce_counter.wrapping_add(1);
        nonce
    }

    /// Seal `plaintext`, returning `plaintext || tag`.
    pub fn seal(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let nonce = self.next_nonce();
        let payload = Payload {
            msg: plaintext,
            aad: &[],
        };
        match &self.cipher {
            Cipher::ChaCha20Poly1305(c) => c.encrypt(&nonce.into(), payload),
            Cipher::Aes128Gcm(c) => c.encrypt(&nonce.into(), payload),
            Cipher::Aes256Gcm(c) => c.encrypt(&nonce.into(), payload),
        }
        .expect("AEAD sealing with a fresh nonce never fails")
    }

    /// Open `ciphertext || tag`, returning the plaintext or an
    /// authentication failure.
    pub fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.next_nonce();
        let payload = Payload {
            msg: sealed,
            aad: &[],
        };
        let result = match &self.cipher {
            Cipher::ChaCha20Poly1305(c) => c.decrypt(&nonce.into(), payload),
            Cipher::Aes128Gcm(c) => c.decrypt(&nonce.into(), payload),
            Cipher::Aes256Gcm(c) => c.decrypt(&nonce.into(), payload),
        };
        result.map_err(|_| CryptoError::AuthenticationFailed)
    }
}

/// EVP_BytesToKey-style, MD5-based iterative key derivation used when a
/// `password` (rather than a raw `key`) is configured: each round hashes
/// the previous digest concatenated with the password, until enough bytes
/// accumulate.
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + Md5::output_size());
    let mut prev_digest: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev_digest);
        hasher.update(password);
        let digest = hasher.finalize();
        key.extend_from_slice(&digest);
        prev_digest = digest.to_vec();
    }
    key.truncate(key_len);
    key
}

/// Per-salt subkey derivation: `HKDF-SHA1(master_key, salt, "ss-subkey")`,
/// truncated to `key_len`.
pub fn derive_subkey(master_key: &[u8], salt: &[u8], key_len: usize) -> Vec<u8> {
    let hk = Hkdf::<Sha1>::new(Some(salt), master_key);
    let mut subkey = vec![0u8; key_len];
    hk.expand(SUBKEY_INFO, &mut subkey)
        .expect("key_len is within HKDF-SHA1's output range for any realistic cipher");
    subkey
}

/// Outcome of feeding bytes into a [`ChunkDecoder`].
pub enum FeedResult {
    /// One or more complete chunks were decoded.
    Ready(Vec<Vec<u8>>),
    /// No complete chunk yet; the bytes are retained internally.
    NeedMore,
    /// Authentication failure or a frame exceeding the maximum chunk size.
    /// The session this decoder belongs to must be torn down; no further
    /// calls are meaningful.
    Error(CryptoError),
}

enum DecodeState {
    /// Waiting for the per-direction salt (`salt_len` bytes) before a
    /// subkey, and therefore a cipher, can be derived.
    Salt,
    /// Waiting for `2 + tag_len` bytes: the encrypted big-endian length.
    Length,
    /// Waiting for `payload_len + tag_len` bytes of encrypted payload.
    Payload { payload_len: usize },
}

/// Decodes one direction of the AEAD chunk stream, tolerating arbitrary
/// fragmentation of the underlying byte stream (a single `feed` call may
/// supply less than one chunk, exactly one, or several).
pub struct ChunkDecoder {
    kind: CipherKind,
    master_key: Vec<u8>,
    cipher: Option<AeadCipher>,
    state: DecodeState,
    buf: Vec<u8>,
}

impl ChunkDecoder {
    pub fn new(kind: CipherKind, master_key: Vec<u8>) -> ChunkDecoder {
        ChunkDecoder {
            kind,
            master_key,
            cipher: None,
            state: DecodeState::Salt,
            buf: Vec::new(),
        }
    }

    pub fn feed(&mut self, data: &[u8]) -> FeedResult {
        self.buf.extend_from_slice(data);
        let mut chunks = Vec::new();
        loop {
            match &self.state {
                DecodeState::Salt => {
                    let salt_len = self.kind.salt_len();
                    if self.buf.len() < salt_len {
                        break;
                    }
                    let salt: Vec<u8> = self.buf.drain(..salt_len).collect();
                    let subkey = derive_subkey(&self.master_key, &salt, self.kind.key_len());
                    self.cipher = Some(AeadCipher::new(self.kind, &subkey));
                    self.state = DecodeState::Length;
                }
                DecodeState::Length => {
                    let need = 2 + self.kind.tag_len();
                    if self.buf.len() < need {
                        break;
                    }
                    let sealed: Vec<u8> = self.buf.drain(..need).collect();
                    let plain = match self.cipher.as_mut().expect("salt phase runs first").open(&sealed)
                    {
                        Ok(p) => p,
                        Err(e) => return FeedResult::Error(e),
                    };
                    let payload_len = u16::from_be_bytes([plain[0], plain[1]]) as usize;
                    if payload_len > SHADOWSOCKS_MAX_CHUNK_SIZE {
                        return FeedResult::Error(CryptoError::FrameTooLarge(payload_len));
                    }
                    self.state = DecodeState::Payload { payload_len };
                }
                DecodeState::Payload { payload_len } => {
                    let payload_len = *payload_len;
                    let need = payload_len + self.kind.tag_len();
                    if self.buf.len() < need {
                        break;
                    }
                    let sealed: Vec<u8> = self.buf.drain(..need).collect();
                    let plain = match self.cipher.as_mut().expect("salt phase runs first").open(&sealed)
                    {
                        Ok(p) => p,
                        Err(e) => return FeedResult::Error(e),
                    };
                    chunks.push(plain);
                    self.state = DecodeState::Length;
                }
            }
        }
        if chunks.is_empty() {
            FeedResult::NeedMore
        } else {
            FeedResult::Ready(chunks)
        }
    }
}

/// Encodes one direction of the AEAD chunk stream. The salt is generated
/// and written by the caller (see [`super::session`]) before the first
/// chunk; this type only knows how to seal chunks once constructed with
/// the already-derived subkey.
pub struct ChunkEncoder {
    cipher: AeadCipher,
}

impl ChunkEncoder {
    pub fn new(kind: CipherKind, subkey: &[u8]) -> ChunkEncoder {
        ChunkEncoder {
            cipher: AeadCipher::new(kind, subkey),
        }
    }

    /// Encode `payload` (capped internally at [`SHADOWSOCKS_MAX_CHUNK_SIZE`]
    /// by the caller chunking larger writes) into one wire chunk:
    /// `enc(len) || tag || enc(payload) || tag`.
    pub fn encode_chunk(&mut self, payload: &[u8]) -> Vec<u8> {
        debug_assert!(payload.len() <= SHADOWSOCKS_MAX_CHUNK_SIZE);
        let len_bytes = (payload.len() as u16).to_be_bytes();
        let mut out = self.cipher.seal(&len_bytes);
        out.extend_from_slice(&self.cipher.seal(payload));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_kind(kind: CipherKind) {
        let master_key = evp_bytes_to_key(b"correct horse battery staple", kind.key_len());
        let salt = vec![0x42u8; kind.salt_len()];

        let enc_subkey = derive_subkey(&master_key, &salt, kind.key_len());
        let mut encoder = ChunkEncoder::new(kind, &enc_subkey);

        let mut decoder = ChunkDecoder::new(kind, master_key);

        let mut wire = salt.clone();
        for plaintext in [&b""[..], &b"x"[..], &vec![0xABu8; 16383][..]] {
            wire.extend_from_slice(&encoder.encode_chunk(plaintext));
        }

        match decoder.feed(&wire) {
            FeedResult::Ready(chunks) => {
                assert_eq!(chunks.len(), 3);
                assert_eq!(chunks[0], Vec::<u8>::new());
                assert_eq!(chunks[1], b"x".to_vec());
                assert_eq!(chunks[2], vec![0xABu8; 16383]);
            }
            _ => panic!("expected three ready chunks"),
        }
    }

    #[test]
    fn roundtrip_all_ciphers() {
        roundtrip_kind(CipherKind::ChaCha20IetfPoly1305);
        roundtrip_kind(CipherKind::Aes128Gcm);
        roundtrip_kind(CipherKind::Aes256Gcm);
    }

    #[test]
    fn decoder_needs_more_until_chunk_complete() {
        let kind = CipherKind::ChaCha20IetfPoly1305;
        let master_key = evp_bytes_to_key(b"hunter2", kind.key_len());
        let salt = vec![0x11u8; kind.salt_len()];
        let subkey = derive_subkey(&master_key, &salt, kind.key_len());
        let mut encoder = ChunkEncoder::new(kind, &subkey);

        let mut wire = salt.clone();
        wire.extend_from_slice(&encoder.encode_chunk(b"hello"));

        let mut decoder = ChunkDecoder::new(kind, master_key);
        for i in 0..wire.len() - 1 {
            match decoder.feed(&wire[i..i + 1]) {
                FeedResult::NeedMore => {}
                _ => panic!("byte {i} should not complete a chunk yet"),
            }
        }
        match decoder.feed(&wire[wire.len() - 1..]) {
            FeedResult::Ready(chunks) => assert_eq!(chunks, vec![b"hello".to_vec()]),
            _ => panic!("final byte should complete the chunk"),
        }
    }

    #[test]
    fn decoder_flags_auth_failure_on_bit_flip() {
        let kind = CipherKind::ChaCha20IetfPoly1305;
        let master_key = evp_bytes_to_key(b"hunter2", kind.key_len());
        let salt = vec![0x22u8; kind.salt_len()];
        let subkey = derive_subkey(&master_key, &salt, kind.key_len());
        let mut encoder = ChunkEncoder::new(kind, &subkey);

        let mut wire = salt.clone();
        wire.extend_from_slice(&encoder.encode_chunk(b"payload"));
        let flip_at = wire.len() - 1;
        wire[flip_at] ^= 0x01;

        let mut decoder = ChunkDecoder::new(kind, master_key);
        match decoder.feed(&wire) {
            FeedResult::Error(CryptoError::AuthenticationFailed) => {}
            _ => panic!("flipped tag bit should fail authentication"),
        }
    }

    #[test]
    fn evp_bytes_to_key_is_deterministic_and_sized() {
        let a = evp_bytes_to_key(b"password", 32);
        let b = evp_bytes_to_key(b"password", 32);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        let different = evp_bytes_to_key(b"other", 32);
        assert_ne!(a, different);
    }
}
