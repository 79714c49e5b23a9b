//! Seed-to-key derivation for SecurityAccess (0x27)
//!
//! Two algorithm families cover the supported ECU generations. Current
//! bootloaders expect a 4-byte key taken from an AES-128-CFB keystream
//! whose key and IV come out of a SHA-256 digest; the previous
//! generation expects the first 8 bytes of an AES-CMAC over the seed.
//!
//! An all-zero seed is the ECU's way of saying the level is already
//! unlocked; callers must not send a key in that case.

use aes::Aes128;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use cfb_mode::Encryptor;
use cmac::{Cmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::SecurityAlgorithm;

/// Input to the SHA-256 stage of the CFB derivation.
const CFB_SECRET: [u8; 4] = [0x22, 0x4D, 0x08, 0x31];

/// Fixed AES key used by the CMAC derivation.
const CMAC_KEY: [u8; 16] = [
    0xF9, 0xA7, 0xBE, 0xB7, 0xE3, 0x46, 0x15, 0xB0, 0xE2, 0xD9, 0xF3, 0xE3, 0x07, 0xF2, 0xCD, 0x93,
];

/// Whether the seed signals an already-unlocked security level.
pub fn is_unlocked_seed(seed: &[u8]) -> bool {
    seed.iter().all(|&b| b == 0)
}

/// Derive the key for `seed` with the configured algorithm.
pub fn derive_key(algorithm: SecurityAlgorithm, seed: &[u8]) -> Vec<u8> {
    match algorithm {
        SecurityAlgorithm::Cfb => derive_cfb(seed),
        SecurityAlgorithm::Cmac => derive_cmac(seed),
    }
}

/// AES-128-CFB over the seed; the first 4 ciphertext bytes are the key.
fn derive_cfb(seed: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(CFB_SECRET);
    let digest = hasher.finalize();

    let mut key = [0u8; 16];
    let mut iv = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    iv.copy_from_slice(&digest[16..]);

    let mut buf = seed.to_vec();
    Encryptor::<Aes128>::new(&key.into(), &iv.into()).encrypt(&mut buf);
    buf.truncate(4);
    buf
}

/// AES-CMAC over the seed; the first 8 tag bytes are the key.
fn derive_cmac(seed: &[u8]) -> Vec<u8> {
    let mut mac = Cmac::<Aes128>::new(&CMAC_KEY.into());
    mac.update(seed);
    mac.finalize().into_bytes()[..8].to_vec()
}
