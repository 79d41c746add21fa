#![forbid(unsafe_code)]
//! Cryptographic primitives for PFS images.
//!
//! Derives the signing and encryption keys from the EKPFS master secret and
//! the image seed, computes per-block HMAC-SHA256 signatures, and applies
//! the XTS-AES-128 sector transform. Key derivation is bit-exact with the
//! reference tooling: `HMAC-SHA256(EKPFS, index_le ‖ seed)` with index 1
//! for the encryption key and 2 for the signing key.

use aes::Aes128;
use aes::cipher::KeyInit;
use hmac::{Hmac, Mac};
use pfs_types::{EKPFS_SIZE, SEED_SIZE, SIG_SIZE};
use sha2::Sha256;
use xts_mode::{Xts128, get_tweak_default};

type HmacSha256 = Hmac<Sha256>;

/// XTS cipher sector size, independent of the PFS block size.
pub const XTS_SECTOR_SIZE: usize = 4096;

const KEY_INDEX_ENCRYPT: u32 = 1;
const KEY_INDEX_SIGN: u32 = 2;

/// HMAC-SHA256 of `data` under `key`.
#[must_use]
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; SIG_SIZE] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn derive_crypto_key(ekpfs: &[u8; EKPFS_SIZE], seed: &[u8; SEED_SIZE], index: u32) -> [u8; 32] {
    let mut message = [0_u8; 4 + SEED_SIZE];
    message[..4].copy_from_slice(&index.to_le_bytes());
    message[4..].copy_from_slice(seed);
    hmac_sha256(ekpfs, &message)
}

/// Derive the per-image block signing key.
#[must_use]
pub fn derive_sign_key(ekpfs: &[u8; EKPFS_SIZE], seed: &[u8; SEED_SIZE]) -> [u8; 32] {
    derive_crypto_key(ekpfs, seed, KEY_INDEX_SIGN)
}

/// Derive the per-image XTS key material (tweak key ‖ data key).
#[must_use]
pub fn derive_enc_key(ekpfs: &[u8; EKPFS_SIZE], seed: &[u8; SEED_SIZE]) -> [u8; 32] {
    derive_crypto_key(ekpfs, seed, KEY_INDEX_ENCRYPT)
}

/// Signing key wrapper applied to whole blocks (or the header span).
pub struct SigningKey {
    key: [u8; 32],
}

impl SigningKey {
    #[must_use]
    pub fn new(ekpfs: &[u8; EKPFS_SIZE], seed: &[u8; SEED_SIZE]) -> Self {
        Self {
            key: derive_sign_key(ekpfs, seed),
        }
    }

    #[must_use]
    pub fn sign(&self, data: &[u8]) -> [u8; SIG_SIZE] {
        hmac_sha256(&self.key, data)
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey").finish_non_exhaustive()
    }
}

/// XTS-AES-128 sector cipher.
///
/// The tweak is the absolute sector index, counted in 4096-byte sectors
/// from the start of the image.
pub struct XtsCipher {
    xts: Xts128<Aes128>,
}

impl XtsCipher {
    /// Build a cipher from derived key material: the first 16 bytes are
    /// the tweak key, the second 16 the data key.
    #[must_use]
    pub fn new(enc_key: &[u8; 32]) -> Self {
        let mut tweak_key = [0_u8; 16];
        let mut data_key = [0_u8; 16];
        tweak_key.copy_from_slice(&enc_key[..16]);
        data_key.copy_from_slice(&enc_key[16..]);

        let cipher_1 = Aes128::new((&data_key).into());
        let cipher_2 = Aes128::new((&tweak_key).into());
        Self {
            xts: Xts128::new(cipher_1, cipher_2),
        }
    }

    /// Build a cipher directly from EKPFS and the image seed.
    #[must_use]
    pub fn for_image(ekpfs: &[u8; EKPFS_SIZE], seed: &[u8; SEED_SIZE]) -> Self {
        Self::new(&derive_enc_key(ekpfs, seed))
    }

    /// Encrypt one sector in place. `buf` must be exactly one sector.
    pub fn encrypt_sector(&self, sector: u64, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), XTS_SECTOR_SIZE);
        self.xts
            .encrypt_sector(buf, get_tweak_default(u128::from(sector)));
    }

    /// Decrypt one sector in place. `buf` must be exactly one sector.
    pub fn decrypt_sector(&self, sector: u64, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), XTS_SECTOR_SIZE);
        self.xts
            .decrypt_sector(buf, get_tweak_default(u128::from(sector)));
    }
}

impl std::fmt::Debug for XtsCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XtsCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 4231 test case 2.
    #[test]
    fn hmac_sha256_known_vector() {
        let tag = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(tag),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn key_derivation_is_deterministic_and_index_separated() {
        let ekpfs = [0x11_u8; 32];
        let seed = [0x22_u8; 16];

        let sign_a = derive_sign_key(&ekpfs, &seed);
        let sign_b = derive_sign_key(&ekpfs, &seed);
        let enc = derive_enc_key(&ekpfs, &seed);

        assert_eq!(sign_a, sign_b);
        assert_ne!(sign_a, enc, "sign and enc keys must differ");

        let other_seed = [0x23_u8; 16];
        assert_ne!(derive_sign_key(&ekpfs, &other_seed), sign_a);
    }

    #[test]
    fn key_derivation_matches_manual_hmac() {
        let ekpfs = [0xAB_u8; 32];
        let seed = [0x05_u8; 16];

        let mut msg = Vec::new();
        msg.extend_from_slice(&2_u32.to_le_bytes());
        msg.extend_from_slice(&seed);
        assert_eq!(derive_sign_key(&ekpfs, &seed), hmac_sha256(&ekpfs, &msg));
    }

    #[test]
    fn signing_key_covers_full_input() {
        let key = SigningKey::new(&[7_u8; 32], &[0_u8; 16]);
        let a = key.sign(&[0_u8; 65536]);
        let mut data = [0_u8; 65536];
        data[65535] = 1;
        let b = key.sign(&data);
        assert_ne!(a, b);
    }

    #[test]
    fn xts_sector_round_trip() {
        let cipher = XtsCipher::for_image(&[0x42_u8; 32], &[0_u8; 16]);

        let mut sector = vec![0x5A_u8; XTS_SECTOR_SIZE];
        let plain = sector.clone();

        cipher.encrypt_sector(16, &mut sector);
        assert_ne!(sector, plain);

        cipher.decrypt_sector(16, &mut sector);
        assert_eq!(sector, plain);
    }

    #[test]
    fn xts_tweak_depends_on_sector_index() {
        let cipher = XtsCipher::for_image(&[0x42_u8; 32], &[0_u8; 16]);

        let mut a = vec![0_u8; XTS_SECTOR_SIZE];
        let mut b = vec![0_u8; XTS_SECTOR_SIZE];
        cipher.encrypt_sector(16, &mut a);
        cipher.encrypt_sector(17, &mut b);
        assert_ne!(a, b);
    }
}
