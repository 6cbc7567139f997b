//! Master secret derivation and password verification

use crate::error::{Result, SwitchCryptError};
use crate::header::{HASH_BYTES, SALT_BYTES};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use zeroize::Zeroizing;

/// 32-byte master secret, wiped from memory on drop
pub type MasterSecret = Zeroizing<[u8; 32]>;

/// Default Argon2 memory cost in KiB (19 MiB)
pub const DEFAULT_M_COST: u32 = 19 * 1024;
/// Default Argon2 time cost (iterations)
pub const DEFAULT_T_COST: u32 = 2;
/// Default Argon2 parallelism
pub const DEFAULT_P_COST: u32 = 1;

/// Turns a password and the device salt into the master secret
pub trait SecretDeriver: Send {
    fn derive_master_secret(&self, password: &[u8], salt: &[u8; SALT_BYTES]) -> Result<MasterSecret>;
}

/// Argon2id password derivation
#[derive(Debug, Clone, Copy)]
pub struct Argon2Deriver {
    m_cost: u32,
    t_cost: u32,
    p_cost: u32,
}

impl Argon2Deriver {
    pub fn new(m_cost: u32, t_cost: u32, p_cost: u32) -> Self {
        Argon2Deriver {
            m_cost,
            t_cost,
            p_cost,
        }
    }

    /// Minimal-cost parameters for tests and throwaway devices
    pub fn light() -> Self {
        Self::new(Params::MIN_M_COST, 1, 1)
    }
}

impl Default for Argon2Deriver {
    fn default() -> Self {
        Self::new(DEFAULT_M_COST, DEFAULT_T_COST, DEFAULT_P_COST)
    }
}

impl SecretDeriver for Argon2Deriver {
    fn derive_master_secret(&self, password: &[u8], salt: &[u8; SALT_BYTES]) -> Result<MasterSecret> {
        let params = Params::new(self.m_cost, self.t_cost, self.p_cost, Some(32))
            .map_err(|e| SwitchCryptError::KeyDerivation(format!("invalid Argon2 parameters: {e}")))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut secret = Zeroizing::new([0u8; 32]);
        argon2
            .hash_password_into(password, salt, &mut secret[..])
            .map_err(|e| SwitchCryptError::KeyDerivation(format!("Argon2 failed: {e}")))?;

        Ok(secret)
    }
}

/// Verification tag stored in the header: a keyed hash of the salt
pub fn verification_tag(master: &[u8; 32], salt: &[u8; SALT_BYTES]) -> [u8; HASH_BYTES] {
    *blake3::keyed_hash(master, salt).as_bytes()
}

/// Fresh random salt for a new device
pub fn generate_salt() -> [u8; SALT_BYTES] {
    let mut salt = [0u8; SALT_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Constant-time equality for secrets and tags
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let deriver = Argon2Deriver::light();
        let salt = [1u8; SALT_BYTES];

        let a = deriver.derive_master_secret(b"t3st", &salt).unwrap();
        let b = deriver.derive_master_secret(b"t3st", &salt).unwrap();
        assert_eq!(*a, *b);

        let other = deriver.derive_master_secret(b"t3st", &[2u8; SALT_BYTES]).unwrap();
        assert_ne!(*a, *other);
    }

    #[test]
    fn test_verification_tag_depends_on_secret() {
        let salt = generate_salt();
        let tag = verification_tag(&[1u8; 32], &salt);

        assert!(ct_eq(&tag, &verification_tag(&[1u8; 32], &salt)));
        assert!(!ct_eq(&tag, &verification_tag(&[2u8; 32], &salt)));
    }

    #[test]
    fn test_invalid_params_are_reported() {
        let deriver = Argon2Deriver::new(1, 1, 1);
        assert!(matches!(
            deriver.derive_master_secret(b"pw", &[0u8; SALT_BYTES]),
            Err(SwitchCryptError::KeyDerivation(_))
        ));
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"ab"));
    }
}
