//! Degraded-trust shared secret for fallback pairing.
//!
//! A pairing established without signature verification stores a locally
//! generated random seed instead of a controller public key. Later
//! messages are authenticated with an HMAC-SHA256 tag keyed by a value
//! derived from that seed. This trust model is strictly weaker than
//! asymmetric verification and is only reachable through an explicit
//! opt-in at pairing time.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::utils::constant_time_compare;

type HmacSha256 = Hmac<Sha256>;

/// Length of the persisted seed in bytes.
pub const SEED_LEN: usize = 32;

/// Length of the keyed tag standing in for a signature.
pub const TAG_LEN: usize = 32;

// Fixed domain label. MUST NOT change once deployments persist seeds.
const MAC_KEY_LABEL: &[u8] = b"steward degraded mac key v1";

/// Locally generated pairing secret. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret {
    seed: [u8; SEED_LEN],
}

impl SharedSecret {
    /// Generate a fresh secret from the OS random source.
    pub fn generate() -> Self {
        let mut seed = [0u8; SEED_LEN];
        OsRng.fill_bytes(&mut seed);
        Self { seed }
    }

    /// Rebuild a secret from a persisted seed.
    pub fn from_seed(seed: [u8; SEED_LEN]) -> Self {
        Self { seed }
    }

    /// Raw seed bytes, for persistence.
    pub fn seed(&self) -> &[u8; SEED_LEN] {
        &self.seed
    }

    /// MAC key = HKDF-SHA256(seed) expanded under the fixed domain label.
    fn mac_key(&self) -> [u8; 32] {
        let hk = Hkdf::<Sha256>::new(None, &self.seed);
        let mut okm = [0u8; 32];
        hk.expand(MAC_KEY_LABEL, &mut okm)
            .expect("32 bytes is a valid hkdf output length");
        okm
    }

    /// Compute the keyed tag over `message`.
    pub fn tag(&self, message: &[u8]) -> [u8; TAG_LEN] {
        let mut key = self.mac_key();
        let mut mac =
            HmacSha256::new_from_slice(&key).expect("HMAC can take keys of any size");
        mac.update(message);
        let out = mac.finalize().into_bytes();
        key.zeroize();
        let mut arr = [0u8; TAG_LEN];
        arr.copy_from_slice(&out);
        arr
    }

    /// Verify a tag over `message` in constant time.
    ///
    /// Fails closed on any tag length other than [`TAG_LEN`].
    pub fn verify(&self, message: &[u8], tag: &[u8]) -> bool {
        if tag.len() != TAG_LEN {
            return false;
        }
        constant_time_compare(&self.tag(message), tag)
    }
}
