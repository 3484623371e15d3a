//! Poseidon sponge over the BN254 scalar field.
//!
//! One parameter set drives every hash in the system: account leaf hashes,
//! Merkle internal nodes, user/CEX asset commitments and the batch
//! commitment. The circuit side consumes the same instance, so in-circuit
//! and out-of-circuit digests agree.
//!
//! Rate 2 / capacity 1, alpha 5, 8 full and 57 partial rounds; round
//! constants and the MDS matrix are derived with the standard grain-LFSR
//! search for the 254-bit field.

use ark_bn254::Fr;
use ark_crypto_primitives::sponge::poseidon::{
    find_poseidon_ark_and_mds, PoseidonConfig, PoseidonSponge,
};
use ark_crypto_primitives::sponge::CryptographicSponge;
use ark_ff::{BigInteger, PrimeField};
use std::sync::OnceLock;

use crate::types::Bytes32;

const RATE: usize = 2;
const CAPACITY: usize = 1;
const ALPHA: u64 = 5;
const FULL_ROUNDS: usize = 8;
const PARTIAL_ROUNDS: usize = 57;

static CONFIG: OnceLock<PoseidonConfig<Fr>> = OnceLock::new();

/// The process-wide Poseidon parameter set.
pub fn poseidon_config() -> &'static PoseidonConfig<Fr> {
    CONFIG.get_or_init(|| {
        let (ark, mds) = find_poseidon_ark_and_mds::<Fr>(
            Fr::MODULUS_BIT_SIZE as u64,
            RATE,
            FULL_ROUNDS as u64,
            PARTIAL_ROUNDS as u64,
            0,
        );
        PoseidonConfig::new(FULL_ROUNDS, PARTIAL_ROUNDS, ALPHA, mds, ark, RATE, CAPACITY)
    })
}

/// Absorbs `inputs` and squeezes one field element.
pub fn poseidon_hash(inputs: &[Fr]) -> Fr {
    let mut sponge = PoseidonSponge::<Fr>::new(poseidon_config());
    for input in inputs {
        sponge.absorb(input);
    }
    sponge.squeeze_field_elements(1)[0]
}

/// Incremental sponge for long absorptions (asset commitments absorb up to
/// a few thousand elements; building the input vector twice is wasteful).
pub struct PoseidonHasher {
    sponge: PoseidonSponge<Fr>,
}

impl PoseidonHasher {
    pub fn new() -> Self {
        PoseidonHasher {
            sponge: PoseidonSponge::<Fr>::new(poseidon_config()),
        }
    }

    pub fn absorb(&mut self, input: &Fr) {
        self.sponge.absorb(input);
    }

    pub fn finalize(mut self) -> Fr {
        self.sponge.squeeze_field_elements(1)[0]
    }
}

impl Default for PoseidonHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical 32-byte big-endian form of a field element.
pub fn fr_to_bytes32(fr: &Fr) -> Bytes32 {
    let repr = fr.into_bigint().to_bytes_be();
    let mut out = [0u8; 32];
    out[32 - repr.len()..].copy_from_slice(&repr);
    out
}

/// Field element from big-endian bytes, reduced mod the field prime.
pub fn fr_from_bytes(bytes: &[u8]) -> Fr {
    Fr::from_be_bytes_mod_order(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_ff::Zero;

    #[test]
    fn test_hash_deterministic() {
        let a = poseidon_hash(&[Fr::from(1u64), Fr::from(2u64)]);
        let b = poseidon_hash(&[Fr::from(1u64), Fr::from(2u64)]);
        assert_eq!(a, b);
        let c = poseidon_hash(&[Fr::from(2u64), Fr::from(1u64)]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let inputs: Vec<Fr> = (0u64..37).map(Fr::from).collect();
        let mut hasher = PoseidonHasher::new();
        for v in &inputs {
            hasher.absorb(v);
        }
        assert_eq!(hasher.finalize(), poseidon_hash(&inputs));
    }

    #[test]
    fn test_bytes_roundtrip() {
        let fr = poseidon_hash(&[Fr::from(42u64)]);
        let bytes = fr_to_bytes32(&fr);
        assert_eq!(fr_from_bytes(&bytes), fr);

        let zero = fr_to_bytes32(&Fr::zero());
        assert_eq!(zero, [0u8; 32]);
    }
}
