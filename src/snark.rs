//! SNARK Backend Module
//!
//! Groth16 over BN254 against externally generated parameter triples. Each
//! user-size tier owns three artifacts on disk: `<session>.r1cs` (sparse
//! constraint matrices), `<session>.pk` and `<session>.vk`, produced by the
//! offline key-generation ceremony against the assignment layout of
//! [`crate::circuit`].
//!
//! # Loading
//!
//! Parameter files run into tens of gigabytes. They are streamed from a
//! buffered reader straight into the arkworks deserializer, one artifact at
//! a time, so at most one decoded artifact plus one file stream is resident
//! while swapping tiers. The proving key is read unchecked (point validation
//! on a trusted local artifact would double the load time); the verifying
//! key is always read checked.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use ark_bn254::{Bn254, Fr};
use ark_groth16::{Groth16, PreparedVerifyingKey, Proof, ProvingKey, VerifyingKey};
use ark_relations::r1cs::ConstraintMatrices;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_snark::SNARK;
use ark_std::UniformRand;
use rand::Rng;

use crate::error::PorError;
use crate::error::Result as PorResult;

/// Serializable form of the constraint matrices: A/B/C rows of
/// `(coefficient, column)` pairs plus the variable counts.
#[derive(Clone, CanonicalSerialize, CanonicalDeserialize)]
pub struct R1csArtifact {
    pub num_instance_variables: u64,
    pub num_witness_variables: u64,
    pub num_constraints: u64,
    pub a: Vec<Vec<(Fr, u64)>>,
    pub b: Vec<Vec<(Fr, u64)>>,
    pub c: Vec<Vec<(Fr, u64)>>,
}

impl R1csArtifact {
    fn to_matrices(&self) -> ConstraintMatrices<Fr> {
        let convert = |m: &Vec<Vec<(Fr, u64)>>| -> Vec<Vec<(Fr, usize)>> {
            m.iter()
                .map(|row| row.iter().map(|&(c, col)| (c, col as usize)).collect())
                .collect()
        };
        let nnz = |m: &Vec<Vec<(Fr, u64)>>| m.iter().map(|row| row.len()).sum();
        ConstraintMatrices {
            num_instance_variables: self.num_instance_variables as usize,
            num_witness_variables: self.num_witness_variables as usize,
            num_constraints: self.num_constraints as usize,
            a_num_non_zero: nnz(&self.a),
            b_num_non_zero: nnz(&self.b),
            c_num_non_zero: nnz(&self.c),
            a: convert(&self.a),
            b: convert(&self.b),
            c: convert(&self.c),
        }
    }
}

fn open_reader(path: &str) -> PorResult<BufReader<File>> {
    let file = File::open(Path::new(path))
        .map_err(|e| PorError::ConfigInvariant(format!("open snark artifact {}: {}", path, e)))?;
    Ok(BufReader::new(file))
}

/// One tier's `(r1cs, pk, vk)` triple, held in memory by exactly one owner.
pub struct SnarkParams {
    matrices: ConstraintMatrices<Fr>,
    proving_key: ProvingKey<Bn254>,
    verifying_key: VerifyingKey<Bn254>,
    prepared_vk: PreparedVerifyingKey<Bn254>,
}

impl SnarkParams {
    /// Streams the three artifacts of `session_name` from disk.
    pub fn load(session_name: &str) -> PorResult<Self> {
        tracing::info!("loading r1cs for session {}", session_name);
        let artifact =
            R1csArtifact::deserialize_uncompressed(open_reader(&format!("{}.r1cs", session_name))?)
                .map_err(|e| {
                    PorError::CryptoFailure(format!("r1cs {} deserialize: {}", session_name, e))
                })?;
        let matrices = artifact.to_matrices();
        drop(artifact);
        tracing::info!(
            "r1cs loaded: {} constraints, {} instance vars",
            matrices.num_constraints,
            matrices.num_instance_variables
        );

        tracing::info!("loading proving key for session {}", session_name);
        let proving_key = ProvingKey::<Bn254>::deserialize_uncompressed_unchecked(open_reader(
            &format!("{}.pk", session_name),
        )?)
        .map_err(|e| PorError::CryptoFailure(format!("pk {} deserialize: {}", session_name, e)))?;

        tracing::info!("loading verifying key for session {}", session_name);
        let verifying_key = VerifyingKey::<Bn254>::deserialize_uncompressed(open_reader(&format!(
            "{}.vk",
            session_name
        ))?)
        .map_err(|e| PorError::CryptoFailure(format!("vk {} deserialize: {}", session_name, e)))?;
        let prepared_vk = prepare_vk(&verifying_key)?;

        Ok(SnarkParams {
            matrices,
            proving_key,
            verifying_key,
            prepared_vk,
        })
    }

    /// Groth16 proof over the full assignment `[1, public, private…]`.
    pub fn prove(&self, full_assignment: &[Fr], rng: &mut impl Rng) -> PorResult<Proof<Bn254>> {
        let r = Fr::rand(rng);
        let s = Fr::rand(rng);
        Groth16::<Bn254>::create_proof_with_reduction_and_matrices(
            &self.proving_key,
            r,
            s,
            &self.matrices,
            self.matrices.num_instance_variables,
            self.matrices.num_constraints,
            full_assignment,
        )
        .map_err(|e| PorError::CryptoFailure(format!("groth16 prove: {}", e)))
    }

    /// Local verification against the tier's verifying key.
    pub fn verify(&self, proof: &Proof<Bn254>, public_input: Fr) -> PorResult<bool> {
        verify_with_vk(&self.prepared_vk, proof, public_input)
    }

    pub fn verifying_key(&self) -> &VerifyingKey<Bn254> {
        &self.verifying_key
    }
}

/// Loads only `<session>.vk`; the verifier never needs the proving side.
pub fn load_verifying_key(session_name: &str) -> PorResult<PreparedVerifyingKey<Bn254>> {
    let vk = VerifyingKey::<Bn254>::deserialize_uncompressed(open_reader(&format!(
        "{}.vk",
        session_name
    ))?)
    .map_err(|e| PorError::CryptoFailure(format!("vk {} deserialize: {}", session_name, e)))?;
    prepare_vk(&vk)
}

pub fn prepare_vk(vk: &VerifyingKey<Bn254>) -> PorResult<PreparedVerifyingKey<Bn254>> {
    Groth16::<Bn254>::process_vk(vk)
        .map_err(|e| PorError::CryptoFailure(format!("vk preparation: {}", e)))
}

pub fn verify_with_vk(
    pvk: &PreparedVerifyingKey<Bn254>,
    proof: &Proof<Bn254>,
    public_input: Fr,
) -> PorResult<bool> {
    Groth16::<Bn254>::verify_with_processed_vk(pvk, &[public_input], proof)
        .map_err(|e| PorError::CryptoFailure(format!("groth16 verify: {}", e)))
}

/// Raw (uncompressed) proof bytes for storage.
pub fn proof_to_bytes(proof: &Proof<Bn254>) -> PorResult<Vec<u8>> {
    let mut out = Vec::new();
    proof
        .serialize_uncompressed(&mut out)
        .map_err(|e| PorError::CryptoFailure(format!("proof serialize: {}", e)))?;
    Ok(out)
}

pub fn proof_from_bytes(bytes: &[u8]) -> PorResult<Proof<Bn254>> {
    Proof::<Bn254>::deserialize_uncompressed(bytes)
        .map_err(|e| PorError::CryptoFailure(format!("proof deserialize: {}", e)))
}
