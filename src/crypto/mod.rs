//! Cryptography Module
//!
//! Poseidon hashing over the BN254 scalar field and the canonical packing of
//! user and exchange asset records into field-element commitments.
//!
//! # Layout
//! - `poseidon`: sponge parameters and hash helpers
//! - `commitment`: user/CEX asset packing, account leaf hash, batch commitment

pub mod commitment;
pub mod poseidon;

pub use commitment::{
    account_leaf_hash, batch_commitment, compute_cex_assets_commitment,
    compute_user_assets_commitment, padding_account_assets, target_assets_count,
};
pub use poseidon::{fr_from_bytes, fr_to_bytes32, poseidon_hash};
