//! Canonical packing of user and exchange asset records into Poseidon
//! commitments.
//!
//! # Packing rules
//!
//! Three consecutive u64 fields are packed into one field element as
//! `a * 2^128 + b * 2^64 + c`, so a user's `6T` flattened asset fields cost
//! `2T` Poseidon absorptions. Tier ratios pack two tiers per element:
//! the low tier as `boundary * 2^8 + ratio`, the high tier as
//! `ratio * 2^126 + boundary * 2^134`, a 252-bit pair that fits one BN254
//! element.
//!
//! # Padding slots
//!
//! A user's asset list is expanded to the tier length `T` with padding slots:
//! all-zero amounts and synthetic indices that fill the gaps between real
//! indices, keeping the whole sequence strictly ascending. A sparse list and
//! its dense zero-filled expansion therefore commit to the same digest.

use ark_bn254::Fr;
use ark_ff::Field;
use num_bigint::BigUint;
use std::sync::OnceLock;

use super::poseidon::{fr_to_bytes32, poseidon_hash, PoseidonHasher};
use crate::types::{
    AccountAsset, Bytes32, CexAssetInfo, TierRatio, ASSET_COUNTS, ASSET_COUNT_TIERS, TIER_COUNT,
};

const ASSET_FIELDS: usize = 6;
const FIELDS_PER_ELEMENT: usize = 3;

fn pow2(exp: u64, cell: &'static OnceLock<Fr>) -> &'static Fr {
    cell.get_or_init(|| Fr::from(2u64).pow([exp]))
}

fn shift8() -> &'static Fr {
    static CELL: OnceLock<Fr> = OnceLock::new();
    pow2(8, &CELL)
}

fn shift64() -> &'static Fr {
    static CELL: OnceLock<Fr> = OnceLock::new();
    pow2(64, &CELL)
}

fn shift128() -> &'static Fr {
    static CELL: OnceLock<Fr> = OnceLock::new();
    pow2(128, &CELL)
}

fn shift126() -> &'static Fr {
    static CELL: OnceLock<Fr> = OnceLock::new();
    pow2(126, &CELL)
}

fn shift134() -> &'static Fr {
    static CELL: OnceLock<Fr> = OnceLock::new();
    pow2(134, &CELL)
}

/// `a * 2^128 + b * 2^64 + c` as one field element.
fn pack_u64_triple(a: u64, b: u64, c: u64) -> Fr {
    Fr::from(a) * shift128() + Fr::from(b) * shift64() + Fr::from(c)
}

/// Smallest asset-count tier that fits a list of `len` assets.
pub fn target_assets_count(len: usize) -> Option<usize> {
    ASSET_COUNT_TIERS.iter().copied().find(|&t| len <= t)
}

/// Smallest tier that fits the non-empty entries of `assets`. Used when the
/// input is a dense expansion (for example a decoded witness op) whose
/// trailing entries are zero records.
pub fn non_empty_assets_count(assets: &[AccountAsset]) -> Option<usize> {
    let count = assets.iter().filter(|a| !a.is_empty()).count();
    target_assets_count(count)
}

/// Expands `assets` (strictly ascending by index) to the tier length and
/// flattens to `6T` u64 fields `(index, equity, debt, loan, margin,
/// portfolio_margin)`. Padding slots carry synthetic indices that fill the
/// gaps between real indices and then continue past the last one.
pub fn padding_account_assets(assets: &[AccountAsset]) -> Vec<u64> {
    let target = target_assets_count(assets.len())
        .unwrap_or_else(|| panic!("no asset tier fits {} assets", assets.len()));
    let mut flat = vec![0u64; target * ASSET_FIELDS];

    let padding_counts = target - assets.len();
    let mut current_padding = 0usize;
    let mut next_index = 0u64;
    let mut slot = 0usize;

    for asset in assets {
        if current_padding < padding_counts {
            for gap in next_index..asset.index as u64 {
                flat[slot * ASSET_FIELDS] = gap;
                slot += 1;
                current_padding += 1;
                if current_padding >= padding_counts {
                    break;
                }
            }
        }
        let base = slot * ASSET_FIELDS;
        flat[base] = asset.index as u64;
        flat[base + 1] = asset.equity;
        flat[base + 2] = asset.debt;
        flat[base + 3] = asset.loan;
        flat[base + 4] = asset.margin;
        flat[base + 5] = asset.portfolio_margin;
        slot += 1;
        next_index = asset.index as u64 + 1;
    }
    // trailing padding continues the index sequence past the last real asset
    for s in slot..target {
        flat[s * ASSET_FIELDS] = next_index;
        next_index += 1;
    }
    flat
}

/// Poseidon commitment over a user's padded, packed asset list.
pub fn compute_user_assets_commitment(assets: &[AccountAsset]) -> Bytes32 {
    let flat = padding_account_assets(assets);
    let n_elements = (flat.len() + FIELDS_PER_ELEMENT - 1) / FIELDS_PER_ELEMENT;

    let mut hasher = PoseidonHasher::new();
    for i in 0..n_elements {
        let at = |k: usize| flat.get(i * FIELDS_PER_ELEMENT + k).copied().unwrap_or(0);
        hasher.absorb(&pack_u64_triple(at(0), at(1), at(2)));
    }
    fr_to_bytes32(&hasher.finalize())
}

/// Packs a 12-tier table into 6 field elements, two tiers each.
fn tier_ratio_fields(tiers: &[TierRatio; TIER_COUNT]) -> [Fr; TIER_COUNT / 2] {
    let mut out = [Fr::from(0u64); TIER_COUNT / 2];
    for (k, pair) in tiers.chunks(2).enumerate() {
        let low = Fr::from(pair[0].boundary_value) * shift8() + Fr::from(pair[0].ratio as u64);
        let high = Fr::from(pair[1].ratio as u64) * shift126()
            + Fr::from(pair[1].boundary_value) * shift134();
        out[k] = low + high;
    }
    out
}

/// All field elements of one CEX asset record, in absorption order: totals,
/// collateral totals, then the three tier tables.
fn cex_asset_fields(asset: &CexAssetInfo) -> Vec<Fr> {
    let mut fields = Vec::with_capacity(2 + 3 * TIER_COUNT / 2);
    fields.push(pack_u64_triple(
        asset.total_equity,
        asset.total_debt,
        asset.base_price,
    ));
    fields.push(pack_u64_triple(
        asset.loan_collateral,
        asset.margin_collateral,
        asset.portfolio_margin_collateral,
    ));
    fields.extend(tier_ratio_fields(&asset.loan_ratios));
    fields.extend(tier_ratio_fields(&asset.margin_ratios));
    fields.extend(tier_ratio_fields(&asset.portfolio_margin_ratios));
    fields
}

/// Poseidon commitment over the full 500-asset exchange state. Entries past
/// `cex_assets.len()` are reserved fill with zero price and padded tiers.
pub fn compute_cex_assets_commitment(cex_assets: &[CexAssetInfo]) -> Bytes32 {
    assert!(cex_assets.len() <= ASSET_COUNTS);
    let mut hasher = PoseidonHasher::new();
    for asset in cex_assets {
        for field in cex_asset_fields(asset) {
            hasher.absorb(&field);
        }
    }
    for index in cex_assets.len()..ASSET_COUNTS {
        for field in cex_asset_fields(&CexAssetInfo::reserved(index as u32)) {
            hasher.absorb(&field);
        }
    }
    fr_to_bytes32(&hasher.finalize())
}

/// Account leaf hash:
/// `Poseidon(account_id, total_equity, total_debt, total_collateral, assets_commitment)`.
pub fn account_leaf_hash(
    account_id: &Bytes32,
    total_equity: &BigUint,
    total_debt: &BigUint,
    total_collateral: &BigUint,
    assets_commitment: &Bytes32,
) -> Bytes32 {
    let inputs = [
        super::poseidon::fr_from_bytes(account_id),
        Fr::from(total_equity.clone()),
        Fr::from(total_debt.clone()),
        Fr::from(total_collateral.clone()),
        super::poseidon::fr_from_bytes(assets_commitment),
    ];
    fr_to_bytes32(&poseidon_hash(&inputs))
}

/// The SNARK public input binding the four commitments that flank one batch.
pub fn batch_commitment(
    before_account_tree_root: &Bytes32,
    after_account_tree_root: &Bytes32,
    before_cex_assets_commitment: &Bytes32,
    after_cex_assets_commitment: &Bytes32,
) -> Bytes32 {
    let inputs = [
        super::poseidon::fr_from_bytes(before_account_tree_root),
        super::poseidon::fr_from_bytes(after_account_tree_root),
        super::poseidon::fr_from_bytes(before_cex_assets_commitment),
        super::poseidon::fr_from_bytes(after_cex_assets_commitment),
    ];
    fr_to_bytes32(&poseidon_hash(&inputs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sparse_assets(index_of: impl Fn(usize) -> u16) -> Vec<AccountAsset> {
        (0..10)
            .map(|i| AccountAsset {
                index: index_of(i),
                equity: (i * 10 + 1000) as u64,
                debt: (i * 10 + 500) as u64,
                loan: (i * 10 + 100) as u64,
                margin: (i * 10 + 100) as u64,
                portfolio_margin: (i * 10 + 100) as u64,
            })
            .collect()
    }

    fn dense_expansion(sparse: &[AccountAsset], len: usize) -> Vec<AccountAsset> {
        let mut dense: Vec<AccountAsset> =
            (0..len).map(|i| AccountAsset::empty_at(i as u16)).collect();
        for a in sparse {
            dense[a.index as usize] = *a;
        }
        dense
    }

    #[test]
    fn test_padding_fills_gaps_strictly_ascending() {
        let flat = padding_account_assets(&sparse_assets(|i| (3 * i) as u16));
        assert_eq!(flat.len(), 50 * ASSET_FIELDS);
        let indices: Vec<u64> = (0..50).map(|s| flat[s * ASSET_FIELDS]).collect();
        for w in indices.windows(2) {
            assert!(w[0] < w[1], "indices not strictly ascending: {:?}", w);
        }
        // every index below the tier bound appears exactly once
        let mut seen = indices.clone();
        seen.sort_unstable();
        assert_eq!(seen, (0u64..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_sparse_matches_dense_commitment() {
        // ten assets at indices 3i; the dense zero-filled tier-length list
        // must commit to the same digest
        let sparse = sparse_assets(|i| (3 * i) as u16);
        let dense = dense_expansion(&sparse, 50);
        assert_eq!(
            compute_user_assets_commitment(&sparse),
            compute_user_assets_commitment(&dense)
        );
    }

    #[test]
    fn test_sparse_matches_dense_commitment_offset() {
        // same layout shifted to indices 3i+2
        let sparse = sparse_assets(|i| (3 * i + 2) as u16);
        let dense = dense_expansion(&sparse, 50);
        assert_eq!(
            compute_user_assets_commitment(&sparse),
            compute_user_assets_commitment(&dense)
        );
    }

    #[test]
    fn test_commitment_sensitive_to_amounts() {
        let sparse = sparse_assets(|i| (3 * i) as u16);
        let mut tweaked = sparse.clone();
        tweaked[4].equity += 1;
        assert_ne!(
            compute_user_assets_commitment(&sparse),
            compute_user_assets_commitment(&tweaked)
        );
    }

    #[test]
    fn test_target_assets_count() {
        assert_eq!(target_assets_count(0), Some(50));
        assert_eq!(target_assets_count(50), Some(50));
        assert_eq!(target_assets_count(51), Some(500));
        assert_eq!(target_assets_count(500), Some(500));
        assert_eq!(target_assets_count(501), None);
    }

    #[test]
    fn test_cex_commitment_padding_is_canonical() {
        // an explicit reserved tail commits identically to the implicit fill
        let mut asset = CexAssetInfo::reserved(0);
        asset.symbol = "btc".into();
        asset.base_price = 30000 * 100_000_000;
        let explicit: Vec<CexAssetInfo> = std::iter::once(asset.clone())
            .chain((1..ASSET_COUNTS as u32).map(CexAssetInfo::reserved))
            .collect();
        assert_eq!(
            compute_cex_assets_commitment(&[asset]),
            compute_cex_assets_commitment(&explicit)
        );
    }

    #[test]
    fn test_account_leaf_hash_binds_all_inputs() {
        let commitment = compute_user_assets_commitment(&sparse_assets(|i| i as u16));
        let base = account_leaf_hash(
            &[1u8; 32],
            &BigUint::from(10u8),
            &BigUint::from(5u8),
            &BigUint::from(7u8),
            &commitment,
        );
        let other = account_leaf_hash(
            &[1u8; 32],
            &BigUint::from(10u8),
            &BigUint::from(5u8),
            &BigUint::from(8u8),
            &commitment,
        );
        assert_ne!(base, other);
    }
}
