//! Circuit Witness Derivation
//!
//! The arithmetic circuit is an external artifact; this module produces the
//! witness it expects from a decoded [`BatchCreateUserWitness`]. Per user op
//! that means:
//!
//! - a dense 500-entry amount table (`assets_for_update_cex`) the circuit
//!   uses to roll the exchange totals forward, and
//! - a tier-length position list: for every real asset the 1-based tier
//!   index of each collateral leg plus an overflow flag, with padding slots
//!   (zero amounts, gap-filling indices) keeping the index sequence strictly
//!   ascending, the same expansion the commitment layer performs.
//!
//! The circuit checks each selected tier with two range comparisons against
//! a lookup table whose row 0 is a zero sentinel; index 0 therefore encodes
//! "no collateral in this leg".

use ark_bn254::Fr;
use ark_ff::{One, Zero};

use crate::crypto::commitment::non_empty_assets_count;
use crate::crypto::poseidon::fr_from_bytes;
use crate::error::{PorError, Result};
use crate::types::{BatchCreateUserWitness, CexAssetInfo, TierRatio, ACCOUNT_TREE_DEPTH};
use crate::valuation::tier_position;

/// Tier selection of one user asset, one entry per collateral leg.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserAssetPosition {
    pub asset_index: u64,
    pub loan_index: u64,
    pub loan_flag: bool,
    pub margin_index: u64,
    pub margin_flag: bool,
    pub portfolio_margin_index: u64,
    pub portfolio_margin_flag: bool,
}

/// Raw amounts of one asset slot in the dense 500-entry table.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserAssetMeta {
    pub equity: u64,
    pub debt: u64,
    pub loan: u64,
    pub margin: u64,
    pub portfolio_margin: u64,
}

#[derive(Debug, Clone)]
pub struct CreateUserOpWitness {
    pub before_account_tree_root: Fr,
    pub after_account_tree_root: Fr,
    /// Tier-length position list, strictly ascending by `asset_index`.
    pub assets: Vec<UserAssetPosition>,
    /// Dense 500-entry amount table.
    pub assets_for_update_cex: Vec<UserAssetMeta>,
    pub account_index: u64,
    pub account_id_hash: Fr,
    pub account_proof: [Fr; ACCOUNT_TREE_DEPTH],
}

/// The full private witness plus the single public input.
#[derive(Debug, Clone)]
pub struct BatchCreateUserCircuitWitness {
    pub batch_commitment: Fr,
    pub before_account_tree_root: Fr,
    pub after_account_tree_root: Fr,
    pub before_cex_assets_commitment: Fr,
    pub after_cex_assets_commitment: Fr,
    pub before_cex_assets: Vec<CexAssetInfo>,
    pub create_user_ops: Vec<CreateUserOpWitness>,
}

fn collateral_positions(amount: u64, price: u64, tiers: &[TierRatio]) -> (u64, bool) {
    tier_position(amount as u128 * price as u128, tiers)
}

impl BatchCreateUserCircuitWitness {
    /// Derives the circuit witness from a decoded batch witness (ops must be
    /// in the dense 500-entry form the decoder produces).
    pub fn from_batch_witness(witness: &BatchCreateUserWitness) -> Result<Self> {
        let first_op = witness
            .create_user_ops
            .first()
            .ok_or_else(|| PorError::ConfigInvariant("batch witness has no ops".to_string()))?;
        // every op in a batch shares the tier; later ops may be padding
        // accounts, so the first op decides
        let target = non_empty_assets_count(&first_op.assets).ok_or_else(|| {
            PorError::ConfigInvariant("first op exceeds the largest asset tier".to_string())
        })?;

        let mut ops = Vec::with_capacity(witness.create_user_ops.len());
        for op in &witness.create_user_ops {
            let assets_for_update_cex: Vec<UserAssetMeta> = op
                .assets
                .iter()
                .map(|a| UserAssetMeta {
                    equity: a.equity,
                    debt: a.debt,
                    loan: a.loan,
                    margin: a.margin,
                    portfolio_margin: a.portfolio_margin,
                })
                .collect();

            let existing: Vec<usize> = op
                .assets
                .iter()
                .filter(|a| !a.is_empty())
                .map(|a| a.index as usize)
                .collect();
            if existing.len() > target {
                return Err(PorError::ConfigInvariant(format!(
                    "op holds {} assets but batch tier is {}",
                    existing.len(),
                    target
                )));
            }

            // expand to tier length with gap-filling padding slots, mirroring
            // the commitment layer's expansion
            let padding_counts = target - existing.len();
            let mut positions = Vec::with_capacity(target);
            let mut current_padding = 0usize;
            let mut next_index = 0u64;
            for &real in &existing {
                if current_padding < padding_counts {
                    for gap in next_index..real as u64 {
                        positions.push(UserAssetPosition {
                            asset_index: gap,
                            ..Default::default()
                        });
                        current_padding += 1;
                        if current_padding >= padding_counts {
                            break;
                        }
                    }
                }
                let asset = &op.assets[real];
                let cex = &witness.before_cex_assets[real];
                let (loan_index, loan_flag) =
                    collateral_positions(asset.loan, cex.base_price, &cex.loan_ratios);
                let (margin_index, margin_flag) =
                    collateral_positions(asset.margin, cex.base_price, &cex.margin_ratios);
                let (portfolio_margin_index, portfolio_margin_flag) = collateral_positions(
                    asset.portfolio_margin,
                    cex.base_price,
                    &cex.portfolio_margin_ratios,
                );
                positions.push(UserAssetPosition {
                    asset_index: real as u64,
                    loan_index,
                    loan_flag,
                    margin_index,
                    margin_flag,
                    portfolio_margin_index,
                    portfolio_margin_flag,
                });
                next_index = real as u64 + 1;
            }
            while positions.len() < target {
                positions.push(UserAssetPosition {
                    asset_index: next_index,
                    ..Default::default()
                });
                next_index += 1;
            }

            let mut proof = [Fr::zero(); ACCOUNT_TREE_DEPTH];
            for (i, sibling) in op.account_proof.iter().enumerate() {
                proof[i] = fr_from_bytes(sibling);
            }
            ops.push(CreateUserOpWitness {
                before_account_tree_root: fr_from_bytes(&op.before_account_tree_root),
                after_account_tree_root: fr_from_bytes(&op.after_account_tree_root),
                assets: positions,
                assets_for_update_cex,
                account_index: op.account_index as u64,
                account_id_hash: fr_from_bytes(&op.account_id_hash),
                account_proof: proof,
            });
        }

        Ok(BatchCreateUserCircuitWitness {
            batch_commitment: fr_from_bytes(&witness.batch_commitment),
            before_account_tree_root: fr_from_bytes(&witness.before_account_tree_root),
            after_account_tree_root: fr_from_bytes(&witness.after_account_tree_root),
            before_cex_assets_commitment: fr_from_bytes(&witness.before_cex_assets_commitment),
            after_cex_assets_commitment: fr_from_bytes(&witness.after_cex_assets_commitment),
            before_cex_assets: witness.before_cex_assets.clone(),
            create_user_ops: ops,
        })
    }

    /// The per-user asset tier this batch was built for (parameter set key).
    pub fn assets_count(&self) -> usize {
        self.create_user_ops
            .first()
            .map(|op| op.assets.len())
            .unwrap_or(0)
    }

    /// Flattens into the prover's full assignment `[1, public, private…]`.
    ///
    /// The private ordering is the artifact contract shared with the offline
    /// key generation: global roots/commitments, then each CEX asset record
    /// (totals, collateral totals, three 12-tier tables), then each op
    /// (roots, positions, dense amounts, index, id hash, proof path).
    pub fn full_assignment(&self) -> Vec<Fr> {
        let mut out = Vec::new();
        out.push(Fr::one());
        out.push(self.batch_commitment);

        out.push(self.before_account_tree_root);
        out.push(self.after_account_tree_root);
        out.push(self.before_cex_assets_commitment);
        out.push(self.after_cex_assets_commitment);

        for asset in &self.before_cex_assets {
            out.push(Fr::from(asset.total_equity));
            out.push(Fr::from(asset.total_debt));
            out.push(Fr::from(asset.base_price));
            out.push(Fr::from(asset.loan_collateral));
            out.push(Fr::from(asset.margin_collateral));
            out.push(Fr::from(asset.portfolio_margin_collateral));
            for table in [
                &asset.loan_ratios,
                &asset.margin_ratios,
                &asset.portfolio_margin_ratios,
            ] {
                for tier in table.iter() {
                    out.push(Fr::from(tier.boundary_value));
                    out.push(Fr::from(tier.ratio as u64));
                    out.push(Fr::from(tier.precomputed_value));
                }
            }
        }

        for op in &self.create_user_ops {
            out.push(op.before_account_tree_root);
            out.push(op.after_account_tree_root);
            for position in &op.assets {
                out.push(Fr::from(position.asset_index));
                out.push(Fr::from(position.loan_index));
                out.push(Fr::from(position.loan_flag as u64));
                out.push(Fr::from(position.margin_index));
                out.push(Fr::from(position.margin_flag as u64));
                out.push(Fr::from(position.portfolio_margin_index));
                out.push(Fr::from(position.portfolio_margin_flag as u64));
            }
            for meta in &op.assets_for_update_cex {
                out.push(Fr::from(meta.equity));
                out.push(Fr::from(meta.debt));
                out.push(Fr::from(meta.loan));
                out.push(Fr::from(meta.margin));
                out.push(Fr::from(meta.portfolio_margin));
            }
            out.push(Fr::from(op.account_index));
            out.push(op.account_id_hash);
            out.extend_from_slice(&op.account_proof);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountAsset, CreateUserOperation, ASSET_COUNTS, TIER_COUNT};
    use crate::valuation::{calculate_precomputed_values, pad_tier_ratios};

    fn dense_assets(entries: &[(usize, AccountAsset)]) -> Vec<AccountAsset> {
        let mut assets: Vec<AccountAsset> = (0..ASSET_COUNTS)
            .map(|i| AccountAsset::empty_at(i as u16))
            .collect();
        for (index, mut asset) in entries.iter().copied() {
            asset.index = index as u16;
            assets[index] = asset;
        }
        assets
    }

    fn sample_batch() -> BatchCreateUserWitness {
        let mut cex: Vec<CexAssetInfo> =
            (0..ASSET_COUNTS as u32).map(CexAssetInfo::reserved).collect();
        cex[2].base_price = 10;
        let mut tiers = vec![
            TierRatio {
                boundary_value: 1000,
                ratio: 100,
                precomputed_value: 0,
            },
            TierRatio {
                boundary_value: 5000,
                ratio: 50,
                precomputed_value: 0,
            },
        ];
        calculate_precomputed_values(&mut tiers);
        cex[2].loan_ratios = pad_tier_ratios(tiers);

        let op = CreateUserOperation {
            before_account_tree_root: [1u8; 32],
            after_account_tree_root: [2u8; 32],
            assets: dense_assets(&[(
                2,
                AccountAsset {
                    index: 2,
                    equity: 500,
                    debt: 0,
                    loan: 300,
                    margin: 0,
                    portfolio_margin: 0,
                },
            )]),
            account_index: 0,
            account_id_hash: [3u8; 32],
            account_proof: [[0u8; 32]; ACCOUNT_TREE_DEPTH],
        };
        BatchCreateUserWitness {
            batch_commitment: [9u8; 32],
            before_account_tree_root: [1u8; 32],
            after_account_tree_root: [2u8; 32],
            before_cex_assets_commitment: [4u8; 32],
            after_cex_assets_commitment: [5u8; 32],
            before_cex_assets: cex,
            create_user_ops: vec![op],
        }
    }

    #[test]
    fn test_derivation_pads_to_tier_length() {
        let witness = BatchCreateUserCircuitWitness::from_batch_witness(&sample_batch()).unwrap();
        assert_eq!(witness.assets_count(), 50);
        let op = &witness.create_user_ops[0];
        assert_eq!(op.assets_for_update_cex.len(), ASSET_COUNTS);

        // strictly ascending indices with the real asset in place
        let indices: Vec<u64> = op.assets.iter().map(|p| p.asset_index).collect();
        for w in indices.windows(2) {
            assert!(w[0] < w[1]);
        }
        assert_eq!(indices, (0u64..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_tier_index_and_flag() {
        let witness = BatchCreateUserCircuitWitness::from_batch_witness(&sample_batch()).unwrap();
        let op = &witness.create_user_ops[0];
        // loan value = 300 * 10 = 3000 → second tier, 1-based index 2
        let real = &op.assets[2];
        assert_eq!(real.asset_index, 2);
        assert_eq!(real.loan_index, 2);
        assert!(!real.loan_flag);
        // untouched legs sit on the zero sentinel
        assert_eq!(real.margin_index, 0);
        assert_eq!(real.portfolio_margin_index, 0);
        // padding slots are all-sentinel
        assert_eq!(op.assets[0].loan_index, 0);
        assert!(!op.assets[0].loan_flag);
    }

    #[test]
    fn test_full_assignment_shape() {
        let witness = BatchCreateUserCircuitWitness::from_batch_witness(&sample_batch()).unwrap();
        let assignment = witness.full_assignment();
        let per_cex_asset = 6 + 3 * TIER_COUNT * 3;
        let per_op = 2 + 50 * 7 + ASSET_COUNTS * 5 + 2 + ACCOUNT_TREE_DEPTH;
        let expected = 2 + 4 + ASSET_COUNTS * per_cex_asset + per_op;
        assert_eq!(assignment.len(), expected);
        assert_eq!(assignment[0], Fr::one());
        assert_eq!(assignment[1], fr_from_bytes(&[9u8; 32]));
    }
}
