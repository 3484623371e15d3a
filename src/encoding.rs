//! Witness Blob Codec
//!
//! A batch witness travels as `bincode` → Snappy → base64 so the SQL row
//! stays text. The encoder stores each op's compact asset list (only the
//! account's own assets); the decoder re-expands every op to the full
//! 500-entry dense form, zero-filling missing indices, which is the shape
//! the circuit-witness derivation consumes.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::crypto::commitment::compute_cex_assets_commitment;
use crate::error::{safe_add, PorError, Result};
use crate::types::{AccountAsset, BatchCreateUserWitness, CexAssetInfo, ASSET_COUNTS};

/// bincode + snappy + base64 인코딩
pub fn encode_batch_witness(witness: &BatchCreateUserWitness) -> Result<String> {
    let raw = bincode::serialize(witness)
        .map_err(|e| PorError::CryptoFailure(format!("witness encode: {}", e)))?;
    let compressed = snap::raw::Encoder::new()
        .compress_vec(&raw)
        .map_err(|e| PorError::CryptoFailure(format!("witness compress: {}", e)))?;
    Ok(BASE64.encode(compressed))
}

/// 디코딩 + 자산 목록을 밀집 500개 형태로 재확장
pub fn decode_batch_witness(data: &str) -> Result<BatchCreateUserWitness> {
    let compressed = BASE64
        .decode(data)
        .map_err(|e| PorError::CryptoFailure(format!("witness base64: {}", e)))?;
    let raw = snap::raw::Decoder::new()
        .decompress_vec(&compressed)
        .map_err(|e| PorError::CryptoFailure(format!("witness decompress: {}", e)))?;
    let mut witness: BatchCreateUserWitness = bincode::deserialize(&raw)
        .map_err(|e| PorError::CryptoFailure(format!("witness decode: {}", e)))?;

    for op in witness.create_user_ops.iter_mut() {
        let mut dense: Vec<AccountAsset> = (0..ASSET_COUNTS)
            .map(|i| AccountAsset::empty_at(i as u16))
            .collect();
        for asset in &op.assets {
            dense[asset.index as usize] = *asset;
        }
        op.assets = dense;
    }
    Ok(witness)
}

/// 견증의 연산을 before 상태에 재생하여 after CEX 상태 복원.
/// 복원된 상태의 승인이 기록된 after 승인과 다르면 치명적.
pub fn recover_after_cex_assets(witness: &BatchCreateUserWitness) -> Result<Vec<CexAssetInfo>> {
    let mut cex_assets = witness.before_cex_assets.clone();
    for op in &witness.create_user_ops {
        for asset in &op.assets {
            let entry = &mut cex_assets[asset.index as usize];
            entry.total_equity = safe_add(entry.total_equity, asset.equity, "total equity")?;
            entry.total_debt = safe_add(entry.total_debt, asset.debt, "total debt")?;
            entry.loan_collateral = safe_add(entry.loan_collateral, asset.loan, "loan collateral")?;
            entry.margin_collateral =
                safe_add(entry.margin_collateral, asset.margin, "margin collateral")?;
            entry.portfolio_margin_collateral = safe_add(
                entry.portfolio_margin_collateral,
                asset.portfolio_margin,
                "portfolio margin collateral",
            )?;
        }
    }

    let commitment = compute_cex_assets_commitment(&cex_assets);
    if commitment != witness.after_cex_assets_commitment {
        return Err(PorError::CryptoFailure(
            "recovered cex state does not match the recorded after commitment".to_string(),
        ));
    }
    Ok(cex_assets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CreateUserOperation, ACCOUNT_TREE_DEPTH};

    fn sample_witness() -> BatchCreateUserWitness {
        let mut before_cex: Vec<CexAssetInfo> =
            (0..ASSET_COUNTS as u32).map(CexAssetInfo::reserved).collect();
        before_cex[0].symbol = "btc".into();
        before_cex[0].base_price = 100;

        let assets = vec![
            AccountAsset {
                index: 0,
                equity: 500,
                debt: 100,
                loan: 200,
                margin: 0,
                portfolio_margin: 0,
            },
            AccountAsset {
                index: 7,
                equity: 50,
                debt: 0,
                loan: 0,
                margin: 10,
                portfolio_margin: 0,
            },
        ];
        let op = CreateUserOperation {
            before_account_tree_root: [1u8; 32],
            after_account_tree_root: [2u8; 32],
            assets,
            account_index: 0,
            account_id_hash: [3u8; 32],
            account_proof: [[0u8; 32]; ACCOUNT_TREE_DEPTH],
        };

        let mut after_cex = before_cex.clone();
        after_cex[0].total_equity = 500;
        after_cex[0].total_debt = 100;
        after_cex[0].loan_collateral = 200;
        after_cex[7].total_equity = 50;
        after_cex[7].margin_collateral = 10;

        BatchCreateUserWitness {
            batch_commitment: [9u8; 32],
            before_account_tree_root: [1u8; 32],
            after_account_tree_root: [2u8; 32],
            before_cex_assets_commitment: compute_cex_assets_commitment(&before_cex),
            after_cex_assets_commitment: compute_cex_assets_commitment(&after_cex),
            before_cex_assets: before_cex,
            create_user_ops: vec![op],
        }
    }

    #[test]
    fn test_roundtrip_expands_assets() {
        let witness = sample_witness();
        let blob = encode_batch_witness(&witness).unwrap();
        let decoded = decode_batch_witness(&blob).unwrap();

        assert_eq!(decoded.batch_commitment, witness.batch_commitment);
        let assets = &decoded.create_user_ops[0].assets;
        assert_eq!(assets.len(), ASSET_COUNTS);
        assert_eq!(assets[0].equity, 500);
        assert_eq!(assets[7].margin, 10);
        assert!(assets[1].is_empty());
        // dense expansion keeps indices ascending and in place
        assert!(assets.iter().enumerate().all(|(i, a)| a.index as usize == i));
    }

    #[test]
    fn test_recover_after_cex_assets() {
        let witness = sample_witness();
        let recovered = recover_after_cex_assets(&witness).unwrap();
        assert_eq!(recovered[0].total_equity, 500);
        assert_eq!(recovered[0].loan_collateral, 200);
        assert_eq!(recovered[7].margin_collateral, 10);

        let mut tampered = witness.clone();
        tampered.after_cex_assets_commitment = [0u8; 32];
        assert!(matches!(
            recover_after_cex_assets(&tampered),
            Err(PorError::CryptoFailure(_))
        ));
    }

    #[test]
    fn test_corrupt_blob_rejected() {
        assert!(decode_batch_witness("!!!not-base64!!!").is_err());
        let valid = encode_batch_witness(&sample_witness()).unwrap();
        let truncated = &valid[..valid.len() / 2];
        assert!(decode_batch_witness(truncated).is_err());
    }
}
