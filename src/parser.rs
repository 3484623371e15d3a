//! CSV Ingest Module
//!
//! 사용자 보유 CSV 와 CEX 자산 구성 CSV 파싱
//!
//! # File layout
//!
//! User files: `rn, id`, then one six-column group per asset
//! (`equity, debt, symbol, loan, margin, portfolio_margin`), then a trailing
//! `total_net_balance` column. The global asset index order comes from the
//! header of the first user file (symbol column of each group). Data rows
//! skip the symbol column.
//!
//! CEX file (`cex_assets_info.csv`): `symbol, price, loan_ratios,
//! margin_ratios, portfolio_margin_ratios` with ratios encoded as
//! `"[l1-h1:r1, l2-h2:r2, …]"`, boundaries scaled by 10^16.
//!
//! # Validation
//!
//! Monetary strings go through a decimal → fixed-point integer conversion
//! before any arithmetic; no floats are used after parse. Invalid rows are
//! counted and skipped; the caller aborts at end of input when the count is
//! nonzero.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use num_bigint::BigUint;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::crypto::poseidon::{fr_from_bytes, fr_to_bytes32};
use crate::error::{safe_add, PorError, Result};
use crate::types::{
    amount_multiplier, price_multiplier, AccountAsset, AccountInfo, Bytes32, CexAssetInfo,
    TierRatio, ASSET_COUNTS, ASSET_COUNT_TIERS, MAX_TIER_BOUNDARY_VALUE,
};
use crate::valuation::{calculate_precomputed_values, collateral_value, pad_tier_ratios};

const CEX_ASSET_INFO_FILE: &str = "cex_assets_info.csv";
/// Tier boundary strings are scaled by 10^16 internally.
const TIER_BOUNDARY_MULTIPLIER: u128 = 10_000_000_000_000_000;

/// Decimal string → fixed-point u64 at the given multiplier, truncating any
/// residual fraction. Rejects negatives and anything that overflows u64.
pub fn convert_decimal_str_to_u64(raw: &str, multiplier: u64) -> Result<u64> {
    let trimmed = raw.trim();
    if trimmed == "0.0" || trimmed == "0" {
        return Ok(0);
    }
    let value = Decimal::from_str(trimmed)
        .map_err(|e| PorError::InvalidInput(format!("bad amount {:?}: {}", raw, e)))?;
    let scaled = value
        .checked_mul(Decimal::from(multiplier))
        .ok_or_else(|| PorError::InvalidInput(format!("amount {:?} overflows", raw)))?
        .trunc();
    scaled
        .to_u64()
        .ok_or_else(|| PorError::InvalidInput(format!("amount {:?} out of u64 range", raw)))
}

/// Decodes the 64-hex account id column into the canonical 32-byte form.
///
/// The id is interpreted as a BN254 field element: values at or above the
/// field prime silently reduce modulo the prime, and the stored form is the
/// big-endian bytes of the reduced element.
pub fn parse_account_id(raw: &str) -> Result<Bytes32> {
    let bytes = hex::decode(raw.trim())
        .map_err(|e| PorError::InvalidInput(format!("account id {:?} is not hex: {}", raw, e)))?;
    if bytes.len() != 32 {
        return Err(PorError::InvalidInput(format!(
            "account id {:?} is {} bytes, want 32",
            raw,
            bytes.len()
        )));
    }
    Ok(fr_to_bytes32(&fr_from_bytes(&bytes)))
}

/// Parses one `"[l1-h1:r1, …]"` tier table, computes cumulative values and
/// pads to 12 entries. Empty string / `[]` yields the all-sentinel table.
pub fn parse_tiers_ratio_from_str(encoded: &str) -> Result<[TierRatio; 12]> {
    let inner = encoded.trim().trim_start_matches('[').trim_end_matches(']');
    if inner.trim().is_empty() {
        return Ok(pad_tier_ratios(Vec::new()));
    }

    let mut tiers: Vec<TierRatio> = Vec::new();
    for part in inner.split(',') {
        let (range, ratio_str) = part
            .trim()
            .split_once(':')
            .ok_or_else(|| PorError::InvalidInput(format!("tier entry {:?} missing ':'", part)))?;
        let (low_str, high_str) = range
            .split_once('-')
            .ok_or_else(|| PorError::InvalidInput(format!("tier range {:?} missing '-'", range)))?;

        let low = convert_decimal_str_to_u64(low_str, 1)? as u128 * TIER_BOUNDARY_MULTIPLIER;
        let high = convert_decimal_str_to_u64(high_str, 1)? as u128 * TIER_BOUNDARY_MULTIPLIER;
        let ratio = convert_decimal_str_to_u64(ratio_str, 1)?;

        if high < low {
            return Err(PorError::InvalidInput(format!(
                "tier range {:?} is inverted",
                range
            )));
        }
        if high > MAX_TIER_BOUNDARY_VALUE {
            return Err(PorError::InvalidInput(format!(
                "tier boundary {:?} exceeds the 2^118 bound",
                high_str
            )));
        }
        if ratio > 100 {
            return Err(PorError::InvalidInput(format!(
                "tier ratio {:?} exceeds 100",
                ratio_str
            )));
        }
        if let Some(prev) = tiers.last() {
            if high <= prev.boundary_value {
                return Err(PorError::InvalidInput(
                    "tier boundaries not strictly ascending".to_string(),
                ));
            }
        }
        tiers.push(TierRatio {
            boundary_value: high,
            ratio: ratio as u8,
            precomputed_value: 0,
        });
    }
    calculate_precomputed_values(&mut tiers);
    Ok(pad_tier_ratios(tiers))
}

/// Reads the asset symbol order from the header of a user file
/// (third column of each six-column group, lowercased).
pub fn parse_asset_index_from_user_file(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| PorError::InvalidInput(format!("open {}: {}", path.display(), e)))?;
    let mut records = reader.records();
    let header = records
        .next()
        .ok_or_else(|| PorError::InvalidInput(format!("{} is empty", path.display())))?
        .map_err(|e| PorError::InvalidInput(format!("read {}: {}", path.display(), e)))?;

    // rn + id leading, total_net_balance trailing, 6 columns per asset
    let asset_counts = (header.len().saturating_sub(3)) / 6;
    let mut symbols = Vec::with_capacity(asset_counts);
    for i in 0..asset_counts {
        symbols.push(header[i * 6 + 4].trim().to_lowercase());
    }
    Ok(symbols)
}

/// Parses the CEX asset table and orders it by the user-file symbol order.
/// Entries past the parsed list are reserved fill up to 500.
pub fn parse_cex_asset_info_from_file(
    path: &Path,
    asset_indexes: &[String],
) -> Result<Vec<CexAssetInfo>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|e| PorError::InvalidInput(format!("open {}: {}", path.display(), e)))?;

    let mut by_symbol: HashMap<String, CexAssetInfo> = HashMap::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| PorError::InvalidInput(format!("read {}: {}", path.display(), e)))?;
        if record.len() != 5 {
            return Err(PorError::InvalidInput(format!(
                "cex asset row has {} columns, want 5",
                record.len()
            )));
        }
        let symbol = record[0].trim().to_lowercase();
        let asset = CexAssetInfo {
            base_price: convert_decimal_str_to_u64(&record[1], price_multiplier(&symbol))?,
            loan_ratios: parse_tiers_ratio_from_str(&record[2])?,
            margin_ratios: parse_tiers_ratio_from_str(&record[3])?,
            portfolio_margin_ratios: parse_tiers_ratio_from_str(&record[4])?,
            symbol: symbol.clone(),
            ..CexAssetInfo::reserved(0)
        };
        by_symbol.insert(symbol, asset);
    }

    if asset_indexes.len() != by_symbol.len() {
        return Err(PorError::ConfigInvariant(format!(
            "user files list {} assets but {} defines {}",
            asset_indexes.len(),
            CEX_ASSET_INFO_FILE,
            by_symbol.len()
        )));
    }

    let mut out = Vec::with_capacity(ASSET_COUNTS);
    for (i, symbol) in asset_indexes.iter().enumerate() {
        let mut asset = by_symbol.remove(symbol).ok_or_else(|| {
            PorError::ConfigInvariant(format!("asset {:?} missing from {}", symbol, CEX_ASSET_INFO_FILE))
        })?;
        asset.index = i as u32;
        out.push(asset);
    }
    for i in asset_indexes.len()..ASSET_COUNTS {
        out.push(CexAssetInfo::reserved(i as u32));
    }
    Ok(out)
}

/// Reads one user CSV. Accounts are grouped by the smallest asset-count tier
/// that fits them; `account_index` is file-local starting at 0 and only
/// advances for accepted accounts. Returns the group map and the number of
/// rejected rows.
pub fn read_user_data_from_csv(
    path: &Path,
    cex_assets: &[CexAssetInfo],
) -> Result<(HashMap<usize, Vec<AccountInfo>>, usize)> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| PorError::InvalidInput(format!("open {}: {}", path.display(), e)))?;

    let mut rows = reader.records();
    let header = match rows.next() {
        Some(h) => h.map_err(|e| PorError::InvalidInput(format!("read {}: {}", path.display(), e)))?,
        None => return Ok((HashMap::new(), 0)),
    };
    let asset_counts = (header.len().saturating_sub(3)) / 6;

    let mut accounts: HashMap<usize, Vec<AccountInfo>> = HashMap::new();
    let mut account_index: u32 = 0;
    let mut invalid_counts: usize = 0;

    'rows: for record in rows {
        let record =
            record.map_err(|e| PorError::InvalidInput(format!("read {}: {}", path.display(), e)))?;
        if record.len() != header.len() {
            tracing::warn!("row with {} columns, want {}", record.len(), header.len());
            invalid_counts += 1;
            continue;
        }
        let account_id = match parse_account_id(&record[1]) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("account {} rejected: {}", &record[1], e);
                invalid_counts += 1;
                continue;
            }
        };

        let mut assets: Vec<AccountAsset> = Vec::with_capacity(8);
        let mut total_equity = BigUint::default();
        let mut total_debt = BigUint::default();
        let mut total_collateral = BigUint::default();

        for j in 0..asset_counts {
            let symbol = &cex_assets[j].symbol;
            let multiplier = amount_multiplier(symbol);
            let parse = |col: usize| convert_decimal_str_to_u64(&record[j * 6 + col], multiplier);

            let parsed = (|| -> Result<(u64, u64, u64, u64, u64)> {
                Ok((parse(2)?, parse(3)?, parse(5)?, parse(6)?, parse(7)?))
            })();
            let (equity, debt, loan, margin, portfolio_margin) = match parsed {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("account {} asset {} rejected: {}", &record[1], symbol, e);
                    invalid_counts += 1;
                    continue 'rows;
                }
            };

            if equity == 0 && debt == 0 {
                continue;
            }
            let asset = AccountAsset {
                index: j as u16,
                equity,
                debt,
                loan,
                margin,
                portfolio_margin,
            };

            // per-asset collateral cannot exceed equity
            let asset_collateral = safe_add(loan, margin, "collateral")
                .and_then(|c| safe_add(c, portfolio_margin, "collateral"));
            match asset_collateral {
                Ok(c) if c <= equity => {}
                _ => {
                    tracing::warn!(
                        "account {} asset {} rejected: collateral exceeds equity",
                        &record[1],
                        symbol
                    );
                    invalid_counts += 1;
                    continue 'rows;
                }
            }

            let price = BigUint::from(cex_assets[j].base_price);
            total_equity += BigUint::from(equity) * &price;
            total_debt += BigUint::from(debt) * &price;
            total_collateral += collateral_value(loan, margin, portfolio_margin, &cex_assets[j]);
            assets.push(asset);
        }

        // the account must be individually solvent under the haircut rule
        if total_collateral < total_debt {
            tracing::warn!(
                "account {} rejected: debt {} exceeds collateral {}",
                &record[1],
                total_debt,
                total_collateral
            );
            invalid_counts += 1;
            continue;
        }

        let tier = ASSET_COUNT_TIERS
            .iter()
            .copied()
            .find(|&t| assets.len() <= t)
            .ok_or_else(|| {
                PorError::InvalidInput(format!("account holds {} assets, no tier fits", assets.len()))
            })?;
        accounts.entry(tier).or_default().push(AccountInfo {
            account_index,
            account_id,
            total_equity,
            total_debt,
            total_collateral,
            assets,
        });
        account_index += 1;
    }
    Ok((accounts, invalid_counts))
}

/// Parses the whole user data set directory: every `*.csv` except the CEX
/// table, in name order, with account indices offset so they are globally
/// unique and contiguous. Aborts with an aggregate summary when any file
/// contained invalid rows.
pub fn parse_user_dataset(
    dirname: &Path,
) -> Result<(HashMap<usize, Vec<AccountInfo>>, Vec<CexAssetInfo>)> {
    let mut user_files: Vec<PathBuf> = std::fs::read_dir(dirname)
        .map_err(|e| PorError::InvalidInput(format!("read dir {}: {}", dirname.display(), e)))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension().map(|e| e == "csv").unwrap_or(false)
                && p.file_name().map(|n| n != CEX_ASSET_INFO_FILE).unwrap_or(false)
        })
        .collect();
    user_files.sort();
    if user_files.is_empty() {
        return Err(PorError::InvalidInput(format!(
            "no user csv files under {}",
            dirname.display()
        )));
    }

    let asset_indexes = parse_asset_index_from_user_file(&user_files[0])?;
    let cex_assets =
        parse_cex_asset_info_from_file(&dirname.join(CEX_ASSET_INFO_FILE), &asset_indexes)?;

    let mut accounts: HashMap<usize, Vec<AccountInfo>> = HashMap::new();
    let mut total_invalid = 0usize;
    let mut next_account_index: u32 = 0;

    for file in &user_files {
        let (mut file_accounts, invalid) = read_user_data_from_csv(file, &cex_assets)?;
        total_invalid += invalid;
        let accepted: u32 = file_accounts.values().map(|v| v.len() as u32).sum();
        for group in file_accounts.values_mut() {
            for account in group.iter_mut() {
                account.account_index += next_account_index;
            }
        }
        next_account_index += accepted;
        for (tier, group) in file_accounts {
            accounts.entry(tier).or_default().extend(group);
        }
        tracing::info!(
            "parsed {}: {} accepted, {} rejected",
            file.display(),
            accepted,
            invalid
        );
    }

    if total_invalid > 0 {
        return Err(PorError::InvalidInput(format!(
            "{} invalid account rows across {} files",
            total_invalid,
            user_files.len()
        )));
    }
    Ok((accounts, cex_assets))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TIER_SCALE: u128 = TIER_BOUNDARY_MULTIPLIER;

    #[test]
    fn test_convert_decimal_str() {
        assert_eq!(convert_decimal_str_to_u64("0.0", 100_000_000).unwrap(), 0);
        assert_eq!(
            convert_decimal_str_to_u64("1.5", 100_000_000).unwrap(),
            150_000_000
        );
        assert_eq!(convert_decimal_str_to_u64("2.345", 100).unwrap(), 234);
        assert!(convert_decimal_str_to_u64("-1", 100).is_err());
        assert!(convert_decimal_str_to_u64("abc", 100).is_err());
    }

    #[test]
    fn test_parse_account_id() {
        let id = parse_account_id(&"ab".repeat(32)).unwrap();
        assert_eq!(id.len(), 32);
        assert!(parse_account_id("zz").is_err());
        assert!(parse_account_id("abcd").is_err());
        // ids at or above the field prime reduce silently
        let wrapped = parse_account_id(&"ff".repeat(32)).unwrap();
        assert_ne!(wrapped, [0xffu8; 32]);
    }

    #[test]
    fn test_parse_tiers() {
        let tiers = parse_tiers_ratio_from_str("[0-10:100, 10-25:90, 25-100:50]").unwrap();
        assert_eq!(tiers[0].boundary_value, 10 * TIER_SCALE);
        assert_eq!(tiers[0].ratio, 100);
        assert_eq!(tiers[0].precomputed_value, 10 * TIER_SCALE);
        assert_eq!(tiers[1].precomputed_value, 10 * TIER_SCALE + 15 * TIER_SCALE * 90 / 100);
        // padded tail
        assert_eq!(tiers[3].boundary_value, MAX_TIER_BOUNDARY_VALUE);
        assert_eq!(tiers[3].ratio, 0);
        assert_eq!(tiers[3].precomputed_value, tiers[2].precomputed_value);

        assert!(parse_tiers_ratio_from_str("[10-5:100]").is_err());
        assert!(parse_tiers_ratio_from_str("[0-10:100, 5-8:50]").is_err());
        assert!(parse_tiers_ratio_from_str("[0-10:200]").is_err());
        assert!(parse_tiers_ratio_from_str("[broken]").is_err());

        let empty = parse_tiers_ratio_from_str("[]").unwrap();
        assert_eq!(empty[0].boundary_value, MAX_TIER_BOUNDARY_VALUE);
    }

    fn write_fixture(dir: &Path) {
        let mut cex = std::fs::File::create(dir.join(CEX_ASSET_INFO_FILE)).unwrap();
        writeln!(cex, "symbol,price,loan_ratios,margin_ratios,portfolio_margin_ratios").unwrap();
        writeln!(cex, "btc,30000,[0-100:90],[0-100:80],[]").unwrap();
        writeln!(cex, "doge,0.1,[],[],[]").unwrap();

        let mut users = std::fs::File::create(dir.join("sample_users0.csv")).unwrap();
        writeln!(
            users,
            "rn,id,equity_btc,debt_btc,btc,btc_loan,btc_margin,btc_portfolio_margin,equity_doge,debt_doge,doge,doge_loan,doge_margin,doge_portfolio_margin,total_net_balance"
        )
        .unwrap();
        // valid: solvent, collateral within equity
        writeln!(users, "1,{},2.0,0.0,btc,1.0,0.5,0.0,100,0,doge,0,0,0,0", "11".repeat(32)).unwrap();
        // invalid: per-asset collateral exceeds equity
        writeln!(users, "2,{},1.0,0.0,btc,1.0,0.5,0.0,0,0,doge,0,0,0,0", "22".repeat(32)).unwrap();
        // invalid: bad amount string
        writeln!(users, "3,{},x,0.0,btc,0,0,0,0,0,doge,0,0,0,0", "33".repeat(32)).unwrap();
        // valid: doge only
        writeln!(users, "4,{},0.0,0.0,btc,0,0,0,5000,0,doge,0,0,0,0", "44".repeat(32)).unwrap();
    }

    #[test]
    fn test_read_user_data() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let indexes = parse_asset_index_from_user_file(&dir.path().join("sample_users0.csv")).unwrap();
        assert_eq!(indexes, vec!["btc".to_string(), "doge".to_string()]);

        let cex = parse_cex_asset_info_from_file(&dir.path().join(CEX_ASSET_INFO_FILE), &indexes)
            .unwrap();
        assert_eq!(cex.len(), ASSET_COUNTS);
        assert_eq!(cex[0].symbol, "btc");
        assert_eq!(cex[0].base_price, 30000 * 100_000_000);
        // doge is on the two-digit allow list: price scaled by 10^14
        assert_eq!(cex[1].base_price, 10_000_000_000_000);
        assert_eq!(cex[2].symbol, "reserved");
        let reserved = cex.iter().filter(|a| a.symbol != "reserved").count();
        assert_eq!(reserved, 2);

        let (accounts, invalid) =
            read_user_data_from_csv(&dir.path().join("sample_users0.csv"), &cex).unwrap();
        assert_eq!(invalid, 2);
        let tier50 = &accounts[&50];
        assert_eq!(tier50.len(), 2);
        // accepted accounts take contiguous indices
        assert_eq!(tier50[0].account_index, 0);
        assert_eq!(tier50[1].account_index, 1);
        // btc amounts scale at 10^8, doge at 10^2
        assert_eq!(tier50[0].assets[0].equity, 200_000_000);
        assert_eq!(tier50[1].assets[0].equity, 500_000);
        // dataset-level parse rejects the whole run on any invalid row
        assert!(matches!(
            parse_user_dataset(dir.path()),
            Err(PorError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_parse_user_dataset_clean() {
        let dir = tempfile::tempdir().unwrap();
        let mut cex = std::fs::File::create(dir.path().join(CEX_ASSET_INFO_FILE)).unwrap();
        writeln!(cex, "symbol,price,loan_ratios,margin_ratios,portfolio_margin_ratios").unwrap();
        writeln!(cex, "eth,2000,[0-1000:90],[],[]").unwrap();

        for (file, id) in [("u0.csv", "aa"), ("u1.csv", "bb")] {
            let mut f = std::fs::File::create(dir.path().join(file)).unwrap();
            writeln!(f, "rn,id,equity_eth,debt_eth,eth,eth_loan,eth_margin,eth_portfolio_margin,total_net_balance").unwrap();
            writeln!(f, "1,{},1.0,0.0,eth,0.5,0.0,0.0,0", id.repeat(32)).unwrap();
        }

        let (accounts, cex_assets) = parse_user_dataset(dir.path()).unwrap();
        assert_eq!(cex_assets[0].symbol, "eth");
        let tier50 = &accounts[&50];
        assert_eq!(tier50.len(), 2);
        // second file's account is offset past the first file's
        let mut indices: Vec<u32> = tier50.iter().map(|a| a.account_index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1]);
    }
}
