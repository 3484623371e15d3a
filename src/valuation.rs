//! Tiered Collateral Valuation
//!
//! Piecewise-linear haircut applied to each collateral leg. A collateral
//! position of value `v = amount * base_price` falls into the unique tier
//! `i` with `boundary[i-1] < v <= boundary[i]`; its post-haircut value is
//! the cumulative value of all lower tiers plus the marginal slice of tier
//! `i` at that tier's ratio.
//!
//! Cumulative values are precomputed when the tier table is parsed so that
//! evaluation is one lookup and one multiply; the circuit consumes the same
//! table through a lookup argument and only needs the selected tier index
//! plus an overflow flag per leg.
//!
//! All arithmetic is u128: amounts and prices are u64 fixed-point, so
//! `amount * price < 2^128`, and every boundary is capped at 2^118.

use crate::types::{
    CexAssetInfo, TierRatio, MAX_TIER_BOUNDARY_VALUE, PERCENTAGE_MULTIPLIER, TIER_COUNT,
};
use num_bigint::BigUint;

/// Fills `precomputed_value` over a parsed (unpadded) tier list:
/// `precomputed[i] = precomputed[i-1] + (boundary[i] - boundary[i-1]) * ratio[i] / 100`.
pub fn calculate_precomputed_values(tiers: &mut [TierRatio]) {
    let mut acc: u128 = 0;
    let mut prev_boundary: u128 = 0;
    for tier in tiers.iter_mut() {
        let diff = tier.boundary_value - prev_boundary;
        acc += diff * tier.ratio as u128 / PERCENTAGE_MULTIPLIER;
        tier.precomputed_value = acc;
        prev_boundary = tier.boundary_value;
    }
}

/// Right-pads a tier list to exactly [`TIER_COUNT`] entries with the sentinel
/// `{MAX_TIER_BOUNDARY_VALUE, 0, last_precomputed}`, so the padded tail never
/// changes the evaluated value.
pub fn pad_tier_ratios(tiers: Vec<TierRatio>) -> [TierRatio; TIER_COUNT] {
    assert!(
        tiers.len() <= TIER_COUNT,
        "tier list longer than {} entries",
        TIER_COUNT
    );
    let last_precomputed = tiers.last().map(|t| t.precomputed_value).unwrap_or(0);
    let sentinel = TierRatio {
        boundary_value: MAX_TIER_BOUNDARY_VALUE,
        ratio: 0,
        precomputed_value: last_precomputed,
    };
    let mut out = [sentinel; TIER_COUNT];
    out[..tiers.len()].copy_from_slice(&tiers);
    out
}

/// Evaluates the piecewise haircut at `value`. Beyond the final boundary the
/// curve is flat at the last cumulative value.
pub fn asset_value_via_tiers(value: u128, tiers: &[TierRatio]) -> u128 {
    if tiers.is_empty() {
        return 0;
    }
    for (i, tier) in tiers.iter().enumerate() {
        if value <= tier.boundary_value {
            let (base, floor) = if i == 0 {
                (0, 0)
            } else {
                (tiers[i - 1].precomputed_value, tiers[i - 1].boundary_value)
            };
            return base + (value - floor) * tier.ratio as u128 / PERCENTAGE_MULTIPLIER;
        }
    }
    tiers[tiers.len() - 1].precomputed_value
}

/// Post-haircut value of one account asset's three collateral legs, priced at
/// the asset's base price.
pub fn collateral_value(
    loan: u64,
    margin: u64,
    portfolio_margin: u64,
    cex_asset: &CexAssetInfo,
) -> BigUint {
    let price = cex_asset.base_price as u128;
    let loan_value = asset_value_via_tiers(loan as u128 * price, &cex_asset.loan_ratios);
    let margin_value = asset_value_via_tiers(margin as u128 * price, &cex_asset.margin_ratios);
    let pm_value = asset_value_via_tiers(
        portfolio_margin as u128 * price,
        &cex_asset.portfolio_margin_ratios,
    );
    BigUint::from(loan_value) + BigUint::from(margin_value) + BigUint::from(pm_value)
}

/// Tier selection for the circuit witness: the 1-based index of the tier
/// containing `value` plus a flag marking overflow past the final boundary.
/// Index 0 is the zero sentinel (value == 0), matching the zero row at the
/// head of the circuit's per-asset lookup table.
pub fn tier_position(value: u128, tiers: &[TierRatio]) -> (u64, bool) {
    if value == 0 {
        return (0, false);
    }
    for (i, tier) in tiers.iter().enumerate() {
        if value <= tier.boundary_value {
            return (i as u64 + 1, false);
        }
    }
    (tiers.len() as u64, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(boundary: u128, ratio: u8) -> TierRatio {
        TierRatio {
            boundary_value: boundary,
            ratio,
            precomputed_value: 0,
        }
    }

    fn sample_tiers() -> Vec<TierRatio> {
        // 0..1000 at 100%, 1000..3000 at 50%, 3000..6000 at 10%
        let mut tiers = vec![tier(1000, 100), tier(3000, 50), tier(6000, 10)];
        calculate_precomputed_values(&mut tiers);
        tiers
    }

    #[test]
    fn test_precomputed_values() {
        let tiers = sample_tiers();
        assert_eq!(tiers[0].precomputed_value, 1000);
        assert_eq!(tiers[1].precomputed_value, 1000 + 2000 / 2);
        assert_eq!(tiers[2].precomputed_value, 2000 + 3000 / 10);
    }

    #[test]
    fn test_haircut_piecewise() {
        let tiers = sample_tiers();
        assert_eq!(asset_value_via_tiers(0, &tiers), 0);
        assert_eq!(asset_value_via_tiers(500, &tiers), 500);
        // boundary belongs to the lower tier
        assert_eq!(asset_value_via_tiers(1000, &tiers), 1000);
        assert_eq!(asset_value_via_tiers(1001, &tiers), 1000);
        assert_eq!(asset_value_via_tiers(2000, &tiers), 1500);
        assert_eq!(asset_value_via_tiers(4000, &tiers), 2100);
        // flat beyond the last real boundary
        assert_eq!(asset_value_via_tiers(1 << 90, &tiers), 2300);
    }

    #[test]
    fn test_padding_preserves_value() {
        let tiers = sample_tiers();
        let padded = pad_tier_ratios(tiers.clone());
        assert_eq!(padded.len(), TIER_COUNT);
        assert_eq!(padded[3].boundary_value, MAX_TIER_BOUNDARY_VALUE);
        assert_eq!(padded[3].ratio, 0);
        for v in [0u128, 999, 1000, 2500, 6000, 1 << 100] {
            assert_eq!(
                asset_value_via_tiers(v, &tiers),
                asset_value_via_tiers(v, &padded)
            );
        }
    }

    #[test]
    fn test_empty_tier_list() {
        assert_eq!(asset_value_via_tiers(12345, &[]), 0);
        let padded = pad_tier_ratios(Vec::new());
        assert_eq!(asset_value_via_tiers(12345, &padded), 0);
    }

    #[test]
    fn test_tier_position() {
        let padded = pad_tier_ratios(sample_tiers());
        assert_eq!(tier_position(0, &padded), (0, false));
        assert_eq!(tier_position(1, &padded), (1, false));
        assert_eq!(tier_position(1000, &padded), (1, false));
        assert_eq!(tier_position(1001, &padded), (2, false));
        assert_eq!(tier_position(5999, &padded), (3, false));
        // padded sentinels absorb everything up to 2^118
        assert_eq!(tier_position(1 << 100, &padded), (4, false));
        assert_eq!(
            tier_position(MAX_TIER_BOUNDARY_VALUE + 1, &padded),
            (TIER_COUNT as u64, true)
        );
    }

    #[test]
    fn test_collateral_value_sums_three_legs() {
        let mut asset = CexAssetInfo::reserved(0);
        asset.base_price = 1;
        asset.loan_ratios = pad_tier_ratios(sample_tiers());
        asset.margin_ratios = pad_tier_ratios(sample_tiers());
        asset.portfolio_margin_ratios = pad_tier_ratios(Vec::new());
        let v = collateral_value(500, 2000, 7777, &asset);
        // 500 (100%) + 1500 (tier 2) + 0 (no portfolio margin tiers)
        assert_eq!(v, BigUint::from(2000u32));
    }
}
