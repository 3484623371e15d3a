//! Domain Types Module
//!
//! 파이프라인 전반에서 사용되는 도메인 타입 정의
//!
//! The canonical data model of the pipeline: tiered collateral ratios,
//! exchange-wide asset records, user accounts and the batch witness that
//! carries one batch of create-user operations between the witness builder,
//! the prover coordinator and the verifier.
//!
//! # Serialization
//!
//! PascalCase field names are the published JSON schema (config files, user
//! proof bundles). The same derives drive the bincode witness-blob encoding,
//! which is name-independent.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

/// 계정 Merkle 트리 깊이 (2^28 계정 지원)
pub const ACCOUNT_TREE_DEPTH: usize = 28;
/// 지원하는 최대 자산 수
pub const ASSET_COUNTS: usize = 500;
/// 담보 비율 계층 수 (짝수여야 함: 두 계층이 하나의 필드 원소에 패킹됨)
pub const TIER_COUNT: usize = 12;

/// Upper bound for any tier boundary value (2^118).
pub const MAX_TIER_BOUNDARY_VALUE: u128 = 1 << 118;
/// 백분율 나눗셈 상수
pub const PERCENTAGE_MULTIPLIER: u128 = 100;

/// User-asset-count tiers, ascending. A user is assigned to the smallest
/// tier that fits its asset list; the tier also selects the SNARK parameter
/// set.
pub const ASSET_COUNT_TIERS: [usize; 2] = [50, 500];

/// 티어별 배치당 사용자 생성 연산 수
///
/// Tuned so both tiers produce circuits of comparable constraint count:
/// 500-asset users run 92 ops per batch, 50-asset users run 700.
pub fn ops_per_batch(asset_tier: usize) -> Option<usize> {
    match asset_tier {
        500 => Some(92),
        50 => Some(700),
        _ => None,
    }
}

/// Symbols priced and held in 10^2 fixed-point instead of the default 10^8.
/// Their price multiplier is 10^14 so that amount*price keeps the product
/// precision invariant.
const TWO_DIGIT_SYMBOLS: &[&str] = &[
    "bttc", "shib", "lunc", "xec", "win", "bidr", "spell", "hot", "doge",
    "pepe", "floki", "idrt", "dogs", "bonk", "1000sats", "neiro",
    "1000pepper", "not", "nft", "bome", "1mbabydoge",
];

/// 소수점 2자리 자산인지 확인 (대소문자 무시)
pub fn is_two_digit_symbol(symbol: &str) -> bool {
    let lower = symbol.to_lowercase();
    TWO_DIGIT_SYMBOLS.contains(&lower.as_str())
}

/// Fixed-point amount multiplier for a symbol: 10^2 for the small-unit-value
/// allow list, 10^8 otherwise.
pub fn amount_multiplier(symbol: &str) -> u64 {
    if is_two_digit_symbol(symbol) {
        100
    } else {
        100_000_000
    }
}

/// Price multiplier for a symbol: 10^14 for the small-unit-value allow list,
/// 10^8 otherwise.
pub fn price_multiplier(symbol: &str) -> u64 {
    if is_two_digit_symbol(symbol) {
        100_000_000_000_000
    } else {
        100_000_000
    }
}

/// 32바이트 해시/필드 원소 표현
pub type Bytes32 = [u8; 32];

/// 자산의 분층 담보 비율 한 구간
///
/// `precomputed_value` is the cumulative haircut value over tiers `[0..=i]`
/// evaluated at `boundary_value`, so the piecewise evaluation needs a single
/// lookup plus one linear term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TierRatio {
    /// 구간 경계값 (126비트 이하)
    pub boundary_value: u128,
    /// 구간 담보 비율 (0-100)
    pub ratio: u8,
    /// 사전 계산된 누적값 (설정 JSON 에서는 생략 가능: 커밋먼트에 불포함)
    #[serde(default)]
    pub precomputed_value: u128,
}

/// 거래소(CEX)의 자산 하나에 대한 전체 정보
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CexAssetInfo {
    /// 총 권익
    pub total_equity: u64,
    /// 총 부채
    pub total_debt: u64,
    /// 기준 가격
    pub base_price: u64,
    /// 자산 심볼
    pub symbol: String,
    /// 자산 인덱스
    pub index: u32,

    // 세 가지 담보 유형별 총량
    pub loan_collateral: u64,
    pub margin_collateral: u64,
    pub portfolio_margin_collateral: u64,

    // 세 가지 담보 유형별 분층 비율 구성
    pub loan_ratios: [TierRatio; TIER_COUNT],
    pub margin_ratios: [TierRatio; TIER_COUNT],
    pub portfolio_margin_ratios: [TierRatio; TIER_COUNT],
}

impl CexAssetInfo {
    /// Reserved filler entry for unused indices past the parsed asset list.
    pub fn reserved(index: u32) -> Self {
        let empty = crate::valuation::pad_tier_ratios(Vec::new());
        CexAssetInfo {
            total_equity: 0,
            total_debt: 0,
            base_price: 0,
            symbol: "reserved".to_string(),
            index,
            loan_collateral: 0,
            margin_collateral: 0,
            portfolio_margin_collateral: 0,
            loan_ratios: empty,
            margin_ratios: empty,
            portfolio_margin_ratios: empty,
        }
    }
}

/// 계정이 보유한 자산 하나의 상태
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AccountAsset {
    /// 자산 인덱스
    pub index: u16,
    /// 권익 수량
    pub equity: u64,
    /// 부채 수량
    pub debt: u64,
    /// 대출 담보 수량
    pub loan: u64,
    /// 보증금 담보 수량
    pub margin: u64,
    /// 포트폴리오 마진 담보 수량
    pub portfolio_margin: u64,
}

impl AccountAsset {
    /// 모든 수량이 0인지 확인
    pub fn is_empty(&self) -> bool {
        self.equity == 0
            && self.debt == 0
            && self.loan == 0
            && self.margin == 0
            && self.portfolio_margin == 0
    }

    /// Zero-amount placeholder at the given index.
    pub fn empty_at(index: u16) -> Self {
        AccountAsset {
            index,
            ..Default::default()
        }
    }
}

/// 완전한 계정 정보
///
/// Totals are price-weighted sums over all assets and can exceed 128 bits in
/// the worst case, hence `BigUint`. Assets are strictly ascending by `index`;
/// the commitment layer and the circuit both rely on that ordering for
/// uniqueness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AccountInfo {
    pub account_index: u32,
    /// 32바이트 필드 원소로 축약된 계정 ID
    pub account_id: Bytes32,
    #[serde(with = "biguint_str")]
    pub total_equity: BigUint,
    #[serde(with = "biguint_str")]
    pub total_debt: BigUint,
    #[serde(with = "biguint_str")]
    pub total_collateral: BigUint,
    pub assets: Vec<AccountAsset>,
}

impl AccountInfo {
    /// Padding account used to fill the last batch of a tier: zero assets at
    /// indices `0..asset_tier`, zero totals, zero account id.
    pub fn padding(account_index: u32, asset_tier: usize) -> Self {
        AccountInfo {
            account_index,
            account_id: [0u8; 32],
            total_equity: BigUint::default(),
            total_debt: BigUint::default(),
            total_collateral: BigUint::default(),
            assets: (0..asset_tier)
                .map(|j| AccountAsset::empty_at(j as u16))
                .collect(),
        }
    }
}

/// 사용자 생성 작업 하나
///
/// The proof authenticates the empty leaf at `account_index` against
/// `before_account_tree_root`; the account leaf hash authenticates against
/// `after_account_tree_root`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateUserOperation {
    pub before_account_tree_root: Bytes32,
    pub after_account_tree_root: Bytes32,
    pub assets: Vec<AccountAsset>,
    pub account_index: u32,
    pub account_id_hash: Bytes32,
    /// 깊이 28 Merkle 포함 증명 (LSB 우선 형제 노드)
    pub account_proof: [Bytes32; ACCOUNT_TREE_DEPTH],
}

/// 배치 하나의 운반 객체
///
/// `batch_commitment = Poseidon(before_root, after_root, before_cex, after_cex)`
/// is the SNARK's single public input. The after-side CEX state is derivable
/// by replaying the ops onto `before_cex_assets`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BatchCreateUserWitness {
    pub batch_commitment: Bytes32,
    pub before_account_tree_root: Bytes32,
    pub after_account_tree_root: Bytes32,
    pub before_cex_assets_commitment: Bytes32,
    pub after_cex_assets_commitment: Bytes32,
    pub before_cex_assets: Vec<CexAssetInfo>,
    pub create_user_ops: Vec<CreateUserOperation>,
}

/// BatchRecord 상태 수명주기: Published → Received → Finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum BatchStatus {
    /// witness builder 가 행을 기록함
    Published = 0,
    /// prover worker 가 디스패치함
    Received = 1,
    /// 증명이 영속화됨
    Finished = 2,
}

impl BatchStatus {
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

/// BigUint <-> 십진 문자열 serde 도우미
///
/// 사용자 증명 번들의 JSON 총액 필드는 십진 문자열로 기록
pub mod biguint_str {
    use num_bigint::BigUint;
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(v: &BigUint, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BigUint, D::Error> {
        let raw = String::deserialize(d)?;
        BigUint::from_str(&raw).map_err(de::Error::custom)
    }
}
