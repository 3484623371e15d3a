//! Database Models
//!
//! suffix 스코프 테이블 3개의 행 타입 정의
//!
//! - `witness<suffix>`: 배치 견증 blob + 상태 (Published → Received → Finished)
//! - `proof<suffix>`: 배치별 Groth16 증명 + 재생 메타데이터
//! - `userproof<suffix>`: 사용자별 포함 증명 번들
//!
//! Blob columns hold base64 (witness, proof) or JSON (commitment lists,
//! user bundles); roots and ids are hex.

use sqlx::FromRow;

/// 배치 견증 행
#[derive(Debug, Clone, FromRow)]
pub struct BatchWitnessRecord {
    /// 배치 높이 (유일)
    pub height: i64,
    /// bincode + snappy + base64 인코딩된 BatchCreateUserWitness
    pub witness_data: String,
    /// BatchStatus 값
    pub status: i64,
}

/// 증명 행
#[derive(Debug, Clone, FromRow)]
pub struct ProofRecord {
    /// base64 raw Groth16 proof
    pub proof_info: String,
    /// JSON [before, after] base64 CEX 자산 승인 목록
    pub cex_asset_list_commitments: String,
    /// JSON [before, after] base64 계정 트리 루트
    pub account_tree_roots: String,
    /// base64 배치 승인 (SNARK 공개 입력)
    pub batch_commitment: String,
    /// 티어 키 (사용자 자산 수)
    pub assets_count: i64,
    /// 배치 번호 (유일)
    pub batch_number: i64,
}

/// 사용자 증명 행
#[derive(Debug, Clone, FromRow)]
pub struct UserProofRecord {
    /// 계정 인덱스 (유일)
    pub account_index: u32,
    /// hex 계정 ID (유일)
    pub account_id: String,
    /// hex 계정 리프 해시
    pub account_leaf_hash: String,
    pub total_equity: String,
    pub total_debt: String,
    pub total_collateral: String,
    /// JSON 자산 목록
    pub assets: String,
    /// JSON base64 형제 노드 28개
    pub proof: String,
    /// 사용자에게 배포되는 UserConfig JSON
    pub config: String,
}
