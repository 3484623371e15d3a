//! Services Module
//!
//! 파이프라인 단계별 비즈니스 로직
//!
//! # Services
//! - `WitnessService`: 배치 견증 생성 (SMT 갱신 + 견증 행 기록)
//! - `ProverService`: 큐 소비 + Groth16 증명 생성/영속화
//! - `verifier`: 배치 체인 재생 검증 및 단일 사용자 검증
//! - `UserProofService`: 사용자별 포함 증명 내보내기

mod prover;
pub mod userproof;
pub mod verifier;
mod witness;

pub use prover::ProverService;
pub use userproof::UserProofService;
pub use witness::WitnessService;
