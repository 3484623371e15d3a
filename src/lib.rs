//! zkpor: Proof of Solvency Pipeline
//!
//! # Overview
//!
//! 거래소의 사용자 보유 내역으로부터 지급능력(PoS) 증명을 생성/검증하는
//! 파이프라인. 네 개의 바이너리가 하나의 라이브러리를 공유한다.
//!
//! ```text
//! ┌──────────┐   witness rows    ┌───────────┐   proof rows   ┌──────────┐
//! │ witness  │ ────────────────▶ │  prover   │ ─────────────▶ │ verifier │
//! │ builder  │    + task queue   │ workers   │   CSV export   │  replay  │
//! └────┬─────┘                   └───────────┘                └──────────┘
//!      │ frozen SMT
//! ┌────▼─────┐
//! │ userproof│  per-account inclusion bundles
//! └──────────┘
//! ```
//!
//! ## Modules
//!
//! - `types`: 도메인 모델 (계층 비율, CEX 자산, 계정, 배치 견증)
//! - `crypto`: Poseidon 해시와 커밋먼트 패킹
//! - `valuation`: 분층 담보 헤어컷
//! - `tree`: 깊이 28 버전드 SMT (memory/redis)
//! - `parser`: 사용자/CEX CSV 파싱
//! - `encoding`: 견증 blob 코덱 (bincode + snappy + base64)
//! - `circuit`: 회로 견증 유도 (티어 인덱스/플래그, 평탄화)
//! - `snark`: Groth16 파라미터 로드/증명/검증
//! - `db` / `queue`: MySQL 저장소와 Redis 작업 큐
//! - `services`: witness / prover / verifier / userproof 단계

pub mod circuit;
pub mod config;
pub mod crypto;
pub mod db;
pub mod encoding;
pub mod error;
pub mod parser;
pub mod queue;
pub mod services;
pub mod snark;
pub mod tree;
pub mod types;
pub mod valuation;

// Re-exports for convenience
pub use config::{Config, UserConfig};
pub use db::Database;
pub use error::PorError;
pub use services::{ProverService, UserProofService, WitnessService};
