//! Configuration Module
//!
//! JSON 기반 설정 로드 (config/config.json, config/user_config.json)
//!
//! # Design Decision
//!
//! 필수 값과 파생 값을 명확히 구분:
//! - 필수: MysqlDataSource, DbSuffix, UserDataFile 등 (없으면 시작 불가)
//! - 파생: 테이블 이름, 작업 큐 이름 (suffix 로부터 계산)
//!
//! DB 비밀번호는 설정 파일에 두지 않는다. `--remote_password_config=<id>` 가
//! 주어지면 secret 항목 `<id>` 의 JSON payload 에서 `db_password` 를 꺼내
//! DSN 의 `user:` 와 `@tcp` 사이에 끼워 넣는다 (`.env` 는 dotenvy 로 로드).

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::{AccountAsset, Bytes32, CexAssetInfo};
use num_bigint::BigUint;

/// 트리 노드 저장소 선택
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TreeDbConfig {
    /// "memory" 또는 "redis"
    pub driver: String,
    pub option: TreeDbOption,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TreeDbOption {
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RedisConfig {
    pub host: String,
    #[serde(default)]
    pub password: String,
}

/// 파이프라인 전역 설정 (witness / prover / verifier / userproof 공용)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    /// verifier 가 읽는 증명 CSV 내보내기 경로
    #[serde(default)]
    pub proof_table: String,
    /// 티어별 SNARK 파라미터 세션 이름 (<name>.r1cs/.pk/.vk)
    #[serde(default)]
    pub zk_key_name: Vec<String>,
    /// 티어별 사용자 자산 수 (ZkKeyName 과 같은 길이)
    #[serde(default)]
    pub assets_count_tiers: Vec<usize>,
    /// verifier 가 사용하는 공표된 CEX 자산 정보
    #[serde(default)]
    pub cex_assets_info: Vec<CexAssetInfo>,
    /// user:password@tcp(host:port)/dbname 형식
    #[serde(default)]
    pub mysql_data_source: String,
    /// 환경별 테이블/큐 suffix
    #[serde(default)]
    pub db_suffix: String,
    #[serde(default = "RedisConfig::default_local")]
    pub redis: RedisConfig,
    /// 사용자 CSV 디렉터리
    #[serde(default)]
    pub user_data_file: String,
    #[serde(rename = "TreeDB", default = "TreeDbConfig::default_memory")]
    pub tree_db: TreeDbConfig,
}

impl RedisConfig {
    fn default_local() -> Self {
        RedisConfig {
            host: "127.0.0.1:6379".to_string(),
            password: String::new(),
        }
    }
}

impl TreeDbConfig {
    fn default_memory() -> Self {
        TreeDbConfig {
            driver: "memory".to_string(),
            option: TreeDbOption {
                addr: String::new(),
            },
        }
    }
}

impl Config {
    /// config/config.json 로드
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("parse config file {}", path.display()))?;
        Ok(config)
    }

    /// 티어 구성 검증: ZkKeyName 과 AssetsCountTiers 는 길이가 같아야 함
    pub fn validate_tiers(&self) -> Result<()> {
        anyhow::ensure!(
            self.zk_key_name.len() == self.assets_count_tiers.len(),
            "AssetsCountTiers has {} entries but ZkKeyName has {}",
            self.assets_count_tiers.len(),
            self.zk_key_name.len()
        );
        Ok(())
    }

    /// 작업 큐 이름 (suffix 스코프)
    pub fn task_queue_name(&self) -> String {
        format!("por_batch_task_queue_{}", self.db_suffix)
    }
}

/// 단일 사용자 검증 모드 설정 (config/user_config.json)
///
/// The bundle a user receives from the exporter: account identity, declared
/// totals, the asset list and the 28-sibling inclusion proof (base64).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserConfig {
    pub account_index: u32,
    /// hex 32바이트
    pub account_id_hash: String,
    #[serde(with = "crate::types::biguint_str")]
    pub total_equity: BigUint,
    #[serde(with = "crate::types::biguint_str")]
    pub total_debt: BigUint,
    #[serde(with = "crate::types::biguint_str")]
    pub total_collateral: BigUint,
    /// hex 32바이트 계정 트리 루트
    pub root: String,
    pub assets: Vec<AccountAsset>,
    /// base64 32바이트 × 28
    pub proof: Vec<String>,
}

impl UserConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read user config {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parse user config {}", path.display()))
    }

    pub fn decoded_root(&self) -> Result<Bytes32> {
        decode_hex32(&self.root).context("invalid account tree root")
    }

    pub fn decoded_account_id_hash(&self) -> Result<Bytes32> {
        decode_hex32(&self.account_id_hash).context("invalid AccountIdHash")
    }
}

pub fn decode_hex32(raw: &str) -> Result<Bytes32> {
    let bytes = hex::decode(raw.trim())?;
    anyhow::ensure!(bytes.len() == 32, "want 32 bytes, got {}", bytes.len());
    Ok(bytes.try_into().expect("length checked"))
}

/// `--remote_password_config` 처리: secret 항목의 JSON payload 에서
/// `db_password` 를 읽어 `user:password@tcp(...)` DSN 에 끼워 넣는다.
///
/// Secret material reaches the process through the environment (`.env` in
/// development, the deployment's secret mount in production); the flag value
/// names the environment entry. The username must not contain `:`.
pub fn get_mysql_source(source: &str, secret_id: &str) -> Result<String> {
    let payload = std::env::var(secret_id)
        .with_context(|| format!("secret entry {:?} not present in environment", secret_id))?;
    let parsed: serde_json::Value =
        serde_json::from_str(&payload).with_context(|| format!("secret {:?} is not JSON", secret_id))?;
    let password = parsed
        .get("db_password")
        .and_then(|v| v.as_str())
        .with_context(|| format!("secret {:?} has no db_password field", secret_id))?;

    let colon = source.find(':');
    let at_tcp = source.find("@tcp");
    match (colon, at_tcp) {
        (Some(a), Some(b)) if a < b => Ok(format!("{}{}{}", &source[..a + 1], password, &source[b..])),
        _ => anyhow::bail!("mysql source is not in user:password@tcp(host:port)/db form"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parse_minimal() {
        let raw = r#"{
            "ProofTable": "config/proof.csv",
            "ZkKeyName": ["zkpor50", "zkpor500"],
            "AssetsCountTiers": [50, 500],
            "MysqlDataSource": "zkpos:zkpos@tcp(127.0.0.1:3306)/zkpos",
            "DbSuffix": "_test",
            "Redis": {"Host": "127.0.0.1:6379", "Password": ""},
            "UserDataFile": "data/users",
            "TreeDB": {"Driver": "memory", "Option": {"Addr": ""}}
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        config.validate_tiers().unwrap();
        assert_eq!(config.task_queue_name(), "por_batch_task_queue__test");
        assert_eq!(config.tree_db.driver, "memory");
    }

    #[test]
    fn test_tier_mismatch_rejected() {
        let config = Config {
            zk_key_name: vec!["only_one".to_string()],
            assets_count_tiers: vec![50, 500],
            ..serde_json::from_str("{}").unwrap()
        };
        assert!(config.validate_tiers().is_err());
    }

    #[test]
    fn test_mysql_secret_splice() {
        std::env::set_var("por_test_secret", r#"{"db_password":"hunter2"}"#);
        let spliced =
            get_mysql_source("zkpos:placeholder@tcp(db:3306)/zkpos", "por_test_secret").unwrap();
        assert_eq!(spliced, "zkpos:hunter2@tcp(db:3306)/zkpos");
        assert!(get_mysql_source("malformed", "por_test_secret").is_err());
    }
}
