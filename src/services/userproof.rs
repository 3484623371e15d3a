//! User Proof Exporter
//!
//! Runs once over a fully built account tree and emits one inclusion-proof
//! bundle per real account: the plain asset list, the three totals, the leaf
//! hash and the 28-sibling path, plus the ready-to-publish user config JSON.
//! Bundles are flushed in groups of 100; a restart counts the existing rows
//! and resumes where it stopped.
//!
//! `--memory_tree` mode rebuilds the tree in memory (with the same batch
//! padding the witness builder applies) purely to print the root, a cheap
//! cross-check of a production run, with no database writes.

use std::collections::HashMap;
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::config::UserConfig;
use crate::crypto::commitment::{account_leaf_hash, compute_user_assets_commitment};
use crate::db::{Database, UserProofRecord};
use crate::tree::AccountTree;
use crate::types::{ops_per_batch, AccountInfo, Bytes32};

const WRITE_BATCH: usize = 100;

/// 사용자 증명 내보내기 서비스
pub struct UserProofService {
    db: Arc<Database>,
    account_tree: AccountTree,
    accounts: HashMap<usize, Vec<AccountInfo>>,
}

impl UserProofService {
    pub fn new(
        db: Database,
        account_tree: AccountTree,
        accounts: HashMap<usize, Vec<AccountInfo>>,
    ) -> Self {
        UserProofService {
            db: Arc::new(db),
            account_tree,
            accounts,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        self.db.ensure_userproof_table().await?;
        let existing = self.db.user_proof_counts().await? as usize;

        let mut keys: Vec<usize> = self.accounts.keys().copied().collect();
        keys.sort_unstable();
        let expected_total: usize = self.accounts.values().map(|v| v.len()).sum();
        tracing::info!(
            "exporting proofs for {} accounts ({} already present)",
            expected_total,
            existing
        );
        if existing >= expected_total {
            tracing::info!("userproof export already complete");
            return Ok(());
        }

        let root = self.account_tree.root()?;
        let root_hex = hex::encode(root);

        // writer: 100개 단위로 모아 기록
        let (tx, rx) = sync_channel::<UserProofRecord>(1000);
        let db = self.db.clone();
        let handle = tokio::runtime::Handle::current();
        let writer = tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut written = 0usize;
            let mut pending: Vec<UserProofRecord> = Vec::with_capacity(WRITE_BATCH);
            while let Ok(record) = rx.recv() {
                pending.push(record);
                if pending.len() == WRITE_BATCH {
                    handle.block_on(db.create_user_proofs(&pending))?;
                    written += pending.len();
                    pending.clear();
                    if written % 100_000 == 0 {
                        tracing::info!("wrote {} proofs to store", written);
                    }
                }
            }
            if !pending.is_empty() {
                handle.block_on(db.create_user_proofs(&pending))?;
                written += pending.len();
            }
            Ok(written)
        });

        let produce = tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut skipped = 0usize;
            let mut produced = 0usize;
            for key in keys {
                for account in &self.accounts[&key] {
                    if skipped < existing {
                        skipped += 1;
                        continue;
                    }
                    let leaf = self.account_tree.get_leaf(account.account_index as u64)?;
                    let proof = self.account_tree.get_proof(account.account_index as u64)?;
                    let record = convert_account(account, &leaf, &proof, &root_hex)?;
                    if tx.send(record).is_err() {
                        anyhow::bail!("userproof writer stopped early");
                    }
                    produced += 1;
                }
            }
            drop(tx);
            Ok(produced)
        });

        let produced = produce.await.context("producer panicked")??;
        let written = writer.await.context("writer panicked")??;
        anyhow::ensure!(
            produced == written,
            "produced {} records but wrote {}",
            produced,
            written
        );
        anyhow::ensure!(
            existing + written == expected_total,
            "account count mismatch: {} + {} != {}",
            existing,
            written,
            expected_total
        );
        tracing::info!("userproof service run finished, wrote {} bundles", written);
        Ok(())
    }
}

/// 계정 하나 → 저장 행 (+배포용 UserConfig JSON)
fn convert_account(
    account: &AccountInfo,
    leaf: &Bytes32,
    proof: &[Bytes32],
    root_hex: &str,
) -> Result<UserProofRecord> {
    let proof_b64: Vec<String> = proof.iter().map(|s| BASE64.encode(s)).collect();
    let user_config = UserConfig {
        account_index: account.account_index,
        account_id_hash: hex::encode(account.account_id),
        total_equity: account.total_equity.clone(),
        total_debt: account.total_debt.clone(),
        total_collateral: account.total_collateral.clone(),
        root: root_hex.to_string(),
        assets: account.assets.clone(),
        proof: proof_b64.clone(),
    };
    Ok(UserProofRecord {
        account_index: account.account_index,
        account_id: hex::encode(account.account_id),
        account_leaf_hash: hex::encode(leaf),
        total_equity: account.total_equity.to_string(),
        total_debt: account.total_debt.to_string(),
        total_collateral: account.total_collateral.to_string(),
        assets: serde_json::to_string(&account.assets)?,
        proof: serde_json::to_string(&proof_b64)?,
        config: serde_json::to_string(&user_config)?,
    })
}

/// `--memory_tree`: 패딩 포함 전체 트리를 메모리에 재구성해 루트만 출력
pub fn compute_account_root_hash(
    accounts: &HashMap<usize, Vec<AccountInfo>>,
    mut tree: AccountTree,
) -> Result<Bytes32> {
    println!("empty account tree root is {}", hex::encode(tree.root()?));
    let started = std::time::Instant::now();

    let total: usize = accounts.values().map(|v| v.len()).sum();
    let mut padding_index = total as u32;
    let mut keys: Vec<usize> = accounts.keys().copied().collect();
    keys.sort_unstable();

    for key in keys {
        let per_batch = ops_per_batch(key)
            .ok_or_else(|| anyhow::anyhow!("no ops-per-batch entry for tier {}", key))?;
        let mut group = accounts[&key].clone();
        let batches = (group.len() + per_batch - 1) / per_batch;
        while group.len() < batches * per_batch {
            group.push(AccountInfo::padding(padding_index, key));
            padding_index += 1;
        }
        tracing::info!("tier {}: {} ops", key, group.len());

        let workers = thread::available_parallelism()
            .map(|n| n.get().saturating_sub(2).max(1))
            .unwrap_or(1);
        let slice = group.len().div_ceil(workers);
        let group = Arc::new(group);
        let (tx, rx) = sync_channel::<(u32, Bytes32)>(1000);

        thread::scope(|scope| -> Result<()> {
            for w in 0..workers {
                let start = w * slice;
                if start >= group.len() {
                    break;
                }
                let end = ((w + 1) * slice).min(group.len());
                let group = group.clone();
                let tx = tx.clone();
                scope.spawn(move || {
                    for account in &group[start..end] {
                        let commitment = compute_user_assets_commitment(&account.assets);
                        let leaf = account_leaf_hash(
                            &account.account_id,
                            &account.total_equity,
                            &account.total_debt,
                            &account.total_collateral,
                            &commitment,
                        );
                        if tx.send((account.account_index, leaf)).is_err() {
                            return;
                        }
                    }
                });
            }
            drop(tx);
            let mut set = 0usize;
            while let Ok((index, leaf)) = rx.recv() {
                tree.set(index as u64, leaf)?;
                set += 1;
                if set % 100_000 == 0 {
                    tracing::info!("set {} accounts in tree", set);
                }
            }
            Ok(())
        })?;
    }

    let root = tree.root()?;
    tracing::info!(
        "tree generation took {} ms",
        started.elapsed().as_millis()
    );
    println!("account tree root {}", hex::encode(root));
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{verify_merkle_proof, MemoryStore};
    use crate::types::AccountAsset;
    use num_bigint::BigUint;

    #[test]
    fn test_convert_account_bundle_verifies() {
        let account = AccountInfo {
            account_index: 4,
            account_id: [0x11u8; 32],
            total_equity: BigUint::from(900u32),
            total_debt: BigUint::from(100u32),
            total_collateral: BigUint::from(400u32),
            assets: vec![AccountAsset {
                index: 1,
                equity: 900,
                debt: 100,
                loan: 400,
                margin: 0,
                portfolio_margin: 0,
            }],
        };
        let commitment = compute_user_assets_commitment(&account.assets);
        let leaf = account_leaf_hash(
            &account.account_id,
            &account.total_equity,
            &account.total_debt,
            &account.total_collateral,
            &commitment,
        );
        let mut tree = AccountTree::new(Box::new(MemoryStore::new())).unwrap();
        tree.set(4, leaf).unwrap();
        let proof = tree.get_proof(4).unwrap();
        let root_hex = hex::encode(tree.root().unwrap());

        let record = convert_account(&account, &leaf, &proof, &root_hex).unwrap();
        assert_eq!(record.account_index, 4);
        assert_eq!(record.total_equity, "900");

        // the embedded config round-trips into a bundle that verifies
        let bundle: UserConfig = serde_json::from_str(&record.config).unwrap();
        assert!(crate::services::verifier::run_user(&bundle).unwrap());
        let root = bundle.decoded_root().unwrap();
        assert!(verify_merkle_proof(&root, 4, &proof, &leaf));
    }

    #[test]
    fn test_memory_root_matches_direct_build() {
        // two accounts through the worker pipeline equal a direct build
        let accounts: Vec<AccountInfo> = (0..2)
            .map(|i| AccountInfo {
                account_index: i,
                account_id: [i as u8 + 1; 32],
                total_equity: BigUint::from(100u32),
                total_debt: BigUint::default(),
                total_collateral: BigUint::default(),
                assets: vec![AccountAsset {
                    index: 0,
                    equity: 100,
                    debt: 0,
                    loan: 0,
                    margin: 0,
                    portfolio_margin: 0,
                }],
            })
            .collect();
        let mut map = HashMap::new();
        map.insert(50usize, accounts.clone());

        let root = compute_account_root_hash(
            &map,
            AccountTree::new(Box::new(MemoryStore::new())).unwrap(),
        )
        .unwrap();

        let mut direct = AccountTree::new(Box::new(MemoryStore::new())).unwrap();
        let total = accounts.len();
        let per_batch = ops_per_batch(50).unwrap();
        let mut all = accounts;
        let mut padding_index = total as u32;
        while all.len() < per_batch {
            all.push(AccountInfo::padding(padding_index, 50));
            padding_index += 1;
        }
        for account in &all {
            let commitment = compute_user_assets_commitment(&account.assets);
            let leaf = account_leaf_hash(
                &account.account_id,
                &account.total_equity,
                &account.total_debt,
                &account.total_collateral,
                &commitment,
            );
            direct.set(account.account_index as u64, leaf).unwrap();
        }
        assert_eq!(root, direct.root().unwrap());
    }
}
