//! Batch Witness Builder
//!
//! Turns the parsed account set into an ordered stream of batch witnesses:
//! pads each tier to whole batches, drives the account tree forward one
//! create-user operation at a time, and persists one Published row per batch.
//!
//! # Thread layout
//!
//! ```text
//! hasher threads (NCPU-2)          tree thread                writer thread
//! ┌──────────────────────┐   per-slot SPSC (cap 1)   ┌──────────────────┐
//! │ account leaf hashes  │ ────────────────────────▶ │ SMT set / proofs │
//! └──────────────────────┘                           │ CEX accumulation │
//!                                                    └────────┬─────────┘
//!                                             bounded channel (cap 100)
//!                                                    ┌────────▼─────────┐
//!                                                    │ DB insert + queue│
//!                                                    └──────────────────┘
//! ```
//!
//! Leaf hashing dominates CPU and runs ahead of the serial tree thread; the
//! capacity-1 hand-off per batch slot gives backpressure. Witness rows reach
//! the store in strict ascending height order.
//!
//! # Recovery
//!
//! On startup the builder reads the latest persisted height `h`, replays the
//! latest witness to recover the exchange state, rolls the tree back to
//! version `h+1` if it ran ahead, and resumes at batch `h+1`. A tree behind
//! `h+1` means the node store lost committed data, which is fatal.

use std::collections::HashMap;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::crypto::commitment::{
    account_leaf_hash, batch_commitment, compute_cex_assets_commitment,
    compute_user_assets_commitment,
};
use crate::db::{BatchWitnessRecord, Database};
use crate::encoding::{decode_batch_witness, encode_batch_witness, recover_after_cex_assets};
use crate::error::{safe_add, PorError};
use crate::queue::TaskQueue;
use crate::tree::{empty_leaf_hash, AccountTree};
use crate::types::{
    ops_per_batch, AccountInfo, BatchCreateUserWitness, BatchStatus, Bytes32, CexAssetInfo,
    CreateUserOperation,
};

/// 견증 생성 서비스
pub struct WitnessService {
    db: Arc<Database>,
    account_tree: AccountTree,
    /// 티어별 계정 그룹 (파싱 결과)
    ops: HashMap<usize, Vec<AccountInfo>>,
    cex_assets: Vec<CexAssetInfo>,
    total_ops_number: u32,
    config: Config,
}

/// 티어별 배치 구간: [start_batch, end_batch)
struct TierPlan {
    asset_tier: usize,
    start_batch: i64,
    end_batch: i64,
}

impl WitnessService {
    pub fn new(
        db: Database,
        account_tree: AccountTree,
        ops: HashMap<usize, Vec<AccountInfo>>,
        cex_assets: Vec<CexAssetInfo>,
        config: Config,
    ) -> Self {
        let total_ops_number = ops.values().map(|v| v.len() as u32).sum();
        WitnessService {
            db: Arc::new(db),
            account_tree,
            ops,
            cex_assets,
            total_ops_number,
            config,
        }
    }

    /// 전체 실행: 복구 → 패딩 → 배치 생성 → 완료
    pub async fn run(mut self) -> Result<()> {
        self.db.ensure_witness_table().await?;

        // 1. 상태 복구
        let latest = self.db.latest_batch_witness().await?;
        let height: i64 = match &latest {
            Some(record) => {
                let witness = decode_batch_witness(&record.witness_data)?;
                self.cex_assets = recover_after_cex_assets(&witness)?;
                tracing::info!("recovered cex state from batch {}", record.height);
                record.height
            }
            None => -1,
        };

        let plans = self.batch_plans()?;
        let total_batches = plans.last().map(|p| p.end_batch).unwrap_or(0);
        if height == total_batches - 1 {
            tracing::info!("all {} batch witnesses already generated", total_batches);
            return Ok(());
        }
        tracing::info!("latest persisted height is {}", height);

        // 2. 트리 버전 검증/롤백
        let expected_version = (height + 1) as u64;
        let tree_version = self.account_tree.latest_version();
        if tree_version > expected_version {
            self.account_tree
                .rollback(expected_version)
                .context("rollback account tree")?;
            tracing::info!(
                "rolled tree back to version {}, root {}",
                expected_version,
                hex::encode(self.account_tree.root()?)
            );
        } else if tree_version < expected_version {
            return Err(PorError::ConfigInvariant(format!(
                "account tree version {} is behind persisted height {}",
                tree_version, height
            ))
            .into());
        }

        // 3. 티어별 전체 배치 채우기
        self.padding_accounts();

        // 4. writer 스레드: 견증 행 기록 + 큐 적재
        let (witness_tx, witness_rx) = mpsc::channel::<BatchWitnessRecord>(100);
        let writer = spawn_writer(self.db.clone(), &self.config, witness_rx)?;

        // 5. 트리 스레드 본체 (CPU 바운드: blocking 스레드에서 실행)
        let mut tree = self.account_tree;
        let mut cex_assets = self.cex_assets;
        let groups: HashMap<usize, Arc<Vec<AccountInfo>>> = self
            .ops
            .into_iter()
            .map(|(k, v)| (k, Arc::new(v)))
            .collect();

        let build = tokio::task::spawn_blocking(move || -> Result<Bytes32> {
            for plan in &plans {
                let group = groups
                    .get(&plan.asset_tier)
                    .expect("plan exists only for parsed tiers")
                    .clone();
                run_tier(
                    &mut tree,
                    &mut cex_assets,
                    group,
                    plan,
                    height,
                    &witness_tx,
                )?;
            }
            drop(witness_tx);
            Ok(tree.root()?)
        });

        let final_root = build.await.context("tree thread panicked")??;
        writer.await.context("writer thread panicked")??;
        tracing::info!("witness run finished, account tree root {}", hex::encode(final_root));
        Ok(())
    }

    /// 티어 오름차순으로 누적 배치 구간 계산
    fn batch_plans(&self) -> Result<Vec<TierPlan>> {
        let mut keys: Vec<usize> = self.ops.keys().copied().collect();
        keys.sort_unstable();
        let mut plans = Vec::with_capacity(keys.len());
        let mut cursor: i64 = 0;
        for key in keys {
            let per_batch = ops_per_batch(key).ok_or_else(|| {
                PorError::ConfigInvariant(format!("no ops-per-batch entry for tier {}", key))
            })?;
            let accounts = self.ops[&key].len();
            let batches = (accounts + per_batch - 1) / per_batch;
            plans.push(TierPlan {
                asset_tier: key,
                start_batch: cursor,
                end_batch: cursor + batches as i64,
            });
            cursor += batches as i64;
        }
        Ok(plans)
    }

    /// 각 티어를 배치 크기의 배수로 채움. 합성 계정 인덱스는 전체 실계정
    /// 수에서 이어지므로 트리 위치가 유일하다.
    fn padding_accounts(&mut self) {
        let mut keys: Vec<usize> = self.ops.keys().copied().collect();
        keys.sort_unstable();
        let mut padding_index = self.total_ops_number;
        for key in keys {
            let per_batch = ops_per_batch(key).expect("validated in batch_plans");
            let group = self.ops.get_mut(&key).expect("key from ops");
            let batches = (group.len() + per_batch - 1) / per_batch;
            let target = batches * per_batch;
            while group.len() < target {
                group.push(AccountInfo::padding(padding_index, key));
                padding_index += 1;
            }
        }
    }
}

/// DB writer: 채널을 비우며 행 기록 + 큐에 높이 적재 (오름차순 보존)
fn spawn_writer(
    db: Arc<Database>,
    config: &Config,
    mut rx: mpsc::Receiver<BatchWitnessRecord>,
) -> Result<tokio::task::JoinHandle<Result<()>>> {
    let mut queue = TaskQueue::connect(
        &config.redis.host,
        &config.redis.password,
        &config.task_queue_name(),
    )
    .context("connect task queue")?;
    let handle = tokio::runtime::Handle::current();

    Ok(tokio::task::spawn_blocking(move || -> Result<()> {
        while let Some(record) = rx.blocking_recv() {
            let height = record.height;
            handle
                .block_on(db.create_batch_witness(&record))
                .with_context(|| format!("persist batch witness {}", height))?;
            queue.push_height(height).context("enqueue batch height")?;
            if height % 100 == 0 {
                tracing::info!("saved batch {} to store", height);
            }
        }
        Ok(())
    }))
}

/// 한 티어의 전체 배치 처리: 해시 워커 + 직렬 트리 갱신
fn run_tier(
    tree: &mut AccountTree,
    cex_assets: &mut Vec<CexAssetInfo>,
    group: Arc<Vec<AccountInfo>>,
    plan: &TierPlan,
    recovered_height: i64,
    witness_tx: &mpsc::Sender<BatchWitnessRecord>,
) -> Result<()> {
    let per_batch = ops_per_batch(plan.asset_tier).expect("validated earlier");
    let workers = thread::available_parallelism()
        .map(|n| n.get().saturating_sub(2).max(1))
        .unwrap_or(1);
    let slice = per_batch.div_ceil(workers);

    // 슬롯별 용량 1 SPSC: 워커가 트리 스레드보다 앞서가되 배치 하나만큼만
    let mut slot_txs: Vec<SyncSender<Bytes32>> = Vec::with_capacity(per_batch);
    let mut slot_rxs: Vec<Receiver<Bytes32>> = Vec::with_capacity(per_batch);
    for _ in 0..per_batch {
        let (tx, rx) = sync_channel::<Bytes32>(1);
        slot_txs.push(tx);
        slot_rxs.push(rx);
    }

    let mut hashers = Vec::with_capacity(workers);
    for w in 0..workers {
        let low_slot = w * slice;
        if low_slot >= per_batch {
            break;
        }
        let high_slot = ((w + 1) * slice).min(per_batch);
        let group = group.clone();
        let txs: Vec<SyncSender<Bytes32>> = slot_txs[low_slot..high_slot].to_vec();
        let (start_batch, end_batch) = (plan.start_batch, plan.end_batch);
        hashers.push(thread::spawn(move || {
            for batch in start_batch..end_batch {
                if batch <= recovered_height {
                    continue;
                }
                let base = (batch - start_batch) as usize * per_batch;
                for (i, slot) in (low_slot..high_slot).enumerate() {
                    let account = &group[base + slot];
                    let commitment = compute_user_assets_commitment(&account.assets);
                    let leaf = account_leaf_hash(
                        &account.account_id,
                        &account.total_equity,
                        &account.total_debt,
                        &account.total_collateral,
                        &commitment,
                    );
                    if txs[i].send(leaf).is_err() {
                        return; // tree thread gone, shut down quietly
                    }
                }
            }
        }));
    }
    drop(slot_txs);

    let result = (|| -> Result<()> {
        for batch in plan.start_batch..plan.end_batch {
            if batch <= recovered_height {
                continue;
            }
            let record = build_batch(tree, cex_assets, &group, plan, batch, per_batch, &slot_rxs)?;
            tree.commit((batch + 1) as u64)?;
            witness_tx
                .blocking_send(record)
                .map_err(|_| PorError::ConfigInvariant("witness writer stopped early".to_string()))?;
        }
        Ok(())
    })();

    drop(slot_rxs);
    for hasher in hashers {
        let _ = hasher.join();
    }
    result
}

/// 배치 하나: 스냅샷 → 연산 적용 → 승인 계산 → 직렬화
fn build_batch(
    tree: &mut AccountTree,
    cex_assets: &mut Vec<CexAssetInfo>,
    group: &[AccountInfo],
    plan: &TierPlan,
    batch: i64,
    per_batch: usize,
    slot_rxs: &[Receiver<Bytes32>],
) -> Result<BatchWitnessRecord> {
    let before_account_tree_root = tree.root()?;
    let before_cex_assets = cex_assets.clone();
    let before_cex_assets_commitment = compute_cex_assets_commitment(cex_assets);

    let base = (batch - plan.start_batch) as usize * per_batch;
    let mut create_user_ops = Vec::with_capacity(per_batch);
    for slot in 0..per_batch {
        let account = &group[base + slot];
        let index = account.account_index as u64;

        // 위치는 반드시 미기록 상태여야 함
        if tree.get_leaf(index)? != empty_leaf_hash() {
            return Err(PorError::MerkleMismatch(format!(
                "account position {} already holds a leaf",
                index
            ))
            .into());
        }
        let before_root = tree.root()?;
        let account_proof = tree.get_proof(index)?;

        for asset in &account.assets {
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

        let leaf = slot_rxs[slot]
            .recv()
            .map_err(|_| PorError::ConfigInvariant("hasher thread stopped early".to_string()))?;
        tree.set(index, leaf)?;

        create_user_ops.push(CreateUserOperation {
            before_account_tree_root: before_root,
            after_account_tree_root: tree.root()?,
            assets: account.assets.clone(),
            account_index: account.account_index,
            account_id_hash: account.account_id,
            account_proof,
        });
    }

    let after_account_tree_root = tree.root()?;
    let after_cex_assets_commitment = compute_cex_assets_commitment(cex_assets);
    let witness = BatchCreateUserWitness {
        batch_commitment: batch_commitment(
            &before_account_tree_root,
            &after_account_tree_root,
            &before_cex_assets_commitment,
            &after_cex_assets_commitment,
        ),
        before_account_tree_root,
        after_account_tree_root,
        before_cex_assets_commitment,
        after_cex_assets_commitment,
        before_cex_assets,
        create_user_ops,
    };

    Ok(BatchWitnessRecord {
        height: batch,
        witness_data: encode_batch_witness(&witness)?,
        status: BatchStatus::Published.as_i64(),
    })
}
