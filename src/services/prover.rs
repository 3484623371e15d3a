//! Prover Coordinator
//!
//! Pulls batch heights from the task queue, claims the matching witness row
//! (Published → Received under a row lock), derives the circuit witness,
//! runs Groth16 and persists the proof. Designed to run as N worker
//! processes sharing the queue; within a worker every step for one batch is
//! serial.
//!
//! # Parameter cache
//!
//! The worker owns one `(r1cs, pk, vk)` triple at a time, keyed by the
//! batch's user-asset tier. A batch from the other tier drops the resident
//! triple before streaming the next one from disk, so peak memory stays one
//! triple plus one file stream.
//!
//! # Failure policy
//!
//! Queue timeouts re-check the store and retry while Published work remains;
//! a popped height without a claimable row means another worker family owns
//! it; the worker shuts down in order. A prove or local-verify failure is fatal with no
//! retry: it indicates parameter corruption or a witness-builder bug.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::circuit::BatchCreateUserCircuitWitness;
use crate::config::Config;
use crate::crypto::poseidon::fr_from_bytes;
use crate::db::{BatchWitnessRecord, Database, ProofRecord};
use crate::encoding::decode_batch_witness;
use crate::error::PorError;
use crate::queue::TaskQueue;
use crate::snark::{proof_to_bytes, SnarkParams};
use crate::types::BatchStatus;

/// 증명 생성 서비스 (워커 1개)
pub struct ProverService {
    db: Database,
    queue: TaskQueue,
    session_names: Vec<String>,
    assets_count_tiers: Vec<usize>,
    /// 현재 메모리에 올라온 티어 파라미터
    params: Option<SnarkParams>,
    current_tier: usize,
}

impl ProverService {
    pub fn new(db: Database, config: &Config) -> Result<Self> {
        config.validate_tiers()?;
        let queue = TaskQueue::connect(
            &config.redis.host,
            &config.redis.password,
            &config.task_queue_name(),
        )
        .context("connect task queue")?;
        Ok(ProverService {
            db,
            queue,
            session_names: config.zk_key_name.clone(),
            assets_count_tiers: config.assets_count_tiers.clone(),
            params: None,
            current_tier: 0,
        })
    }

    /// 메인 루프. `rerun` 이면 큐를 거치지 않고 가장 오래된
    /// Received(없으면 Published) 배치를 재처리한다.
    pub async fn run(&mut self, rerun: bool) -> Result<()> {
        self.db.ensure_proof_table().await?;

        loop {
            let record = if rerun {
                self.fetch_for_rerun().await?
            } else {
                self.fetch_next().await?
            };
            let Some(record) = record else {
                tracing::info!("no work left, prover run finished");
                return Ok(());
            };
            self.process_batch(&record).await?;
        }
    }

    /// 큐에서 높이를 꺼내 해당 행을 Received 로 전이시켜 가져온다.
    async fn fetch_next(&mut self) -> Result<Option<BatchWitnessRecord>> {
        loop {
            let height = tokio::task::block_in_place(|| self.queue.pop_height())?;
            let Some(height) = height else {
                // 타임아웃: Published 행이 남아 있으면 재시도, 없으면 종료
                let remaining = self
                    .db
                    .count_witness_by_status(BatchStatus::Published)
                    .await?;
                if remaining == 0 {
                    return Ok(None);
                }
                tracing::info!("queue empty but {} published batches remain, retrying", remaining);
                continue;
            };

            match self
                .db
                .claim_witness_by_height(height, BatchStatus::Published, BatchStatus::Received)
                .await?
            {
                Some(record) => return Ok(Some(record)),
                None => {
                    // 행이 없거나 이미 다른 워커가 가져감 (정상 종료 경로)
                    tracing::warn!("no claimable witness at height {}, shutting down", height);
                    return Ok(None);
                }
            }
        }
    }

    /// rerun 모드: 가장 오래된 Received, 없으면 Published
    async fn fetch_for_rerun(&mut self) -> Result<Option<BatchWitnessRecord>> {
        if let Some(record) = self
            .db
            .oldest_witness_by_status(BatchStatus::Received)
            .await?
        {
            return Ok(Some(record));
        }
        Ok(self
            .db
            .oldest_witness_by_status(BatchStatus::Published)
            .await?)
    }

    async fn process_batch(&mut self, record: &BatchWitnessRecord) -> Result<()> {
        let height = record.height;
        let witness = decode_batch_witness(&record.witness_data)?;

        let commitments = serde_json::to_string(&[
            BASE64.encode(witness.before_cex_assets_commitment),
            BASE64.encode(witness.after_cex_assets_commitment),
        ])?;
        let roots = serde_json::to_string(&[
            BASE64.encode(witness.before_account_tree_root),
            BASE64.encode(witness.after_account_tree_root),
        ])?;
        let batch_commitment_b64 = BASE64.encode(witness.batch_commitment);

        let started = std::time::Instant::now();
        tracing::info!("generating proof for batch {}", height);

        let circuit_witness = BatchCreateUserCircuitWitness::from_batch_witness(&witness)?;
        let assets_count = circuit_witness.assets_count();
        self.load_snark_params_once(assets_count)?;
        let params = self.params.as_ref().expect("loaded above");

        // 증명 생성/검증은 CPU 바운드, 런타임 워커를 양보
        let public_input = fr_from_bytes(&witness.batch_commitment);
        let proof = tokio::task::block_in_place(|| {
            let assignment = circuit_witness.full_assignment();
            // deterministic blinding per batch keeps reruns reproducible
            let mut rng = StdRng::seed_from_u64(height as u64);
            let proof = params.prove(&assignment, &mut rng)?;
            match params.verify(&proof, public_input)? {
                true => Ok(proof),
                false => Err(PorError::CryptoFailure(format!(
                    "locally generated proof for batch {} does not verify",
                    height
                ))),
            }
        })?;
        tracing::info!(
            "proof for batch {} generated and verified in {} ms",
            height,
            started.elapsed().as_millis()
        );

        // 이미 다른 워커가 기록했다면 멱등 성공으로 처리
        if self.db.proof_by_batch_number(height).await?.is_some() {
            tracing::info!("proof for batch {} already exists", height);
            self.db
                .update_witness_status(height, BatchStatus::Finished)
                .await?;
            return Ok(());
        }

        let row = ProofRecord {
            proof_info: BASE64.encode(proof_to_bytes(&proof)?),
            cex_asset_list_commitments: commitments,
            account_tree_roots: roots,
            batch_commitment: batch_commitment_b64,
            assets_count: assets_count as i64,
            batch_number: height,
        };
        if !self.db.create_proof(&row).await? {
            tracing::info!("proof for batch {} raced with another worker", height);
        }
        self.db
            .update_witness_status(height, BatchStatus::Finished)
            .await?;
        Ok(())
    }

    /// 티어가 바뀔 때만 (r1cs, pk, vk) 를 새로 스트리밍한다.
    fn load_snark_params_once(&mut self, assets_count: usize) -> Result<()> {
        if assets_count == self.current_tier && self.params.is_some() {
            return Ok(());
        }
        let index = self
            .assets_count_tiers
            .iter()
            .position(|&t| t == assets_count)
            .ok_or_else(|| {
                PorError::ConfigInvariant(format!(
                    "assets count {} has no configured parameter tier",
                    assets_count
                ))
            })?;

        // release the resident triple before streaming the next one
        self.params = None;
        let started = std::time::Instant::now();
        self.params = Some(SnarkParams::load(&self.session_names[index])?);
        self.current_tier = assets_count;
        tracing::info!(
            "snark params for {} assets loaded in {} ms",
            assets_count,
            started.elapsed().as_millis()
        );
        Ok(())
    }
}
