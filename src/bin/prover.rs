//! 증명 워커 엔트리포인트
//!
//! 큐에서 배치를 받아 Groth16 증명을 생성한다. 큐가 비고 Published 행이
//! 없으면 0 으로 종료한다.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zkpor::config::{get_mysql_source, Config};
use zkpor::{Database, ProverService};

#[derive(Parser)]
#[command(name = "prover", about = "generate groth16 proofs for batch witnesses")]
struct Args {
    /// secret 항목 이름: DB 비밀번호를 환경에서 가져와 DSN 에 끼움
    #[arg(long)]
    remote_password_config: Option<String>,

    /// 큐 대신 가장 오래된 Received(없으면 Published) 배치를 재처리
    #[arg(long)]
    rerun: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zkpor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::from_file("config/config.json")?;
    if let Some(secret_id) = &args.remote_password_config {
        config.mysql_data_source = get_mysql_source(&config.mysql_data_source, secret_id)?;
    }

    let db = Database::connect(&config.mysql_data_source, &config.db_suffix).await?;
    let mut service = ProverService::new(db, &config)?;
    service.run(args.rerun).await
}
