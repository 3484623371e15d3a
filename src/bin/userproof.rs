//! 사용자 증명 내보내기 엔트리포인트
//!
//! 완성된 계정 트리에서 계정별 포함 증명 번들을 추출한다.
//! `--memory_tree`: 메모리에서 트리를 재구성해 루트만 출력 (DB 쓰기 없음).

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zkpor::config::{get_mysql_source, Config};
use zkpor::parser::parse_user_dataset;
use zkpor::services::userproof::compute_account_root_hash;
use zkpor::tree::{open_account_tree, AccountTree, MemoryStore};
use zkpor::{Database, UserProofService};

#[derive(Parser)]
#[command(name = "userproof", about = "export per-account inclusion proof bundles")]
struct Args {
    /// 메모리 트리를 만들어 루트만 출력
    #[arg(long)]
    memory_tree: bool,

    /// secret 항목 이름: DB 비밀번호를 환경에서 가져와 DSN 에 끼움
    #[arg(long)]
    remote_password_config: Option<String>,
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

    let started = std::time::Instant::now();
    let (accounts, _) = parse_user_dataset(std::path::Path::new(&config.user_data_file))?;
    tracing::info!("user data parsed in {} ms", started.elapsed().as_millis());

    if args.memory_tree {
        let tree = AccountTree::new(Box::new(MemoryStore::new()))?;
        tokio::task::block_in_place(|| compute_account_root_hash(&accounts, tree))?;
        return Ok(());
    }

    let account_tree = open_account_tree(&config.tree_db)?;
    let db = Database::connect(&config.mysql_data_source, &config.db_suffix).await?;
    let service = UserProofService::new(db, account_tree, accounts);
    service.run().await
}
