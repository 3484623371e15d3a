//! 견증 빌더 엔트리포인트
//!
//! 사용자 CSV 를 파싱해 계정 트리를 갱신하며 배치 견증 행을 생성한다.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zkpor::config::{get_mysql_source, Config};
use zkpor::parser::parse_user_dataset;
use zkpor::tree::open_account_tree;
use zkpor::{Database, WitnessService};

#[derive(Parser)]
#[command(name = "witness", about = "build batch witnesses from user csv files")]
struct Args {
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

    // 1. 사용자 데이터 파싱 (검증 실패 행이 있으면 여기서 중단)
    let started = std::time::Instant::now();
    let (accounts, cex_assets) = parse_user_dataset(std::path::Path::new(&config.user_data_file))?;
    tracing::info!("user data parsed in {} ms", started.elapsed().as_millis());
    for (tier, group) in &accounts {
        tracing::info!("tier {}: {} accounts", tier, group.len());
    }

    // 2. 계정 트리 오픈
    let mut account_tree = open_account_tree(&config.tree_db)?;
    tracing::info!(
        "account tree version {} root {}",
        account_tree.latest_version(),
        hex::encode(account_tree.root()?)
    );

    // 3. 서비스 실행
    let db = Database::connect(&config.mysql_data_source, &config.db_suffix).await?;
    let service = WitnessService::new(db, account_tree, accounts, cex_assets, config);
    service.run().await?;
    tracing::info!("witness service run finished");
    Ok(())
}
