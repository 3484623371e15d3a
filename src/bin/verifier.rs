//! 검증기 엔트리포인트
//!
//! 기본: 증명 CSV 내보내기 전체를 재생 검증 (config/config.json).
//! `--user`: 단일 사용자 포함 증명 검증 (config/user_config.json).

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zkpor::config::{Config, UserConfig};
use zkpor::services::verifier;

#[derive(Parser)]
#[command(name = "verifier", about = "verify the proof chain or one user inclusion proof")]
struct Args {
    /// 단일 사용자 검증 모드
    #[arg(short = 'u', long)]
    user: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zkpor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    if args.user {
        let user_config = UserConfig::from_file("config/user_config.json")?;
        verifier::run_user(&user_config)?;
    } else {
        let config = Config::from_file("config/config.json")?;
        verifier::run_batch(&config)?;
    }
    Ok(())
}
