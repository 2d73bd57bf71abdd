use std::sync::Arc;

use anyhow::Result;
use clap::{Arg, Command};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use arbshield::config::Config;
use arbshield::core::ShieldCore;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("arbshield")
        .version("0.1.0")
        .author("ArbShield Team <team@arbshield.dev>")
        .about("🛡️ 온체인 아비트래지 에이전트의 회복탄력/MEV 보호 계층")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("설정 파일 경로")
                .default_value("config/default.toml"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("로그 레벨 (trace, debug, info, warn, error)")
                .default_value("info"),
        )
        .arg(
            Arg::new("synthetic")
                .long("synthetic")
                .help("합성 시장 모드 (외부 네트워크 없이 동작)")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("decoys")
                .long("decoys")
                .help("교란 트랜잭션 생성 활성화")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    // 로깅 초기화
    let log_level = matches.get_one::<String>("log-level").map(String::as_str).unwrap_or("info");
    let log_filter = match log_level {
        "trace" | "debug" | "info" | "warn" | "error" => log_level,
        _ => "info",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    print_banner();

    // 환경 변수 로드 (.env)
    dotenvy::dotenv().ok();

    let synthetic = matches.get_flag("synthetic")
        || arbshield::mocks::is_synthetic_mode();

    // 설정 로드
    let config_path = matches.get_one::<String>("config").map(String::as_str).unwrap_or("config/default.toml");
    info!("📋 설정 파일 로드 중: {}", config_path);
    let mut config = match Config::load(config_path).await {
        Ok(config) => config,
        Err(e) if synthetic => {
            warn!("⚠️ 설정 파일 없음 ({}), 합성 모드 기본 설정 사용", e);
            Config::default()
        }
        Err(e) => return Err(e),
    };

    if matches.get_flag("decoys") {
        info!("🎭 교란 트랜잭션 생성 활성화");
        config.profiler.decoy.enabled = true;
    }
    if synthetic {
        warn!("🧪 합성 시장 모드 - 실제 네트워크에 아무것도 제출하지 않습니다");
    }

    let config = Arc::new(config);
    let core = Arc::new(ShieldCore::new(Arc::clone(&config), synthetic, None)?);

    core.start().await?;

    if config.api.enabled {
        let api_core = Arc::clone(&core);
        let bind = config.api.bind.clone();
        tokio::spawn(async move {
            if let Err(e) = arbshield::api::serve(&bind, api_core).await {
                warn!("⚠️ 상태 API 종료: {}", e);
            }
        });
    }

    // 종료 신호 대기
    signal::ctrl_c().await?;
    info!("종료 신호 수신");
    core.stop();

    // 진행 중 태스크가 마지막 저장을 끝낼 시간
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    info!("👋 종료 완료");

    Ok(())
}

fn print_banner() {
    println!(
        r#"
    _         _     ____  _     _      _     _
   / \   _ __| |__ / ___|| |__ (_) ___| | __| |
  / _ \ | '__| '_ \\___ \| '_ \| |/ _ \ |/ _` |
 / ___ \| |  | |_) |___) | | | | |  __/ | (_| |
/_/   \_\_|  |_.__/|____/|_| |_|_|\___|_|\__,_|

  MEV-aware resilience & protection layer v0.1.0
"#
    );
}
