use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::core::{ShieldCore, ShieldStatus};

async fn get_health() -> &'static str {
    "ok"
}

async fn get_status(State(core): State<Arc<ShieldCore>>) -> Json<ShieldStatus> {
    Json(core.status())
}

/// 상태 조회 API
///
/// 엔드포인트 건강, 추적 프로파일 수, 최신 스냅샷 등
/// 운영 확인용 읽기 전용 표면만 제공한다
pub async fn serve(bind: &str, core: Arc<ShieldCore>) -> Result<()> {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    let app = Router::new()
        .route("/health", get(get_health))
        .route("/status", get(get_status))
        .layer(cors)
        .with_state(core);

    let addr: SocketAddr = bind.parse().with_context(|| format!("잘못된 바인드 주소: {}", bind))?;
    info!("🌐 상태 API 시작: http://{}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .context("상태 API 서버 종료")?;

    Ok(())
}
