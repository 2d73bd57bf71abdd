use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::blockchain::endpoint::EndpointPool;
use crate::common::RetryPolicy;
use crate::config::EndpointKind;
use crate::types::{ShieldError, ShieldResult};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 살아있는 연결 핸들
pub enum Connection {
    Stream { url: String, ws: Box<WsStream> },
    Http { url: String },
}

impl Connection {
    pub fn url(&self) -> &str {
        match self {
            Connection::Stream { url, .. } => url,
            Connection::Http { url } => url,
        }
    }
}

/// 연결 관리자
///
/// 우선순위 순서로 엔드포인트를 시도하고 건강 상태를 갱신한다.
/// 모든 엔드포인트가 실패하면 무한 대기 대신 전면 장애를 보고한다
pub struct ConnectionManager {
    pool: Arc<EndpointPool>,
    policy: RetryPolicy,
    http: reqwest::Client,
    connect_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(pool: Arc<EndpointPool>, policy: RetryPolicy) -> Self {
        Self {
            pool,
            policy,
            http: reqwest::Client::new(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn pool(&self) -> Arc<EndpointPool> {
        Arc::clone(&self.pool)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.policy.clone()
    }

    /// 순서대로 엔드포인트를 시도해 첫 성공 연결을 돌려준다
    pub async fn connect(&self) -> ShieldResult<Connection> {
        self.connect_kind(None).await
    }

    /// 스트리밍 엔드포인트만 대상으로 연결한다
    pub async fn connect_stream(&self) -> ShieldResult<WsStream> {
        match self.connect_kind(Some(EndpointKind::Stream)).await? {
            Connection::Stream { ws, .. } => Ok(*ws),
            // candidates(Stream) 필터 때문에 도달하지 않는다
            Connection::Http { url } => Err(ShieldError::Network(format!(
                "스트리밍 연결이 필요하지만 {}는 RPC 엔드포인트입니다",
                url
            ))),
        }
    }

    async fn connect_kind(&self, kind: Option<EndpointKind>) -> ShieldResult<Connection> {
        let candidates = self.pool.candidates(kind);
        let attempted = if candidates.is_empty() { self.pool.len() } else { candidates.len() };

        for endpoint in candidates {
            debug!("🔌 엔드포인트 시도: {}", endpoint.url);
            match self.try_endpoint(&endpoint.url, endpoint.kind).await {
                Ok(conn) => {
                    self.pool.record_success(&endpoint.url);
                    info!("✅ 엔드포인트 연결 성공: {}", endpoint.url);
                    return Ok(conn);
                }
                Err(e) => {
                    warn!("⚠️ 엔드포인트 연결 실패: {} - {}", endpoint.url, e);
                    self.pool.record_failure(&endpoint.url);
                }
            }
        }

        error!("❌ 전면 장애: 엔드포인트 {}개 모두 실패", attempted);
        Err(ShieldError::AllEndpointsDown { attempted })
    }

    async fn try_endpoint(&self, url: &str, kind: EndpointKind) -> ShieldResult<Connection> {
        match kind {
            EndpointKind::Stream => {
                let connected = tokio::time::timeout(self.connect_timeout, connect_async(url))
                    .await
                    .map_err(|_| ShieldError::Network(format!("연결 타임아웃: {}", url)))?
                    .map_err(|e| ShieldError::Network(e.to_string()))?;
                let (ws, _) = connected;
                Ok(Connection::Stream { url: url.to_string(), ws: Box::new(ws) })
            }
            EndpointKind::Rpc => {
                // 가벼운 호출로 엔드포인트 생존 확인
                self.raw_call(url, "eth_blockNumber", json!([])).await?;
                Ok(Connection::Http { url: url.to_string() })
            }
        }
    }

    /// RPC 엔드포인트 페일오버를 내장한 JSON-RPC 호출
    pub async fn rpc_call(&self, method: &str, params: Value) -> ShieldResult<Value> {
        let candidates = self.pool.candidates(Some(EndpointKind::Rpc));
        let attempted = if candidates.is_empty() { self.pool.len() } else { candidates.len() };

        for endpoint in candidates {
            match self.raw_call(&endpoint.url, method, params.clone()).await {
                Ok(result) => {
                    self.pool.record_success(&endpoint.url);
                    return Ok(result);
                }
                Err(ShieldError::Network(msg)) if msg.starts_with("rpc error") => {
                    // 엔드포인트는 살아있고 호출 자체가 거절된 경우
                    self.pool.record_success(&endpoint.url);
                    return Err(ShieldError::Network(msg));
                }
                Err(e) => {
                    warn!("⚠️ RPC 호출 실패: {} {} - {}", endpoint.url, method, e);
                    self.pool.record_failure(&endpoint.url);
                }
            }
        }

        Err(ShieldError::AllEndpointsDown { attempted })
    }

    async fn raw_call(&self, url: &str, method: &str, params: Value) -> ShieldResult<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(url)
            .timeout(self.connect_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| ShieldError::Network(e.to_string()))?;

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ShieldError::Network(e.to_string()))?;

        if let Some(err) = payload.get("error") {
            return Err(ShieldError::Network(format!("rpc error: {}", err)));
        }

        payload
            .get("result")
            .cloned()
            .ok_or_else(|| ShieldError::Network("rpc 응답에 result가 없습니다".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, EndpointConfig};
    use crate::constants::ENDPOINT_DEAD_AFTER_FAILURES;

    fn unreachable_manager() -> ConnectionManager {
        let mut network = Config::default().networks[0].clone();
        // 포트 9 (discard)는 로컬에서 즉시 거절된다
        network.endpoints = vec![
            EndpointConfig { url: "http://127.0.0.1:9/a".to_string(), kind: EndpointKind::Rpc },
            EndpointConfig { url: "http://127.0.0.1:9/b".to_string(), kind: EndpointKind::Rpc },
            EndpointConfig { url: "http://127.0.0.1:9/c".to_string(), kind: EndpointKind::Rpc },
        ];
        let pool = Arc::new(EndpointPool::from_network(&network));
        ConnectionManager::new(pool, RetryPolicy::new(3))
    }

    #[tokio::test]
    async fn test_all_endpoints_down_no_hang() {
        let manager = unreachable_manager();

        // 전 엔드포인트 3회씩 실패시키면 모두 dead가 된다
        for _ in 0..ENDPOINT_DEAD_AFTER_FAILURES {
            let result = tokio::time::timeout(Duration::from_secs(60), manager.connect()).await;
            let result = result.expect("connect가 무한 대기해서는 안 된다");
            match result {
                Err(ShieldError::AllEndpointsDown { attempted }) => assert!(attempted >= 1),
                other => panic!("AllEndpointsDown 기대, 실제: {:?}", other.map(|c| c.url().to_string())),
            }
        }

        assert!(!manager.pool().has_alive());

        // 후보가 없어도 즉시 전면 장애를 보고한다
        match manager.connect().await {
            Err(ShieldError::AllEndpointsDown { attempted }) => assert_eq!(attempted, 3),
            other => panic!("AllEndpointsDown 기대, 실제: {:?}", other.map(|c| c.url().to_string())),
        }
    }

    #[tokio::test]
    async fn test_rpc_call_reports_outage() {
        let manager = unreachable_manager();
        let result = manager.rpc_call("eth_gasPrice", json!([])).await;
        assert!(matches!(result, Err(ShieldError::AllEndpointsDown { .. })));
    }
}
