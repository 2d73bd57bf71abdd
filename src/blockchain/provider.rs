use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{Address, Bytes, H256, U256};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::blockchain::connection::{ConnectionManager, WsStream};
use crate::common::retry::Backoff;
use crate::config::PoolConfig;
use crate::types::{MarketEvent, PendingTx, PriceTick, ShieldError};

/// Uniswap V2 Sync(uint112,uint112) 이벤트 토픽
const SYNC_TOPIC: &str = "0x1c411e9a96e071241c2f21f7726b17ae89e3cab4c78be50e062b03a9fffbbad1";

/// 시장 데이터 공급 능력
///
/// 라이브 네트워크 구현과 합성 구현이 같은 계약을 따르므로
/// 하류 로직은 어느 쪽이 꽂혀 있는지에 의존하지 않는다
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// 무한·재시작 가능한 이벤트 스트림을 연다
    async fn subscribe(&self) -> Result<mpsc::Receiver<MarketEvent>>;

    fn name(&self) -> &'static str;
}

/// 실제 스트리밍 엔드포인트 기반 공급자
///
/// 내부적으로 연결이 끊기고 재수립되더라도 소비자는
/// 이어지는 하나의 스트림만 본다
pub struct LiveMarketProvider {
    manager: Arc<ConnectionManager>,
    pools: HashMap<String, PoolConfig>,
}

impl LiveMarketProvider {
    pub fn new(manager: Arc<ConnectionManager>, pools: &[PoolConfig]) -> Self {
        let pools = pools
            .iter()
            .map(|p| (p.address.to_lowercase(), p.clone()))
            .collect();
        Self { manager, pools }
    }

    async fn run_session(
        mut ws: WsStream,
        pools: &HashMap<String, PoolConfig>,
        sender: &mpsc::Sender<MarketEvent>,
    ) -> Result<(), ShieldError> {
        use tokio_tungstenite::tungstenite::Message;

        // 펜딩 트랜잭션(전체 바디) + 풀 Sync 로그 구독
        let sub_pending = json!({
            "jsonrpc": "2.0", "id": 1,
            "method": "eth_subscribe",
            "params": ["newPendingTransactions", true],
        });
        let addresses: Vec<String> = pools.keys().cloned().collect();
        let sub_logs = json!({
            "jsonrpc": "2.0", "id": 2,
            "method": "eth_subscribe",
            "params": ["logs", { "address": addresses, "topics": [SYNC_TOPIC] }],
        });

        for request in [sub_pending, sub_logs] {
            ws.send(Message::Text(request.to_string()))
                .await
                .map_err(|e| ShieldError::Network(e.to_string()))?;
        }

        // 응답 id -> 구독 id 매핑으로 알림 종류를 구분한다
        let mut pending_sub: Option<String> = None;
        let mut logs_sub: Option<String> = None;

        while let Some(frame) = ws.next().await {
            let frame = frame.map_err(|e| ShieldError::Network(e.to_string()))?;
            match frame {
                Message::Text(text) => {
                    let value: Value = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(e) => {
                            debug!("구독 프레임 파싱 불가: {}", e);
                            continue;
                        }
                    };

                    // 구독 수립 응답
                    if let Some(id) = value.get("id").and_then(|i| i.as_u64()) {
                        if let Some(sub) = value.get("result").and_then(|r| r.as_str()) {
                            match id {
                                1 => pending_sub = Some(sub.to_string()),
                                2 => logs_sub = Some(sub.to_string()),
                                _ => {}
                            }
                        }
                        continue;
                    }

                    let params = match value.get("params") {
                        Some(p) => p,
                        None => continue,
                    };
                    let sub_id = params.get("subscription").and_then(|s| s.as_str());
                    let result = match params.get("result") {
                        Some(r) => r,
                        None => continue,
                    };

                    let event = if sub_id.is_some() && sub_id == logs_sub.as_deref() {
                        decode_sync_log(result, pools).map(MarketEvent::Tick)
                    } else if sub_id.is_some() && sub_id == pending_sub.as_deref() {
                        decode_pending_tx(result).map(MarketEvent::PendingTx)
                    } else {
                        None
                    };

                    if let Some(event) = event {
                        if sender.send(event).await.is_err() {
                            // 소비자가 사라지면 세션 종료
                            return Ok(());
                        }
                    }
                }
                Message::Ping(data) => {
                    ws.send(Message::Pong(data))
                        .await
                        .map_err(|e| ShieldError::Network(e.to_string()))?;
                }
                Message::Close(_) => {
                    return Err(ShieldError::Network("스트림이 닫혔습니다".to_string()));
                }
                _ => {}
            }
        }

        Err(ShieldError::Network("스트림이 끊어졌습니다".to_string()))
    }
}

#[async_trait]
impl MarketDataProvider for LiveMarketProvider {
    async fn subscribe(&self) -> Result<mpsc::Receiver<MarketEvent>> {
        let (sender, receiver) = mpsc::channel(1024);
        let manager = Arc::clone(&self.manager);
        let pools = self.pools.clone();

        tokio::spawn(async move {
            let mut backoff = Backoff::new(manager.retry_policy());

            loop {
                if sender.is_closed() {
                    break;
                }

                match manager.connect_stream().await {
                    Ok(ws) => {
                        backoff.reset();
                        if let Err(e) = Self::run_session(ws, &pools, &sender).await {
                            warn!("⚠️ 구독 세션 종료: {} - 재수립합니다", e);
                        } else {
                            // 소비자 쪽에서 정상 종료
                            break;
                        }
                    }
                    Err(ShieldError::AllEndpointsDown { attempted }) => {
                        error!("❌ 전면 장애: 스트리밍 엔드포인트 {}개 모두 실패", attempted);
                        let delay = backoff.next_delay();
                        tokio::time::sleep(delay).await;
                        // 백오프 후 기존 엔드포인트 그룹을 다시 시도한다
                        manager.pool().revive_dead();
                        continue;
                    }
                    Err(e) => {
                        warn!("⚠️ 스트림 연결 실패: {}", e);
                    }
                }

                let delay = backoff.next_delay();
                debug!("🔁 {:?} 후 재연결", delay);
                tokio::time::sleep(delay).await;
            }

            info!("구독 태스크 종료");
        });

        Ok(receiver)
    }

    fn name(&self) -> &'static str {
        "live"
    }
}

fn parse_u256(value: &Value) -> Option<U256> {
    let s = value.as_str()?;
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    U256::from_str_radix(stripped, 16).ok()
}

fn parse_u64(value: &Value) -> Option<u64> {
    parse_u256(value).map(|v| v.low_u64())
}

fn parse_address(value: &Value) -> Option<Address> {
    value.as_str()?.parse().ok()
}

fn parse_h256(value: &Value) -> Option<H256> {
    value.as_str()?.parse().ok()
}

fn parse_bytes(value: &Value) -> Option<Bytes> {
    let s = value.as_str()?;
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(stripped).ok().map(Bytes::from)
}

/// 전체 바디 펜딩 트랜잭션 알림 디코드
///
/// 해시만 내려주는 노드의 알림(문자열)은 조용히 건너뛴다
pub fn decode_pending_tx(value: &Value) -> Option<PendingTx> {
    if !value.is_object() {
        return None;
    }

    let gas_price = value
        .get("gasPrice")
        .and_then(parse_u256)
        .or_else(|| value.get("maxFeePerGas").and_then(parse_u256))?;

    Some(PendingTx {
        hash: value.get("hash").and_then(parse_h256)?,
        from: value.get("from").and_then(parse_address)?,
        to: value.get("to").and_then(parse_address),
        value: value.get("value").and_then(parse_u256).unwrap_or_default(),
        gas_price,
        gas_limit: value.get("gas").and_then(parse_u256).unwrap_or_default(),
        input: value.get("input").and_then(parse_bytes).unwrap_or_default(),
        nonce: value.get("nonce").and_then(parse_u64).unwrap_or(0),
        first_seen: Utc::now(),
    })
}

/// Sync 로그에서 가격 틱 디코드
///
/// price = (reserve0 / 10^d0) / (reserve1 / 10^d1), 즉 token1 기준 호가
pub fn decode_sync_log(value: &Value, pools: &HashMap<String, PoolConfig>) -> Option<PriceTick> {
    let address = value.get("address")?.as_str()?.to_lowercase();
    let pool = pools.get(&address)?;

    let data = value.get("data")?.as_str()?;
    let data = data.strip_prefix("0x").unwrap_or(data);
    if data.len() < 128 {
        return None;
    }

    let reserve0 = U256::from_str_radix(&data[0..64], 16).ok()?;
    let reserve1 = U256::from_str_radix(&data[64..128], 16).ok()?;
    if reserve0.is_zero() || reserve1.is_zero() {
        return None;
    }

    let adjusted0 = reserve0.as_u128() as f64 / 10f64.powi(pool.decimals0 as i32);
    let adjusted1 = reserve1.as_u128() as f64 / 10f64.powi(pool.decimals1 as i32);
    let price = adjusted0 / adjusted1;

    let sequence = value.get("blockNumber").and_then(parse_u64).unwrap_or(0);

    Some(PriceTick {
        venue: pool.venue.clone(),
        pair: pool.pair.clone(),
        price,
        sequence,
        received_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_map() -> HashMap<String, PoolConfig> {
        let pool = PoolConfig {
            address: "0xB4e16d0168e52d35CaCD2c6185b44281Ec28C9Dc".to_string(),
            venue: "uniswap_v2".to_string(),
            pair: "WETH/USDC".to_string(),
            decimals0: 6,
            decimals1: 18,
        };
        let mut map = HashMap::new();
        map.insert(pool.address.to_lowercase(), pool);
        map
    }

    #[test]
    fn test_decode_sync_log_price() {
        // reserve0 = 3000 * 10^6 (USDC), reserve1 = 1 * 10^18 (WETH) -> 3000.0
        let reserve0 = format!("{:064x}", 3_000_000_000u64);
        let reserve1 = format!("{:064x}", 1_000_000_000_000_000_000u64);
        let log = json!({
            "address": "0xb4e16d0168e52d35cacd2c6185b44281ec28c9dc",
            "data": format!("0x{}{}", reserve0, reserve1),
            "blockNumber": "0x112a880",
        });

        let tick = decode_sync_log(&log, &pool_map()).expect("디코드 실패");
        assert_eq!(tick.pair, "WETH/USDC");
        assert_eq!(tick.venue, "uniswap_v2");
        assert!((tick.price - 3000.0).abs() < 1e-6);
        assert_eq!(tick.sequence, 0x112a880);
    }

    #[test]
    fn test_decode_sync_log_unknown_pool() {
        let log = json!({
            "address": "0x0000000000000000000000000000000000000001",
            "data": format!("0x{}{}", "0".repeat(64), "0".repeat(64)),
        });
        assert!(decode_sync_log(&log, &pool_map()).is_none());
    }

    #[test]
    fn test_decode_pending_tx_full_body() {
        let tx = json!({
            "hash": "0x2f1c5c2b44f771e942a8506148e256f94f1a464babc938ae0690c6e34cd79190",
            "from": "0x7a250d5630b4cf539739df2c5dacb4c659f2488d",
            "to": "0xe592427a0aece92de3edee1f18e0157c05861564",
            "value": "0xde0b6b3a7640000",
            "gasPrice": "0x12a05f200",
            "gas": "0x5208",
            "input": "0x38ed1739",
            "nonce": "0x2a",
        });

        let decoded = decode_pending_tx(&tx).expect("디코드 실패");
        assert_eq!(decoded.nonce, 42);
        assert_eq!(decoded.gas_price, U256::from(5_000_000_000u64));
        assert_eq!(decoded.method_selector(), Some([0x38, 0xed, 0x17, 0x39]));
    }

    #[test]
    fn test_decode_pending_tx_hash_only_skipped() {
        let hash_only = json!("0x2f1c5c2b44f771e942a8506148e256f94f1a464babc938ae0690c6e34cd79190");
        assert!(decode_pending_tx(&hash_only).is_none());
    }
}
