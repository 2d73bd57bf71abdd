use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use ethers::types::{H256, U256};
use serde_json::json;
use tracing::debug;

use crate::blockchain::ConnectionManager;
use crate::constants::DEFAULT_PRIORITY_FEE_WEI;
use crate::types::{PairId, ShieldError, ShieldResult};

/// 네트워크 수수료 관측치
#[derive(Debug, Clone)]
pub struct FeeObservation {
    /// EIP-1559 base fee. 레거시 체인은 None
    pub base_fee: Option<U256>,
    pub priority_fee: U256,
    pub gas_price: U256,
}

/// 네트워크 수수료 상태 공급 능력 (라이브/합성 교체 가능)
#[async_trait]
pub trait NetworkStateProvider: Send + Sync {
    async fn fetch_fees(&self, chain_id: u64) -> ShieldResult<FeeObservation>;
}

/// JSON-RPC 기반 라이브 수수료 조회
pub struct LiveNetworkStateProvider {
    manager: Arc<ConnectionManager>,
}

impl LiveNetworkStateProvider {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    fn parse_hex_u256(value: &serde_json::Value) -> Option<U256> {
        let s = value.as_str()?;
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        U256::from_str_radix(stripped, 16).ok()
    }
}

#[async_trait]
impl NetworkStateProvider for LiveNetworkStateProvider {
    async fn fetch_fees(&self, _chain_id: u64) -> ShieldResult<FeeObservation> {
        let block = self
            .manager
            .rpc_call("eth_getBlockByNumber", json!(["latest", false]))
            .await?;
        let base_fee = block.get("baseFeePerGas").and_then(Self::parse_hex_u256);

        let gas_price = self
            .manager
            .rpc_call("eth_gasPrice", json!([]))
            .await
            .ok()
            .as_ref()
            .and_then(Self::parse_hex_u256)
            .ok_or_else(|| ShieldError::Network("가스 가격 조회 실패".to_string()))?;

        // 일부 노드는 미지원이므로 실패하면 기본값을 쓴다
        let priority_fee = self
            .manager
            .rpc_call("eth_maxPriorityFeePerGas", json!([]))
            .await
            .ok()
            .as_ref()
            .and_then(Self::parse_hex_u256)
            .unwrap_or_else(|| U256::from(DEFAULT_PRIORITY_FEE_WEI));

        debug!(
            "⛽ 수수료 관측: base={:?} priority={} gas={}",
            base_fee, priority_fee, gas_price
        );

        Ok(FeeObservation { base_fee, priority_fee, gas_price })
    }
}

/// 페어별 경쟁 펜딩 트랜잭션 추적기
///
/// 멤풀 피드가 기록하고 Risk Engine이 스냅샷으로 읽는다.
/// 오래된 관측치는 스윕에서 만료된다
pub struct CompetitionTracker {
    window_secs: i64,
    pending: DashMap<PairId, Vec<(H256, DateTime<Utc>)>>,
}

impl CompetitionTracker {
    pub fn new(window_secs: i64) -> Self {
        Self { window_secs, pending: DashMap::new() }
    }

    pub fn record(&self, pair: &str, hash: H256) {
        let mut entry = self.pending.entry(pair.to_string()).or_default();
        if !entry.iter().any(|(h, _)| *h == hash) {
            entry.push((hash, Utc::now()));
        }
    }

    /// 블록에 포함된 트랜잭션은 더 이상 경쟁자가 아니다
    pub fn mark_included(&self, hash: H256) {
        for mut entry in self.pending.iter_mut() {
            entry.retain(|(h, _)| *h != hash);
        }
    }

    pub fn count(&self, pair: &str) -> usize {
        self.pending.get(pair).map(|v| v.len()).unwrap_or(0)
    }

    pub fn counts(&self) -> std::collections::HashMap<PairId, usize> {
        self.pending
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect()
    }

    /// 관측 윈도우를 벗어난 항목 제거
    pub fn sweep(&self) {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.window_secs);
        for mut entry in self.pending.iter_mut() {
            entry.retain(|(_, at)| *at > cutoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> H256 {
        H256::from_low_u64_be(n as u64)
    }

    #[test]
    fn test_tracker_counts_and_dedup() {
        let tracker = CompetitionTracker::new(60);
        tracker.record("WETH/USDC", hash(1));
        tracker.record("WETH/USDC", hash(2));
        tracker.record("WETH/USDC", hash(2));

        assert_eq!(tracker.count("WETH/USDC"), 2);
        assert_eq!(tracker.count("WBTC/USDC"), 0);
    }

    #[test]
    fn test_inclusion_clears_pending() {
        let tracker = CompetitionTracker::new(60);
        tracker.record("WETH/USDC", hash(1));
        tracker.record("WETH/USDC", hash(2));

        tracker.mark_included(hash(1));
        assert_eq!(tracker.count("WETH/USDC"), 1);
    }

    #[test]
    fn test_sweep_expires_old_entries() {
        let tracker = CompetitionTracker::new(0);
        tracker.record("WETH/USDC", hash(1));
        // 윈도우 0초면 즉시 만료 대상이다
        std::thread::sleep(std::time::Duration::from_millis(10));
        tracker.sweep();
        assert_eq!(tracker.count("WETH/USDC"), 0);
    }
}
