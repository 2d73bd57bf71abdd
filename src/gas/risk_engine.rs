use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use ethers::types::U256;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::common::formatting::{format_gwei, gwei_to_wei};
use crate::config::{NetworkConfig, RiskConfig};
use crate::constants::{COMPETITION_HIGH_THRESHOLD, COMPETITION_MEDIUM_THRESHOLD};
use crate::gas::network_state::{CompetitionTracker, NetworkStateProvider};
use crate::types::{
    CongestionLevel, NetworkState, RiskAssessment, RiskLevel, ShieldError, ShieldResult,
    SubmissionChannel,
};

/// 가스/MEV 위험 엔진
///
/// 멤풀 경쟁과 수수료 시장 혼잡 두 신호를 독립적으로 평가하고
/// 더 심각한 쪽을 취해 채널과 수수료를 추천한다
pub struct RiskEngine {
    config: RiskConfig,
    networks: Vec<NetworkConfig>,
    provider: Arc<dyn NetworkStateProvider>,
    tracker: Arc<CompetitionTracker>,
    /// 체인별 상태 캐시 (짧은 TTL)
    states: DashMap<u64, NetworkState>,
    /// 체인별 base fee 롤링 베이스라인 (gwei)
    baselines: DashMap<u64, VecDeque<f64>>,
    /// 체인별 네이티브 토큰 USD 가격 (스냅샷으로 갱신)
    native_usd: DashMap<u64, f64>,
}

impl RiskEngine {
    pub fn new(
        config: RiskConfig,
        networks: Vec<NetworkConfig>,
        provider: Arc<dyn NetworkStateProvider>,
        tracker: Arc<CompetitionTracker>,
    ) -> Self {
        let native_usd = DashMap::new();
        for network in &networks {
            native_usd.insert(network.chain_id, network.native_usd_price);
        }
        Self {
            config,
            networks,
            provider,
            tracker,
            states: DashMap::new(),
            baselines: DashMap::new(),
            native_usd,
        }
    }

    pub fn tracker(&self) -> Arc<CompetitionTracker> {
        Arc::clone(&self.tracker)
    }

    fn network(&self, chain_id: u64) -> ShieldResult<&NetworkConfig> {
        self.networks
            .iter()
            .find(|n| n.chain_id == chain_id)
            .ok_or_else(|| ShieldError::Config(format!("미설정 네트워크: {}", chain_id)))
    }

    /// 검증된 스냅샷에서 네이티브 토큰 시세를 받아들인다
    pub fn update_native_price(&self, chain_id: u64, usd: f64) {
        if usd.is_finite() && usd > 0.0 {
            self.native_usd.insert(chain_id, usd);
        }
    }

    /// 캐시된 상태를 읽거나 TTL이 지났으면 새로 가져온다
    pub async fn current_state(&self, chain_id: u64) -> ShieldResult<NetworkState> {
        if let Some(cached) = self.states.get(&chain_id) {
            let age = (Utc::now() - cached.fetched_at).num_seconds().max(0) as u64;
            if age < self.config.state_ttl_secs {
                return Ok(cached.clone());
            }
        }
        self.refresh(chain_id).await
    }

    /// TTL과 무관하게 강제로 갱신한다
    pub async fn refresh(&self, chain_id: u64) -> ShieldResult<NetworkState> {
        let fees = self.provider.fetch_fees(chain_id).await?;

        // 혼잡도는 현재 유효 수수료를 롤링 베이스라인과 비교해 판단한다
        let current_gwei =
            fees.base_fee.unwrap_or(fees.gas_price).as_u128() as f64 / 1e9;
        let congestion = {
            let mut baseline = self.baselines.entry(chain_id).or_default();
            let level = bucket_congestion(&self.config, &baseline, current_gwei);
            baseline.push_back(current_gwei);
            while baseline.len() > self.config.baseline_window {
                baseline.pop_front();
            }
            level
        };

        let state = NetworkState {
            chain_id,
            base_fee: fees.base_fee,
            priority_fee: fees.priority_fee,
            gas_price: fees.gas_price,
            pending_by_pair: self.tracker.counts(),
            congestion,
            fetched_at: Utc::now(),
        };

        debug!(
            "🌐 네트워크 상태 갱신: chain={} base={:?} congestion={:?}",
            chain_id, state.base_fee, state.congestion
        );

        self.states.insert(chain_id, state.clone());
        Ok(state)
    }

    /// 제출 요청 하나에 대한 위험 평가
    pub async fn assess(
        &self,
        chain_id: u64,
        pair: &str,
        expected_profit_usd: Decimal,
    ) -> ShieldResult<RiskAssessment> {
        let network = self.network(chain_id)?.clone();
        let state = self.current_state(chain_id).await?;

        // 신호 1: 같은 페어를 노리는 멤풀 경쟁
        let competing = state.pending_for(pair);
        let competition_level = bucket_competition(competing);

        // 신호 2: 수수료 시장 혼잡
        let congestion_level = match state.congestion {
            CongestionLevel::Low => RiskLevel::Low,
            CongestionLevel::Medium => RiskLevel::Medium,
            CongestionLevel::High => RiskLevel::High,
        };

        let level = competition_level.more_severe(congestion_level);
        let multiplier = self.multiplier_for(level);

        let uses_eip1559 = state.supports_eip1559();
        let (mut max_fee, priority_fee, mut gas_price) = if let Some(base_fee) = state.base_fee {
            let priority = scale_fee(state.priority_fee, multiplier);
            let buffered_base = scale_fee(base_fee, self.config.base_fee_buffer);
            (buffered_base + priority, priority, state.gas_price)
        } else {
            let scaled = scale_fee(state.gas_price, multiplier);
            (scaled, U256::zero(), scaled)
        };

        // 상한 초과는 조용히 넘기지 않고 보고 후 잘라낸다
        let ceiling = gwei_to_wei(network.fee_ceiling_gwei);
        let effective = if uses_eip1559 { max_fee } else { gas_price };
        let ceiling_clamped = effective > ceiling;
        if ceiling_clamped {
            warn!(
                "⚠️ 수수료 상한 초과: 추천 {} > 상한 {} (chain={} pair={})",
                format_gwei(effective),
                format_gwei(ceiling),
                chain_id,
                pair
            );
            if uses_eip1559 {
                max_fee = ceiling;
            } else {
                gas_price = ceiling;
            }
        }

        // 수익성 게이트: 전형적 가스 사용량 기준 수수료 비용을 뺀다
        let effective = if uses_eip1559 { max_fee } else { gas_price };
        let native_usd = self
            .native_usd
            .get(&chain_id)
            .map(|p| *p)
            .unwrap_or(network.native_usd_price);
        let fee_native =
            (effective.as_u128() as f64 * network.typical_gas_units as f64) / 1e18;
        let estimated_fee_usd =
            Decimal::from_f64(fee_native * native_usd).unwrap_or_default();
        let is_profitable = expected_profit_usd > estimated_fee_usd;

        if !is_profitable {
            info!(
                "💸 수익성 없음: 예상 수익 ${} vs 예상 수수료 ${} (pair={})",
                expected_profit_usd.round_dp(2),
                estimated_fee_usd.round_dp(2),
                pair
            );
        }

        Ok(RiskAssessment {
            pair: pair.to_string(),
            chain_id,
            level,
            competing_txs: competing,
            recommended_channel: channel_for(level),
            fee_multiplier: multiplier,
            max_fee,
            priority_fee,
            gas_price,
            uses_eip1559,
            ceiling_clamped,
            expected_profit_usd,
            estimated_fee_usd,
            is_profitable,
        })
    }

    fn multiplier_for(&self, level: RiskLevel) -> f64 {
        match level {
            RiskLevel::Low => self.config.low_multiplier,
            RiskLevel::Medium => self.config.medium_multiplier,
            RiskLevel::High => self.config.high_multiplier,
        }
    }
}

/// 주기적 상태 갱신 + 경쟁 추적기 스윕 루프
pub fn spawn_refresh_loop(engine: Arc<RiskEngine>, chain_ids: Vec<u64>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = std::time::Duration::from_secs(engine.config.state_ttl_secs.max(1));
        loop {
            tokio::time::sleep(interval).await;
            engine.tracker.sweep();
            for chain_id in &chain_ids {
                if let Err(e) = engine.refresh(*chain_id).await {
                    warn!("⚠️ 네트워크 상태 갱신 실패 (chain={}): {}", chain_id, e);
                }
            }
        }
    })
}

/// 멤풀 경쟁 버킷: 0-1 low, 2-4 medium, 5+ high
fn bucket_competition(pending: usize) -> RiskLevel {
    if pending >= COMPETITION_HIGH_THRESHOLD {
        RiskLevel::High
    } else if pending >= COMPETITION_MEDIUM_THRESHOLD {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// 베이스라인 대비 비율로 혼잡도를 버킷팅한다
fn bucket_congestion(config: &RiskConfig, baseline: &VecDeque<f64>, current_gwei: f64) -> CongestionLevel {
    if baseline.is_empty() {
        return CongestionLevel::Low;
    }
    let mean = baseline.iter().sum::<f64>() / baseline.len() as f64;
    if mean <= 0.0 {
        return CongestionLevel::Low;
    }
    let ratio = current_gwei / mean;
    if ratio >= config.congestion_high_ratio {
        CongestionLevel::High
    } else if ratio >= config.congestion_medium_ratio {
        CongestionLevel::Medium
    } else {
        CongestionLevel::Low
    }
}

fn channel_for(level: RiskLevel) -> SubmissionChannel {
    match level {
        RiskLevel::Low => SubmissionChannel::Normal,
        RiskLevel::Medium => SubmissionChannel::Private,
        RiskLevel::High => SubmissionChannel::Bundle,
    }
}

fn scale_fee(fee: U256, multiplier: f64) -> U256 {
    U256::from((fee.as_u128() as f64 * multiplier) as u128)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::mocks::MockNetworkStateProvider;
    use ethers::types::H256;

    const GWEI: u64 = 1_000_000_000;

    fn engine_with(provider: Arc<MockNetworkStateProvider>) -> Arc<RiskEngine> {
        let config = Config::default();
        Arc::new(RiskEngine::new(
            config.risk,
            config.networks,
            provider,
            Arc::new(CompetitionTracker::new(60)),
        ))
    }

    #[tokio::test]
    async fn test_heavy_competition_routes_to_bundle() {
        // base fee 50 gwei, 같은 페어 펜딩 6건이면 high/bundle
        let provider = Arc::new(MockNetworkStateProvider::eip1559(50 * GWEI, 2 * GWEI));
        let engine = engine_with(provider);
        for n in 0..6 {
            engine.tracker().record("WETH/USDC", H256::from_low_u64_be(n));
        }

        let assessment = engine
            .assess(1, "WETH/USDC", Decimal::from(1000))
            .await
            .expect("assess");

        assert_eq!(assessment.level, RiskLevel::High);
        assert_eq!(assessment.recommended_channel, SubmissionChannel::Bundle);
        assert_eq!(assessment.competing_txs, 6);
        assert!((assessment.fee_multiplier - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fee_recommendation_eip1559() {
        let provider = Arc::new(MockNetworkStateProvider::eip1559(50 * GWEI, 2 * GWEI));
        let engine = engine_with(provider);

        let assessment = engine
            .assess(1, "WETH/USDC", Decimal::from(1000))
            .await
            .expect("assess");

        // low 위험: priority 2 gwei * 1.0, max = 50 * 1.2 + 2 = 62 gwei
        assert_eq!(assessment.level, RiskLevel::Low);
        assert_eq!(assessment.priority_fee, U256::from(2 * GWEI));
        assert_eq!(assessment.max_fee, U256::from(62 * GWEI));
        assert!(assessment.uses_eip1559);
        assert!(!assessment.ceiling_clamped);
    }

    #[tokio::test]
    async fn test_legacy_fee_recommendation() {
        let provider = Arc::new(MockNetworkStateProvider::legacy(30 * GWEI));
        let engine = engine_with(provider);
        for n in 0..3 {
            engine.tracker().record("WETH/USDC", H256::from_low_u64_be(n));
        }

        let assessment = engine
            .assess(1, "WETH/USDC", Decimal::from(1000))
            .await
            .expect("assess");

        // medium 위험: 30 gwei * 1.3 = 39 gwei
        assert_eq!(assessment.level, RiskLevel::Medium);
        assert!(!assessment.uses_eip1559);
        assert_eq!(assessment.gas_price, U256::from(39 * GWEI));
        assert_eq!(assessment.recommended_channel, SubmissionChannel::Private);
    }

    #[tokio::test]
    async fn test_ceiling_clamped_and_reported() {
        // 상한 300 gwei를 아득히 넘는 base fee
        let provider = Arc::new(MockNetworkStateProvider::eip1559(400 * GWEI, 5 * GWEI));
        let engine = engine_with(provider);

        let assessment = engine
            .assess(1, "WETH/USDC", Decimal::from(100_000))
            .await
            .expect("assess");

        assert!(assessment.ceiling_clamped);
        assert_eq!(assessment.max_fee, U256::from(300 * GWEI));
    }

    #[tokio::test]
    async fn test_unprofitable_when_fee_exceeds_profit() {
        // max fee 62 gwei * 250k gas = 0.0155 ETH ~= $46.5 > $10
        let provider = Arc::new(MockNetworkStateProvider::eip1559(50 * GWEI, 2 * GWEI));
        let engine = engine_with(provider);

        let assessment = engine
            .assess(1, "WETH/USDC", Decimal::from(10))
            .await
            .expect("assess");

        assert!(!assessment.is_profitable);
        assert!(assessment.estimated_fee_usd > assessment.expected_profit_usd);
    }

    #[tokio::test]
    async fn test_profitable_when_fee_is_small() {
        // max fee 3.2 gwei * 250k = 0.0008 ETH ~= $2.4 < $10
        let provider = Arc::new(MockNetworkStateProvider::eip1559(GWEI, 2 * GWEI));
        let engine = engine_with(provider);

        let assessment = engine
            .assess(1, "WETH/USDC", Decimal::from(10))
            .await
            .expect("assess");

        assert!(assessment.is_profitable);
    }

    #[tokio::test]
    async fn test_state_cache_respects_ttl() {
        let provider = Arc::new(MockNetworkStateProvider::eip1559(50 * GWEI, 2 * GWEI));
        let engine = engine_with(Arc::clone(&provider));

        engine.current_state(1).await.expect("state");
        engine.current_state(1).await.expect("state");

        // TTL(12초) 안의 두 번째 호출은 캐시를 쓴다
        assert_eq!(provider.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_congestion_bucket_against_baseline() {
        let config = Config::default();
        let mut baseline = VecDeque::new();
        for _ in 0..16 {
            baseline.push_back(20.0);
        }

        assert_eq!(bucket_congestion(&config.risk, &baseline, 21.0), CongestionLevel::Low);
        assert_eq!(bucket_congestion(&config.risk, &baseline, 25.0), CongestionLevel::Medium);
        assert_eq!(bucket_congestion(&config.risk, &baseline, 40.0), CongestionLevel::High);
    }

    #[test]
    fn test_competition_buckets() {
        assert_eq!(bucket_competition(0), RiskLevel::Low);
        assert_eq!(bucket_competition(1), RiskLevel::Low);
        assert_eq!(bucket_competition(2), RiskLevel::Medium);
        assert_eq!(bucket_competition(4), RiskLevel::Medium);
        assert_eq!(bucket_competition(5), RiskLevel::High);
        assert_eq!(bucket_competition(12), RiskLevel::High);
    }
}
