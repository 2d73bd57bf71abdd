use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use anyhow::{Context, Result};

use crate::types::PairId;

/// 엔드포인트 프로토콜 종류
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    /// HTTP JSON-RPC
    Rpc,
    /// WebSocket 스트리밍
    Stream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    pub kind: EndpointKind,
}

/// 네트워크(체인)별 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub chain_id: u64,
    pub name: String,
    /// 우선순위 순서의 엔드포인트 목록 (primary 먼저)
    pub endpoints: Vec<EndpointConfig>,
    /// 추천 수수료 상한 (gwei)
    pub fee_ceiling_gwei: f64,
    /// 아비트래지 트랜잭션의 전형적인 가스 사용량
    #[serde(default = "default_typical_gas_units")]
    pub typical_gas_units: u64,
    /// 네이티브 토큰 USD 가격 기본값 (스냅샷으로 갱신됨)
    #[serde(default = "default_native_usd")]
    pub native_usd_price: f64,
    #[serde(default = "default_block_time")]
    pub block_time_secs: u64,
}

/// 가격 검증기 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// 페어당 롤링 이력 상한
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// 스냅샷 생성에 필요한 최소 생존 소스 수
    #[serde(default = "default_min_sources")]
    pub min_sources: usize,
    /// 외부 레퍼런스 소스 가중치 (온체인 틱은 1.0)
    #[serde(default = "default_reference_weight")]
    pub reference_weight: f64,
    /// 이 시간 동안 갱신이 없으면 정체 알림 (초)
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,
    /// 시퀀스 역전 허용 범위. 이걸 넘어 늦게 온 틱은 버린다
    #[serde(default = "default_reorder_tolerance")]
    pub reorder_tolerance: u64,
    /// 스냅샷 유효 시간 (초)
    #[serde(default = "default_snapshot_validity_secs")]
    pub snapshot_validity_secs: u64,
}

/// 가스/MEV 위험 엔진 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// NetworkState 캐시 TTL (초, 대략 1블록)
    #[serde(default = "default_state_ttl")]
    pub state_ttl_secs: u64,
    #[serde(default = "default_low_multiplier")]
    pub low_multiplier: f64,
    #[serde(default = "default_medium_multiplier")]
    pub medium_multiplier: f64,
    #[serde(default = "default_high_multiplier")]
    pub high_multiplier: f64,
    /// base fee 안전 버퍼 (1.2 = 20%)
    #[serde(default = "default_base_fee_buffer")]
    pub base_fee_buffer: f64,
    /// base fee 롤링 베이스라인 윈도우 크기
    #[serde(default = "default_baseline_window")]
    pub baseline_window: usize,
    /// 베이스라인 대비 이 비율 이상이면 혼잡 medium
    #[serde(default = "default_congestion_medium_ratio")]
    pub congestion_medium_ratio: f64,
    /// 베이스라인 대비 이 비율 이상이면 혼잡 high
    #[serde(default = "default_congestion_high_ratio")]
    pub congestion_high_ratio: f64,
}

/// 제출 라우터 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// 번들 릴레이 URL
    pub bundle_relay_url: String,
    /// 프라이빗 릴레이 URL
    pub private_relay_url: String,
    /// 이 블록 수 안에 포함되지 않으면 타임아웃
    #[serde(default = "default_confirm_blocks")]
    pub confirm_timeout_blocks: u64,
    /// 전송 계층 재시도 상한
    #[serde(default = "default_transport_attempts")]
    pub transport_max_attempts: usize,
}

/// 교란 트랜잭션 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_decoy_min")]
    pub min_count: usize,
    #[serde(default = "default_decoy_max")]
    pub max_count: usize,
    /// 제출 지연 상한 (밀리초)
    #[serde(default = "default_decoy_delay_ms")]
    pub max_delay_ms: u64,
}

/// 경쟁자 프로파일러 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilerConfig {
    /// 알려진 봇 주소 allowlist (즉시 귀속)
    #[serde(default)]
    pub known_bots: Vec<String>,
    /// 알려진 DEX 라우터 주소
    #[serde(default)]
    pub dex_routers: Vec<String>,
    /// 거래량 많은 아비트래지 핵심 페어
    #[serde(default)]
    pub hot_pairs: Vec<PairId>,
    /// 봇 판정용 가스 가격 하한 (gwei)
    #[serde(default = "default_gas_floor_gwei")]
    pub gas_floor_gwei: f64,
    /// "큰 입력 페이로드" 기준 (바이트)
    #[serde(default = "default_min_input_bytes")]
    pub min_input_bytes: usize,
    /// 프로파일 매칭 가스 허용 오차 (%)
    #[serde(default = "default_gas_tolerance_pct")]
    pub gas_tolerance_pct: f64,
    /// 시각 패턴 매칭 윈도우 (초)
    #[serde(default = "default_timing_window_secs")]
    pub timing_window_secs: u64,
    /// 이 기간 조용하면 프로파일 삭제 (일)
    #[serde(default = "default_expiry_days")]
    pub expiry_days: i64,
    /// 추적 프로파일 총량 상한
    #[serde(default = "default_max_profiles")]
    pub max_profiles: usize,
    /// 유지보수 스윕 주기 (초)
    #[serde(default = "default_maintenance_secs")]
    pub maintenance_interval_secs: u64,
    pub decoy: DecoyConfig,
}

/// 영속 저장 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_persist_secs")]
    pub persist_interval_secs: u64,
}

/// 상태 조회 API 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_api_bind")]
    pub bind: String,
}

/// 구독 대상 유동성 풀
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// 풀 컨트랙트 주소
    pub address: String,
    pub venue: String,
    pub pair: PairId,
    #[serde(default = "default_decimals")]
    pub decimals0: u32,
    #[serde(default = "default_decimals")]
    pub decimals1: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub networks: Vec<NetworkConfig>,
    /// 모니터링할 토큰 페어
    pub pairs: Vec<PairId>,
    /// 스왑 이벤트를 구독할 풀 목록
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    /// 외부 레퍼런스 가격 소스 URL 목록
    #[serde(default)]
    pub reference_sources: Vec<String>,
    pub validator: ValidatorConfig,
    pub risk: RiskConfig,
    pub router: RouterConfig,
    pub profiler: ProfilerConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    /// symbol -> address
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

impl Config {
    /// TOML 설정 파일 로드
    pub async fn load(path: &str) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("설정 파일을 읽을 수 없습니다: {}", path))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("설정 파일 파싱 실패: {}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// 치명적 설정 오류는 기동 시점에 바로 실패시킨다
    pub fn validate(&self) -> Result<()> {
        if self.networks.is_empty() {
            anyhow::bail!("네트워크가 하나도 설정되지 않았습니다");
        }
        for network in &self.networks {
            if network.endpoints.is_empty() {
                anyhow::bail!(
                    "네트워크 {} (chain_id={})에 엔드포인트가 없습니다",
                    network.name,
                    network.chain_id
                );
            }
            if network.fee_ceiling_gwei <= 0.0 {
                anyhow::bail!("네트워크 {}의 수수료 상한이 0 이하입니다", network.name);
            }
        }
        if self.pairs.is_empty() {
            anyhow::bail!("모니터링할 페어가 없습니다");
        }
        if self.validator.min_sources < 2 {
            anyhow::bail!("validator.min_sources는 2 이상이어야 합니다");
        }
        let decoy = &self.profiler.decoy;
        if decoy.min_count > decoy.max_count {
            anyhow::bail!(
                "decoy.min_count({}) > decoy.max_count({})",
                decoy.min_count,
                decoy.max_count
            );
        }
        Ok(())
    }

    pub fn network(&self, chain_id: u64) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.chain_id == chain_id)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            networks: vec![NetworkConfig {
                chain_id: 1,
                name: "mainnet".to_string(),
                endpoints: vec![
                    EndpointConfig {
                        url: "wss://eth.example.dev/ws".to_string(),
                        kind: EndpointKind::Stream,
                    },
                    EndpointConfig {
                        url: "https://eth.example.dev/rpc".to_string(),
                        kind: EndpointKind::Rpc,
                    },
                ],
                fee_ceiling_gwei: 300.0,
                typical_gas_units: default_typical_gas_units(),
                native_usd_price: default_native_usd(),
                block_time_secs: default_block_time(),
            }],
            pairs: vec!["WETH/USDC".to_string(), "WBTC/USDC".to_string()],
            pools: vec![PoolConfig {
                // Uniswap V2 WETH/USDC
                address: "0xB4e16d0168e52d35CaCD2c6185b44281Ec28C9Dc".to_string(),
                venue: "uniswap_v2".to_string(),
                pair: "WETH/USDC".to_string(),
                decimals0: 6,
                decimals1: 18,
            }],
            reference_sources: Vec::new(),
            validator: ValidatorConfig {
                history_limit: default_history_limit(),
                min_sources: default_min_sources(),
                reference_weight: default_reference_weight(),
                staleness_secs: default_staleness_secs(),
                reorder_tolerance: default_reorder_tolerance(),
                snapshot_validity_secs: default_snapshot_validity_secs(),
            },
            risk: RiskConfig {
                state_ttl_secs: default_state_ttl(),
                low_multiplier: default_low_multiplier(),
                medium_multiplier: default_medium_multiplier(),
                high_multiplier: default_high_multiplier(),
                base_fee_buffer: default_base_fee_buffer(),
                baseline_window: default_baseline_window(),
                congestion_medium_ratio: default_congestion_medium_ratio(),
                congestion_high_ratio: default_congestion_high_ratio(),
            },
            router: RouterConfig {
                bundle_relay_url: "https://relay.flashbots.net".to_string(),
                private_relay_url: "https://rpc.flashbots.net".to_string(),
                confirm_timeout_blocks: default_confirm_blocks(),
                transport_max_attempts: default_transport_attempts(),
            },
            profiler: ProfilerConfig {
                known_bots: Vec::new(),
                dex_routers: vec![
                    // Uniswap V2 / V3, SushiSwap
                    "0x7a250d5630B4cF539739dF2C5dAcb4c659F2488D".to_string(),
                    "0xE592427A0AEce92De3Edee1F18E0157C05861564".to_string(),
                    "0xd9e1cE17f2641f24aE83637ab66a2cca9C378B9F".to_string(),
                ],
                hot_pairs: vec!["WETH/USDC".to_string(), "WETH/USDT".to_string()],
                gas_floor_gwei: default_gas_floor_gwei(),
                min_input_bytes: default_min_input_bytes(),
                gas_tolerance_pct: default_gas_tolerance_pct(),
                timing_window_secs: default_timing_window_secs(),
                expiry_days: default_expiry_days(),
                max_profiles: default_max_profiles(),
                maintenance_interval_secs: default_maintenance_secs(),
                decoy: DecoyConfig {
                    enabled: false,
                    min_count: default_decoy_min(),
                    max_count: default_decoy_max(),
                    max_delay_ms: default_decoy_delay_ms(),
                },
            },
            storage: StorageConfig {
                data_dir: default_data_dir(),
                persist_interval_secs: default_persist_secs(),
            },
            api: ApiConfig { enabled: false, bind: default_api_bind() },
            tokens: HashMap::new(),
        }
    }
}

fn default_typical_gas_units() -> u64 { 250_000 }
fn default_decimals() -> u32 { 18 }
fn default_native_usd() -> f64 { 3000.0 }
fn default_block_time() -> u64 { 12 }
fn default_history_limit() -> usize { 1000 }
fn default_min_sources() -> usize { 2 }
fn default_reference_weight() -> f64 { 0.8 }
fn default_staleness_secs() -> u64 { 120 }
fn default_reorder_tolerance() -> u64 { 3 }
fn default_snapshot_validity_secs() -> u64 { 30 }
fn default_state_ttl() -> u64 { 12 }
fn default_low_multiplier() -> f64 { 1.0 }
fn default_medium_multiplier() -> f64 { 1.3 }
fn default_high_multiplier() -> f64 { 1.5 }
fn default_base_fee_buffer() -> f64 { 1.2 }
fn default_baseline_window() -> usize { 128 }
fn default_congestion_medium_ratio() -> f64 { 1.15 }
fn default_congestion_high_ratio() -> f64 { 1.5 }
fn default_confirm_blocks() -> u64 { 5 }
fn default_transport_attempts() -> usize { 3 }
fn default_decoy_min() -> usize { 1 }
fn default_decoy_max() -> usize { 3 }
fn default_decoy_delay_ms() -> u64 { 3000 }
fn default_gas_floor_gwei() -> f64 { 50.0 }
fn default_min_input_bytes() -> usize { 1024 }
fn default_gas_tolerance_pct() -> f64 { 10.0 }
fn default_timing_window_secs() -> u64 { 60 }
fn default_expiry_days() -> i64 { 7 }
fn default_max_profiles() -> usize { 500 }
fn default_maintenance_secs() -> u64 { 3600 }
fn default_data_dir() -> String { "data".to_string() }
fn default_persist_secs() -> u64 { 300 }
fn default_api_bind() -> String { "127.0.0.1:8088".to_string() }
