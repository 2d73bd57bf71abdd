use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use rust_decimal::Decimal;
use ethers::types::{Address, Bytes, H256, U256};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// 토큰 페어 식별자 ("WETH/USDC" 형식)
pub type PairId = String;

/// 온체인 스왑 이벤트에서 파생된 원시 가격 틱
///
/// Event Subscriber가 생성하고 Validator가 한 번 소비하는 불변 레코드
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceTick {
    pub venue: String,
    pub pair: PairId,
    pub price: f64,
    /// 블록 번호 또는 스트림 시퀀스 번호
    pub sequence: u64,
    pub received_at: DateTime<Utc>,
}

/// 검증된 가격 스냅샷
///
/// 페어당 "현재" 스냅샷은 항상 하나뿐이며 수정 대신 교체된다
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceSnapshot {
    pub pair: PairId,
    pub price: f64,
    /// 집계에 살아남은 소스 수 (온체인 틱 + 외부 레퍼런스)
    pub source_count: usize,
    /// 기여 소스들의 모표준편차
    pub std_dev: f64,
    /// 롤링 윈도우 로그수익률의 표준편차
    pub volatility: f64,
    pub sequence: u64,
    pub valid_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// 스냅샷 정체 알림
///
/// 틱 간격이 자연히 긴 것과 구분되는 명시적 무갱신 신호
#[derive(Debug, Clone, PartialEq)]
pub struct StalenessAlert {
    pub pair: PairId,
    pub last_update: DateTime<Utc>,
    pub silent_for_secs: u64,
}

/// 네트워크 혼잡도
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CongestionLevel {
    Low,
    Medium,
    High,
}

/// 네트워크 수수료/혼잡 상태 스냅샷
///
/// Risk Engine이 주기적으로 갱신하고 Router는 읽기만 한다
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkState {
    pub chain_id: u64,
    /// EIP-1559 base fee (wei). 레거시 체인이면 None
    pub base_fee: Option<U256>,
    /// 현재 관측된 priority fee (wei)
    pub priority_fee: U256,
    /// 레거시 단일 가스 가격 (wei)
    pub gas_price: U256,
    /// 페어별 경쟁 펜딩 트랜잭션 수
    pub pending_by_pair: HashMap<PairId, usize>,
    pub congestion: CongestionLevel,
    pub fetched_at: DateTime<Utc>,
}

impl NetworkState {
    pub fn supports_eip1559(&self) -> bool {
        self.base_fee.is_some()
    }

    pub fn pending_for(&self, pair: &str) -> usize {
        self.pending_by_pair.get(pair).copied().unwrap_or(0)
    }
}

/// 위험 수준
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    Low = 0,
    Medium = 1,
    High = 2,
}

impl RiskLevel {
    /// 두 신호 중 더 심각한 쪽을 택한다
    pub fn more_severe(self, other: RiskLevel) -> RiskLevel {
        self.max(other)
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// 제출 채널 (닫힌 집합)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SubmissionChannel {
    /// 공개 멤풀 제출
    Normal,
    /// 프라이빗 릴레이 직송
    Private,
    /// 번들 릴레이 (블록 단위 원자 포함 요청)
    Bundle,
}

impl std::fmt::Display for SubmissionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmissionChannel::Normal => write!(f, "normal"),
            SubmissionChannel::Private => write!(f, "private"),
            SubmissionChannel::Bundle => write!(f, "bundle"),
        }
    }
}

/// 제출 요청당 생성되는 위험 평가 (영속화하지 않음)
#[derive(Debug, Clone)]
pub struct RiskAssessment {
    pub pair: PairId,
    pub chain_id: u64,
    pub level: RiskLevel,
    pub competing_txs: usize,
    pub recommended_channel: SubmissionChannel,
    pub fee_multiplier: f64,
    /// EIP-1559 추천 max fee (wei)
    pub max_fee: U256,
    /// EIP-1559 추천 priority fee (wei)
    pub priority_fee: U256,
    /// 레거시 추천 가스 가격 (wei)
    pub gas_price: U256,
    pub uses_eip1559: bool,
    /// 설정된 수수료 상한에 걸려 잘렸는지 여부
    pub ceiling_clamped: bool,
    pub expected_profit_usd: Decimal,
    pub estimated_fee_usd: Decimal,
    pub is_profitable: bool,
}

/// 멤풀에서 관측된 타인 트랜잭션
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingTx {
    pub hash: H256,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub gas_price: U256,
    pub gas_limit: U256,
    pub input: Bytes,
    pub nonce: u64,
    pub first_seen: DateTime<Utc>,
}

impl PendingTx {
    /// 호출 데이터의 4바이트 함수 셀렉터
    pub fn method_selector(&self) -> Option<[u8; 4]> {
        if self.input.len() >= 4 {
            let mut sel = [0u8; 4];
            sel.copy_from_slice(&self.input[0..4]);
            Some(sel)
        } else {
            None
        }
    }
}

/// 서명 전 아웃바운드 트랜잭션
#[derive(Debug, Clone, PartialEq)]
pub struct TxRequest {
    pub chain_id: u64,
    pub pair: PairId,
    pub to: Address,
    pub value: U256,
    pub input: Bytes,
    pub gas_limit: U256,
    pub max_fee: U256,
    pub priority_fee: U256,
    pub nonce: u64,
    /// 진짜 정산 트랜잭션이 아닌 교란용 복제본인지 여부
    pub decoy: bool,
    /// 제출 전 지연 (교란용, 밀리초)
    pub submit_delay_ms: u64,
}

/// 서명된 제출 페이로드. Router는 원시 키 자료를 절대 보관하지 않는다
#[derive(Debug, Clone)]
pub struct SignedPayload {
    pub raw: Bytes,
    pub hash: H256,
    pub chain_id: u64,
    pub pair: PairId,
    pub decoy: bool,
}

/// 채널 전송 계층이 돌려주는 접수 핸들
#[derive(Debug, Clone)]
pub struct SubmissionReceipt {
    pub channel: SubmissionChannel,
    pub handle: String,
    pub submitted_at: DateTime<Utc>,
}

/// 제출 거부 사유
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RejectReason {
    /// 예상 수익이 수수료를 못 넘음 (정상적 사업 판단)
    Unprofitable,
    /// 같은 페어를 먼저 선점한 경쟁 트랜잭션 감지
    FrontRun,
    /// 릴레이가 제출을 거절함
    Relay,
    /// N 블록 내 미포함
    Timeout,
    /// 운영자 취소
    Cancelled,
}

/// 제출 계획 상태 기계
///
/// Monitoring을 제외한 모든 상태는 도달 즉시 종결된다
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PlanState {
    Planning,
    Submitted,
    Monitoring,
    Confirmed,
    Rejected(RejectReason),
    Closed,
}

impl PlanState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanState::Confirmed | PlanState::Rejected(_) | PlanState::Closed
        )
    }
}

/// 제출 계획. 정확히 한 번만 실행된다
#[derive(Debug, Clone)]
pub struct SubmissionPlan {
    pub id: Uuid,
    pub chain_id: u64,
    pub pair: PairId,
    pub channel: SubmissionChannel,
    pub tx_hash: H256,
    pub max_fee: U256,
    pub priority_fee: U256,
    /// 번들 채널일 때 목표 블록
    pub target_block: Option<u64>,
    pub expected_profit_usd: Decimal,
    pub estimated_fee_usd: Decimal,
    pub state: PlanState,
    pub created_at: DateTime<Utc>,
}

/// 경쟁 봇 행동 프로파일
///
/// Profiler가 단독 소유하며 외부에는 복사본만 나간다
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompetitorProfile {
    pub address: Address,
    /// 최근 가스 가격 이력 (wei, 고정 길이 링)
    pub gas_history: VecDeque<u64>,
    pub pair_counts: HashMap<PairId, u64>,
    /// 함수 셀렉터(hex 4바이트)별 관측 횟수
    pub method_counts: HashMap<String, u64>,
    pub hourly_activity: [u64; 24],
    pub daily_activity: [u64; 7],
    /// 제출 시각 패턴용 분 단위 히스토그램 (길이 60)
    pub minute_activity: Vec<u64>,
    pub included_txs: u64,
    pub observed_txs: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl CompetitorProfile {
    pub const GAS_HISTORY_LIMIT: usize = 256;

    pub fn new(address: Address, now: DateTime<Utc>) -> Self {
        Self {
            address,
            gas_history: VecDeque::with_capacity(Self::GAS_HISTORY_LIMIT),
            pair_counts: HashMap::new(),
            method_counts: HashMap::new(),
            hourly_activity: [0; 24],
            daily_activity: [0; 7],
            minute_activity: vec![0; 60],
            included_txs: 0,
            observed_txs: 0,
            first_seen: now,
            last_seen: now,
        }
    }

    /// last_seen은 단조 비감소
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_seen {
            self.last_seen = at;
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.observed_txs == 0 {
            0.0
        } else {
            self.included_txs as f64 / self.observed_txs as f64
        }
    }

    /// 최근성과 일일 빈도를 섞은 활동 점수. 프로파일 상한 정리에 쓰인다
    pub fn activity_score(&self, now: DateTime<Utc>) -> f64 {
        let age_days = (now - self.last_seen).num_seconds().max(0) as f64 / 86_400.0;
        let lifetime_days =
            ((self.last_seen - self.first_seen).num_seconds().max(0) as f64 / 86_400.0).max(1.0);
        let per_day = self.observed_txs as f64 / lifetime_days;
        let recency = (-age_days).exp();
        per_day * 0.6 + recency * 10.0 * 0.4
    }
}

/// 공격 유형
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AttackKind {
    FrontRun,
    Sandwich,
    GasOutbid,
}

/// 관측된 공격 기록 (append-only, 분석용)
///
/// 동일 페어 선행 포함 휴리스틱은 오탐 가능성이 있으므로
/// 근거 자료이지 확정 판정이 아니다
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttackRecord {
    pub chain_id: u64,
    pub pair: PairId,
    pub kind: AttackKind,
    pub estimated_loss_usd: Decimal,
    pub attacker: Option<Address>,
    pub recorded_at: DateTime<Utc>,
}

/// Error types
#[derive(thiserror::Error, Debug)]
pub enum ShieldError {
    #[error("all endpoints down: {attempted} endpoints attempted")]
    AllEndpointsDown { attempted: usize },

    #[error("signer unavailable: {0}")]
    SignerUnavailable(String),

    #[error("signing rejected by policy: {0}")]
    SignerPolicy(String),

    #[error("relay rejected submission: {0}")]
    RelayRejected(String),

    #[error("submission timed out on channel {channel}")]
    SubmissionTimeout { channel: SubmissionChannel },

    #[error("network error: {0}")]
    Network(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Result type alias
pub type ShieldResult<T> = Result<T, ShieldError>;

/// 구독 스트림이 내보내는 원시 이벤트
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Tick(PriceTick),
    PendingTx(PendingTx),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_risk_level_severity() {
        assert_eq!(RiskLevel::Low.more_severe(RiskLevel::High), RiskLevel::High);
        assert_eq!(RiskLevel::Medium.more_severe(RiskLevel::Low), RiskLevel::Medium);
        assert_eq!(RiskLevel::High.more_severe(RiskLevel::High), RiskLevel::High);
    }

    #[test]
    fn test_plan_state_terminal() {
        assert!(!PlanState::Planning.is_terminal());
        assert!(!PlanState::Submitted.is_terminal());
        assert!(!PlanState::Monitoring.is_terminal());
        assert!(PlanState::Confirmed.is_terminal());
        assert!(PlanState::Rejected(RejectReason::Timeout).is_terminal());
        assert!(PlanState::Closed.is_terminal());
    }

    #[test]
    fn test_profile_last_seen_monotonic() {
        let now = Utc::now();
        let mut profile = CompetitorProfile::new(Address::zero(), now);

        // 과거 시각으로는 되돌아가지 않는다
        profile.touch(now - Duration::seconds(60));
        assert_eq!(profile.last_seen, now);

        let later = now + Duration::seconds(30);
        profile.touch(later);
        assert_eq!(profile.last_seen, later);
    }

    #[test]
    fn test_method_selector_extraction() {
        let tx = PendingTx {
            hash: H256::zero(),
            from: Address::zero(),
            to: None,
            value: U256::zero(),
            gas_price: U256::zero(),
            gas_limit: U256::zero(),
            input: Bytes::from(vec![0x38, 0xed, 0x17, 0x39, 0xff]),
            nonce: 0,
            first_seen: Utc::now(),
        };
        assert_eq!(tx.method_selector(), Some([0x38, 0xed, 0x17, 0x39]));

        let empty = PendingTx { input: Bytes::new(), ..tx };
        assert_eq!(empty.method_selector(), None);
    }

    #[test]
    fn test_network_state_pending_lookup() {
        let mut pending = HashMap::new();
        pending.insert("WETH/USDC".to_string(), 6usize);

        let state = NetworkState {
            chain_id: 1,
            base_fee: Some(U256::from(50_000_000_000u64)),
            priority_fee: U256::from(2_000_000_000u64),
            gas_price: U256::from(52_000_000_000u64),
            pending_by_pair: pending,
            congestion: CongestionLevel::Medium,
            fetched_at: Utc::now(),
        };

        assert_eq!(state.pending_for("WETH/USDC"), 6);
        assert_eq!(state.pending_for("WBTC/USDC"), 0);
        assert!(state.supports_eip1559());
    }
}
