use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RouterConfig;
use crate::submission::channels::ChannelTransport;
use crate::submission::signer::TransactionSigner;
use crate::submission::watcher::BlockWatcher;
use crate::types::{
    AttackKind, AttackRecord, PlanState, RejectReason, RiskAssessment, ShieldError, ShieldResult,
    SignedPayload, SubmissionChannel, SubmissionPlan, TxRequest,
};

/// 진행 중인 제출 계획 핸들
///
/// 취소는 멱등이다: 이미 종결된 계획에 대한 취소는 아무 일도 하지 않는다
#[derive(Clone)]
pub struct PlanHandle {
    inner: Arc<RwLock<SubmissionPlan>>,
    cancel: CancellationToken,
}

impl PlanHandle {
    fn new(plan: SubmissionPlan) -> Self {
        Self {
            inner: Arc::new(RwLock::new(plan)),
            cancel: CancellationToken::new(),
        }
    }

    pub async fn id(&self) -> Uuid {
        self.inner.read().await.id
    }

    pub async fn state(&self) -> PlanState {
        self.inner.read().await.state.clone()
    }

    pub async fn snapshot(&self) -> SubmissionPlan {
        self.inner.read().await.clone()
    }

    /// 허용된 간선이면 상태를 옮긴다. 종결 상태는 떠나지 않는다
    async fn try_transition(&self, next: PlanState) -> bool {
        let mut plan = self.inner.write().await;
        if !transition_allowed(&plan.state, &next) {
            debug!("상태 전이 거부: {:?} -> {:?}", plan.state, next);
            return false;
        }
        debug!("계획 {} 상태 전이: {:?} -> {:?}", plan.id, plan.state, next);
        plan.state = next;
        true
    }

    async fn set_target_block(&self, target: u64) {
        self.inner.write().await.target_block = Some(target);
    }

    /// 운영자 취소. 몇 번을 불러도, 어떤 상태에서 불러도 안전하다
    pub async fn cancel(&self) {
        {
            let mut plan = self.inner.write().await;
            if plan.state.is_terminal() {
                return;
            }
            info!("🛑 계획 {} 취소", plan.id);
            plan.state = PlanState::Rejected(RejectReason::Cancelled);
        }
        self.cancel.cancel();
    }
}

/// 상태 기계 간선. Monitoring만 관찰을 계속하는 비종결 상태다
fn transition_allowed(current: &PlanState, next: &PlanState) -> bool {
    use PlanState::*;
    matches!(
        (current, next),
        (Planning, Submitted)
            | (Planning, Rejected(_))
            | (Submitted, Monitoring)
            | (Submitted, Rejected(_))
            | (Monitoring, Confirmed)
            | (Monitoring, Rejected(_))
            | (Monitoring, Closed)
    )
}

/// 제출 라우터
///
/// 위험 평가에 따라 채널을 고르고, 제출 후 포함 여부와
/// 선점 징후를 감시한다. 채널 전송은 주입된 능력이라 교체 가능하다
pub struct SubmissionRouter {
    config: RouterConfig,
    transports: HashMap<SubmissionChannel, Arc<dyn ChannelTransport>>,
    signer: Arc<dyn TransactionSigner>,
    watcher: Arc<dyn BlockWatcher>,
    attack_log: mpsc::Sender<AttackRecord>,
    plans: DashMap<Uuid, PlanHandle>,
}

impl SubmissionRouter {
    pub fn new(
        config: RouterConfig,
        transports: HashMap<SubmissionChannel, Arc<dyn ChannelTransport>>,
        signer: Arc<dyn TransactionSigner>,
        watcher: Arc<dyn BlockWatcher>,
        attack_log: mpsc::Sender<AttackRecord>,
    ) -> Self {
        Self { config, transports, signer, watcher, attack_log, plans: DashMap::new() }
    }

    pub fn plan_count(&self) -> usize {
        self.plans.len()
    }

    pub async fn plans_snapshot(&self) -> Vec<SubmissionPlan> {
        // 샤드 락을 잡은 채로 await하지 않도록 핸들부터 복사한다
        let handles: Vec<PlanHandle> = self.plans.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.snapshot().await);
        }
        out
    }

    /// 서명까지 맡기는 편의 진입점
    pub async fn submit(
        &self,
        request: &TxRequest,
        assessment: &RiskAssessment,
    ) -> ShieldResult<PlanHandle> {
        let signed = self.signer.sign(request).await?;
        self.submit_signed(signed, assessment).await
    }

    /// 서명된 페이로드 제출
    ///
    /// 수익성 없는 평가는 전송 계층을 한 번도 건드리지 않고
    /// Planning에서 곧바로 Rejected로 끝난다
    pub async fn submit_signed(
        &self,
        signed: SignedPayload,
        assessment: &RiskAssessment,
    ) -> ShieldResult<PlanHandle> {
        if signed.decoy {
            return Err(ShieldError::Config(
                "교란 페이로드는 정산 계획이 될 수 없습니다".to_string(),
            ));
        }

        let channel = assessment.recommended_channel;
        let plan = SubmissionPlan {
            id: Uuid::new_v4(),
            chain_id: assessment.chain_id,
            pair: assessment.pair.clone(),
            channel,
            tx_hash: signed.hash,
            max_fee: assessment.max_fee,
            priority_fee: assessment.priority_fee,
            target_block: None,
            expected_profit_usd: assessment.expected_profit_usd,
            estimated_fee_usd: assessment.estimated_fee_usd,
            state: PlanState::Planning,
            created_at: Utc::now(),
        };
        let handle = PlanHandle::new(plan);
        self.plans.insert(handle.id().await, handle.clone());

        if !assessment.is_profitable {
            info!(
                "🚫 제출 거부 (수익성): 예상 수익 ${} <= 예상 수수료 ${} (pair={})",
                assessment.expected_profit_usd.round_dp(2),
                assessment.estimated_fee_usd.round_dp(2),
                assessment.pair
            );
            handle
                .try_transition(PlanState::Rejected(RejectReason::Unprofitable))
                .await;
            return Ok(handle);
        }

        // 번들 채널은 다음 블록을 노린다
        let target_block = if channel == SubmissionChannel::Bundle {
            let current = self.watcher.current_block().await?;
            let target = current + 1;
            handle.set_target_block(target).await;
            Some(target)
        } else {
            None
        };

        let transport = self
            .transports
            .get(&channel)
            .ok_or_else(|| ShieldError::Config(format!("{} 채널 전송 계층 미설정", channel)))?;

        match transport.submit(&signed, target_block).await {
            Ok(receipt) => {
                info!(
                    "📤 제출 성공: plan={} channel={} handle={}",
                    handle.id().await,
                    channel,
                    receipt.handle
                );
                handle.try_transition(PlanState::Submitted).await;
            }
            Err(e) => {
                warn!("❌ 제출 실패: channel={} - {}", channel, e);
                handle
                    .try_transition(PlanState::Rejected(RejectReason::Relay))
                    .await;
                return Ok(handle);
            }
        }

        self.spawn_monitor(handle.clone(), signed);
        Ok(handle)
    }

    /// 실물 하나와 교란 복제본들을 함께 내보낸다
    ///
    /// 교란본은 공개 채널로 각자 지연 후 나가고 결과는 추적하지 않는다.
    /// 계획은 실물에 대해서만 만들어진다
    pub async fn submit_with_decoys(
        &self,
        batch: Vec<TxRequest>,
        assessment: &RiskAssessment,
    ) -> ShieldResult<PlanHandle> {
        let mut real: Option<TxRequest> = None;

        for request in batch {
            if !request.decoy {
                if real.replace(request).is_some() {
                    return Err(ShieldError::Config(
                        "배치에 실물 트랜잭션이 둘 이상입니다".to_string(),
                    ));
                }
                continue;
            }

            let delay = std::time::Duration::from_millis(request.submit_delay_ms);
            match self.signer.sign(&request).await {
                Ok(signed) => {
                    if let Some(transport) = self.transports.get(&SubmissionChannel::Normal) {
                        let transport = Arc::clone(transport);
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            match transport.submit(&signed, None).await {
                                Ok(receipt) => {
                                    debug!("🎭 교란 제출: {}", receipt.handle)
                                }
                                Err(e) => debug!("교란 제출 실패 (무시): {}", e),
                            }
                        });
                    }
                }
                Err(e) => warn!("⚠️ 교란 서명 실패 (무시): {}", e),
            }
        }

        let real = real.ok_or_else(|| {
            ShieldError::Config("배치에 실물 트랜잭션이 없습니다".to_string())
        })?;
        self.submit(&real, assessment).await
    }

    fn spawn_monitor(&self, handle: PlanHandle, signed: SignedPayload) {
        let watcher = Arc::clone(&self.watcher);
        let attack_log = self.attack_log.clone();
        let timeout_blocks = self.config.confirm_timeout_blocks;

        tokio::spawn(async move {
            if !handle.try_transition(PlanState::Monitoring).await {
                // 제출 직후 취소된 경우
                return;
            }

            let plan = handle.snapshot().await;
            let cancel = handle.cancel.clone();
            let mut blocks_waited = 0u64;
            let mut watch_errors = 0u32;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        // cancel()이 이미 상태를 옮겼다
                        break;
                    }
                    observed = watcher.next_block() => match observed {
                        Ok(block) => {
                            watch_errors = 0;

                            if block.txs.iter().any(|tx| tx.hash == signed.hash) {
                                info!(
                                    "✅ 포함 확인: plan={} block={} pair={}",
                                    plan.id, block.number, plan.pair
                                );
                                handle.try_transition(PlanState::Confirmed).await;
                                break;
                            }

                            // 선점 징후: 같은 페어를 먼저 차지한 남의 트랜잭션.
                            // 무관한 동종 아비트래지일 수도 있는 근사 신호다
                            let rival = block.txs.iter().find(|tx| {
                                tx.hash != signed.hash
                                    && tx.pair.as_deref() == Some(plan.pair.as_str())
                            });
                            if let Some(rival) = rival {
                                warn!(
                                    "🏴 선점 감지: plan={} block={} attacker={:?} (예상 손실 ${})",
                                    plan.id,
                                    block.number,
                                    rival.from,
                                    plan.expected_profit_usd.round_dp(2)
                                );
                                let record = AttackRecord {
                                    chain_id: plan.chain_id,
                                    pair: plan.pair.clone(),
                                    kind: AttackKind::FrontRun,
                                    estimated_loss_usd: plan.expected_profit_usd,
                                    attacker: Some(rival.from),
                                    recorded_at: Utc::now(),
                                };
                                let _ = attack_log.send(record).await;
                                handle
                                    .try_transition(PlanState::Rejected(RejectReason::FrontRun))
                                    .await;
                                break;
                            }

                            blocks_waited += 1;
                            if blocks_waited >= timeout_blocks {
                                info!(
                                    "⌛ 포함 타임아웃: plan={} ({}블록 대기)",
                                    plan.id, blocks_waited
                                );
                                handle
                                    .try_transition(PlanState::Rejected(RejectReason::Timeout))
                                    .await;
                                break;
                            }
                        }
                        Err(e) => {
                            watch_errors += 1;
                            warn!("⚠️ 블록 관측 실패 ({}회): {}", watch_errors, e);
                            if watch_errors >= 3 {
                                // 판정 없이 관찰이 끝났다
                                handle.try_transition(PlanState::Closed).await;
                                break;
                            }
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::mocks::{MockBlockWatcher, MockSigner, MockTransport};
    use crate::submission::watcher::{ObservedBlock, ObservedTx};
    use ethers::types::{Address, Bytes, H256, U256};
    use rust_decimal::Decimal;
    use std::time::Duration;

    fn assessment(profitable: bool, channel: SubmissionChannel) -> RiskAssessment {
        RiskAssessment {
            pair: "WETH/USDC".to_string(),
            chain_id: 1,
            level: crate::types::RiskLevel::Low,
            competing_txs: 0,
            recommended_channel: channel,
            fee_multiplier: 1.0,
            max_fee: U256::from(62_000_000_000u64),
            priority_fee: U256::from(2_000_000_000u64),
            gas_price: U256::from(50_000_000_000u64),
            uses_eip1559: true,
            ceiling_clamped: false,
            expected_profit_usd: if profitable { Decimal::from(100) } else { Decimal::from(10) },
            estimated_fee_usd: Decimal::from(12),
            is_profitable: profitable,
        }
    }

    fn request(decoy: bool) -> TxRequest {
        TxRequest {
            chain_id: 1,
            pair: "WETH/USDC".to_string(),
            to: Address::zero(),
            value: U256::from(1_000_000_000_000_000_000u128),
            input: Bytes::from(vec![0x38, 0xed, 0x17, 0x39]),
            gas_limit: U256::from(250_000u64),
            max_fee: U256::from(62_000_000_000u64),
            priority_fee: U256::from(2_000_000_000u64),
            nonce: 7,
            decoy,
            submit_delay_ms: 0,
        }
    }

    struct Fixture {
        router: SubmissionRouter,
        normal: Arc<MockTransport>,
        private: Arc<MockTransport>,
        bundle: Arc<MockTransport>,
        watcher: Arc<MockBlockWatcher>,
        attacks: mpsc::Receiver<AttackRecord>,
    }

    fn fixture() -> Fixture {
        let normal = Arc::new(MockTransport::new(SubmissionChannel::Normal));
        let private = Arc::new(MockTransport::new(SubmissionChannel::Private));
        let bundle = Arc::new(MockTransport::new(SubmissionChannel::Bundle));
        let watcher = Arc::new(MockBlockWatcher::new(100));
        let (attack_sender, attacks) = mpsc::channel(16);

        let mut transports: HashMap<SubmissionChannel, Arc<dyn ChannelTransport>> = HashMap::new();
        transports.insert(SubmissionChannel::Normal, normal.clone() as _);
        transports.insert(SubmissionChannel::Private, private.clone() as _);
        transports.insert(SubmissionChannel::Bundle, bundle.clone() as _);

        let mut config = Config::default().router;
        config.confirm_timeout_blocks = 3;

        let router = SubmissionRouter::new(
            config,
            transports,
            Arc::new(MockSigner::new()),
            watcher.clone(),
            attack_sender,
        );

        Fixture { router, normal, private, bundle, watcher, attacks }
    }

    async fn wait_for_terminal(handle: &PlanHandle) -> PlanState {
        for _ in 0..200 {
            let state = handle.state().await;
            if state.is_terminal() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.state().await
    }

    async fn wait_for_monitoring(handle: &PlanHandle) {
        for _ in 0..200 {
            if handle.state().await == PlanState::Monitoring {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Monitoring 상태 도달 실패: {:?}", handle.state().await);
    }

    #[tokio::test]
    async fn test_unprofitable_never_invokes_transport() {
        let f = fixture();

        let handle = f
            .router
            .submit(&request(false), &assessment(false, SubmissionChannel::Private))
            .await
            .expect("submit");

        // Planning -> Rejected(Unprofitable), 전송 계층 호출 0회
        assert_eq!(handle.state().await, PlanState::Rejected(RejectReason::Unprofitable));
        assert_eq!(f.normal.calls(), 0);
        assert_eq!(f.private.calls(), 0);
        assert_eq!(f.bundle.calls(), 0);
    }

    #[tokio::test]
    async fn test_channel_selection_follows_assessment() {
        let f = fixture();
        f.watcher.push_empty_blocks(5);

        let handle = f
            .router
            .submit(&request(false), &assessment(true, SubmissionChannel::Bundle))
            .await
            .expect("submit");

        wait_for_terminal(&handle).await;
        assert_eq!(f.bundle.calls(), 1);
        assert_eq!(f.normal.calls(), 0);

        // 번들 채널은 다음 블록을 노린다
        let plan = handle.snapshot().await;
        assert_eq!(plan.target_block, Some(101));
    }

    #[tokio::test]
    async fn test_confirmed_on_inclusion() {
        let f = fixture();
        let signer = MockSigner::new();
        let signed = signer.preview(&request(false));

        f.watcher.push_block(ObservedBlock {
            number: 101,
            txs: vec![ObservedTx {
                hash: signed.hash,
                from: Address::zero(),
                gas_price: U256::zero(),
                pair: Some("WETH/USDC".to_string()),
                index: 0,
            }],
        });

        let handle = f
            .router
            .submit(&request(false), &assessment(true, SubmissionChannel::Private))
            .await
            .expect("submit");

        assert_eq!(wait_for_terminal(&handle).await, PlanState::Confirmed);
    }

    #[tokio::test]
    async fn test_front_run_emits_attack_record() {
        let mut f = fixture();

        // 같은 페어를 먼저 차지한 남의 트랜잭션
        let rival_from: Address = "0x00000000000000000000000000000000000000bb".parse().expect("addr");
        f.watcher.push_block(ObservedBlock {
            number: 101,
            txs: vec![ObservedTx {
                hash: H256::repeat_byte(0xbb),
                from: rival_from,
                gas_price: U256::from(90_000_000_000u64),
                pair: Some("WETH/USDC".to_string()),
                index: 0,
            }],
        });

        let handle = f
            .router
            .submit(&request(false), &assessment(true, SubmissionChannel::Private))
            .await
            .expect("submit");

        assert_eq!(
            wait_for_terminal(&handle).await,
            PlanState::Rejected(RejectReason::FrontRun)
        );

        let record = tokio::time::timeout(Duration::from_secs(2), f.attacks.recv())
            .await
            .expect("타임아웃")
            .expect("공격 기록 기대");
        assert_eq!(record.kind, AttackKind::FrontRun);
        assert_eq!(record.pair, "WETH/USDC");
        assert_eq!(record.attacker, Some(rival_from));
        assert_eq!(record.estimated_loss_usd, Decimal::from(100));
    }

    #[tokio::test]
    async fn test_timeout_after_configured_blocks() {
        let f = fixture();
        f.watcher.push_empty_blocks(4);

        let handle = f
            .router
            .submit(&request(false), &assessment(true, SubmissionChannel::Normal))
            .await
            .expect("submit");

        assert_eq!(
            wait_for_terminal(&handle).await,
            PlanState::Rejected(RejectReason::Timeout)
        );
    }

    #[tokio::test]
    async fn test_relay_rejection_is_terminal_without_retry() {
        let f = fixture();
        f.private.fail_with_rejection("bundle not allowed");

        let handle = f
            .router
            .submit(&request(false), &assessment(true, SubmissionChannel::Private))
            .await
            .expect("submit");

        assert_eq!(handle.state().await, PlanState::Rejected(RejectReason::Relay));
        // 릴레이 거절은 같은 계획 안에서 재시도하지 않는다
        assert_eq!(f.private.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_on_terminal_plans() {
        let f = fixture();
        let signer = MockSigner::new();
        let signed = signer.preview(&request(false));
        f.watcher.push_block(ObservedBlock {
            number: 101,
            txs: vec![ObservedTx {
                hash: signed.hash,
                from: Address::zero(),
                gas_price: U256::zero(),
                pair: None,
                index: 0,
            }],
        });

        let handle = f
            .router
            .submit(&request(false), &assessment(true, SubmissionChannel::Normal))
            .await
            .expect("submit");
        assert_eq!(wait_for_terminal(&handle).await, PlanState::Confirmed);

        // 종결된 계획 취소는 no-op
        handle.cancel().await;
        assert_eq!(handle.state().await, PlanState::Confirmed);
        handle.cancel().await;
        assert_eq!(handle.state().await, PlanState::Confirmed);
    }

    #[tokio::test]
    async fn test_cancel_while_monitoring() {
        let f = fixture();
        // 블록이 오지 않는 상태에서 감시가 계속된다

        let handle = f
            .router
            .submit(&request(false), &assessment(true, SubmissionChannel::Normal))
            .await
            .expect("submit");
        wait_for_monitoring(&handle).await;

        handle.cancel().await;
        assert_eq!(handle.state().await, PlanState::Rejected(RejectReason::Cancelled));

        // 두 번째 취소도 조용히 지나간다
        handle.cancel().await;
        assert_eq!(handle.state().await, PlanState::Rejected(RejectReason::Cancelled));
    }

    #[tokio::test]
    async fn test_decoy_payload_cannot_become_plan() {
        let f = fixture();
        let result = f
            .router
            .submit(&request(true), &assessment(true, SubmissionChannel::Normal))
            .await;
        assert!(matches!(result, Err(ShieldError::Config(_))));
    }

    #[tokio::test]
    async fn test_decoys_sent_on_public_channel_only() {
        let f = fixture();
        f.watcher.push_empty_blocks(4);

        let mut decoy_a = request(true);
        decoy_a.value = U256::from(900_000_000_000_000_000u128);
        let mut decoy_b = request(true);
        decoy_b.value = U256::from(1_100_000_000_000_000_000u128);

        let handle = f
            .router
            .submit_with_decoys(
                vec![decoy_a, request(false), decoy_b],
                &assessment(true, SubmissionChannel::Private),
            )
            .await
            .expect("submit");

        wait_for_terminal(&handle).await;

        // 실물은 프라이빗으로 1건, 교란본은 공개 채널로만 나간다
        assert_eq!(f.private.calls(), 1);
        for _ in 0..100 {
            if f.normal.calls() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.normal.calls(), 2);
        assert!(f.normal.payloads().iter().all(|p| p.decoy));
    }

    #[tokio::test]
    async fn test_signer_unavailable_surfaces_at_call_time() {
        use crate::mocks::UnavailableSigner;

        let normal = Arc::new(MockTransport::new(SubmissionChannel::Normal));
        let mut transports: HashMap<SubmissionChannel, Arc<dyn ChannelTransport>> = HashMap::new();
        transports.insert(SubmissionChannel::Normal, normal.clone() as _);

        let (attack_sender, _attacks) = mpsc::channel(4);
        let router = SubmissionRouter::new(
            Config::default().router,
            transports,
            Arc::new(UnavailableSigner),
            Arc::new(MockBlockWatcher::new(1)),
            attack_sender,
        );

        let result = router
            .submit(&request(false), &assessment(true, SubmissionChannel::Normal))
            .await;
        assert!(matches!(result, Err(ShieldError::SignerUnavailable(_))));
        assert_eq!(normal.calls(), 0);
    }

    #[test]
    fn test_transition_table() {
        use PlanState::*;
        assert!(transition_allowed(&Planning, &Submitted));
        assert!(transition_allowed(&Planning, &Rejected(RejectReason::Unprofitable)));
        assert!(transition_allowed(&Submitted, &Monitoring));
        assert!(transition_allowed(&Monitoring, &Confirmed));
        assert!(transition_allowed(&Monitoring, &Closed));

        // 종결 상태는 떠날 수 없다
        assert!(!transition_allowed(&Confirmed, &Monitoring));
        assert!(!transition_allowed(&Rejected(RejectReason::Timeout), &Submitted));
        assert!(!transition_allowed(&Closed, &Monitoring));
        // Planning에서 감시로 건너뛸 수 없다
        assert!(!transition_allowed(&Planning, &Monitoring));
    }
}
