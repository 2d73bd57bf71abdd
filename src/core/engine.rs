use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use dashmap::DashMap;
use ethers::types::Address;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::blockchain::{
    ConnectionManager, Endpoint, EndpointPool, EventSubscriber, LiveMarketProvider,
    MarketDataProvider,
};
use crate::common::RetryPolicy;
use crate::config::Config;
use crate::gas::{spawn_refresh_loop, CompetitionTracker, LiveNetworkStateProvider, RiskEngine};
use crate::mocks::{MockBlockWatcher, MockNetworkStateProvider, MockSigner, SyntheticMarketProvider, UnavailableSigner};
use crate::oracle::{spawn_staleness_watchdog, HttpReferenceSource, PriceValidator, ReferencePriceSource};
use crate::profiler::{CompetitorProfiler, DecoyGenerator, FeatureContext};
use crate::storage::ProfileStore;
use crate::submission::{
    BundleRelayTransport, ChannelTransport, PrivateRelayTransport, PublicRpcTransport,
    SharedBlockWatcher, SubmissionRouter, TransactionSigner,
};
use ethers::types::H256;
use tokio::sync::broadcast;
use crate::submission::PlanHandle;
use crate::types::{AttackRecord, PairId, PriceSnapshot, SubmissionChannel, TxRequest};
use rust_decimal::Decimal;

/// 상태 API로 내보내는 요약
#[derive(Debug, Clone, Serialize)]
pub struct ShieldStatus {
    pub is_running: bool,
    pub uptime_seconds: u64,
    pub market_provider: &'static str,
    pub endpoints: Vec<Endpoint>,
    pub tracked_profiles: usize,
    pub attacks_recorded: u64,
    pub plans_total: usize,
    pub snapshots: HashMap<PairId, PriceSnapshot>,
}

/// 보호 계층 오케스트레이터
///
/// 구독, 검증, 위험 평가, 제출 감시, 프로파일링 태스크를
/// 하나로 묶어 기동/종료를 관리한다
pub struct ShieldCore {
    config: Arc<Config>,
    pool: Arc<EndpointPool>,
    manager: Arc<ConnectionManager>,
    market: Arc<dyn MarketDataProvider>,
    risk_engine: Arc<RiskEngine>,
    router: Arc<SubmissionRouter>,
    decoys: Arc<DecoyGenerator>,
    store: Arc<ProfileStore>,
    context: FeatureContext,
    latest_snapshots: Arc<DashMap<PairId, PriceSnapshot>>,
    profile_count: Arc<AtomicUsize>,
    attack_count: Arc<AtomicU64>,
    is_running: Arc<AtomicBool>,
    synthetic: bool,
    started_at: Instant,
    attack_inbox: tokio::sync::Mutex<Option<mpsc::Receiver<AttackRecord>>>,
    /// 라이브 모드에서만 존재하는 공유 블록 관측자
    block_watcher: Option<Arc<SharedBlockWatcher>>,
    inclusion_sender: mpsc::Sender<H256>,
    inclusion_inbox: tokio::sync::Mutex<Option<mpsc::Receiver<H256>>>,
}

impl ShieldCore {
    pub fn new(
        config: Arc<Config>,
        synthetic: bool,
        signer: Option<Arc<dyn TransactionSigner>>,
    ) -> Result<Self> {
        info!("🔧 ShieldCore 초기화 중...");
        config.validate()?;

        let primary = config
            .networks
            .first()
            .context("네트워크가 설정되지 않았습니다")?
            .clone();

        let pool = Arc::new(EndpointPool::from_network(&primary));
        let policy = RetryPolicy::new(config.router.transport_max_attempts);
        let manager = Arc::new(ConnectionManager::new(Arc::clone(&pool), policy.clone()));
        let context = FeatureContext::from_config(&config);

        // 시장 데이터 공급자: 라이브/합성 중 하나가 꽂히고
        // 하류 로직은 어느 쪽인지 모른다
        let market: Arc<dyn MarketDataProvider> = if synthetic {
            let router_address = config
                .profiler
                .dex_routers
                .first()
                .and_then(|s| s.parse::<Address>().ok())
                .unwrap_or_else(Address::zero);
            Arc::new(SyntheticMarketProvider::new(config.pairs.clone(), router_address))
        } else {
            Arc::new(LiveMarketProvider::new(Arc::clone(&manager), &config.pools))
        };

        let tracker = Arc::new(CompetitionTracker::new(60));
        let risk_engine = if synthetic {
            Arc::new(RiskEngine::new(
                config.risk.clone(),
                config.networks.clone(),
                Arc::new(MockNetworkStateProvider::eip1559(30_000_000_000, 2_000_000_000)),
                Arc::clone(&tracker),
            ))
        } else {
            Arc::new(RiskEngine::new(
                config.risk.clone(),
                config.networks.clone(),
                Arc::new(LiveNetworkStateProvider::new(Arc::clone(&manager))),
                Arc::clone(&tracker),
            ))
        };

        let mut transports: HashMap<SubmissionChannel, Arc<dyn ChannelTransport>> = HashMap::new();
        transports.insert(
            SubmissionChannel::Normal,
            Arc::new(PublicRpcTransport::new(Arc::clone(&manager), policy.clone())) as _,
        );
        transports.insert(
            SubmissionChannel::Private,
            Arc::new(PrivateRelayTransport::new(
                config.router.private_relay_url.clone(),
                policy.clone(),
            )) as _,
        );
        transports.insert(
            SubmissionChannel::Bundle,
            Arc::new(BundleRelayTransport::new(
                config.router.bundle_relay_url.clone(),
                BundleRelayTransport::identity_from_env(),
                policy,
            )) as _,
        );

        let signer: Arc<dyn TransactionSigner> = match signer {
            Some(signer) => signer,
            None if synthetic => Arc::new(MockSigner::new()),
            None => {
                warn!("⚠️ 서명자 미설정 - 제출 요청은 즉시 실패합니다 (관측 전용 모드)");
                Arc::new(UnavailableSigner)
            }
        };

        let (attack_sender, attack_receiver) = mpsc::channel(256);
        let (inclusion_sender, inclusion_receiver) = mpsc::channel(256);

        let (router, block_watcher) = if synthetic {
            let router = Arc::new(SubmissionRouter::new(
                config.router.clone(),
                transports,
                signer,
                Arc::new(MockBlockWatcher::new(1)),
                attack_sender,
            ));
            (router, None)
        } else {
            let watcher = SharedBlockWatcher::spawn(
                Arc::clone(&manager),
                context.clone(),
                primary.block_time_secs,
            );
            let router = Arc::new(SubmissionRouter::new(
                config.router.clone(),
                transports,
                signer,
                Arc::clone(&watcher) as Arc<dyn crate::submission::BlockWatcher>,
                attack_sender,
            ));
            (router, Some(watcher))
        };

        let decoys = Arc::new(DecoyGenerator::new(config.profiler.decoy.clone()));
        let store = Arc::new(ProfileStore::new(&config.storage.data_dir)?);

        info!("✅ ShieldCore 초기화 완료");

        Ok(Self {
            config,
            pool,
            manager,
            market,
            risk_engine,
            router,
            decoys,
            store,
            context,
            latest_snapshots: Arc::new(DashMap::new()),
            profile_count: Arc::new(AtomicUsize::new(0)),
            attack_count: Arc::new(AtomicU64::new(0)),
            is_running: Arc::new(AtomicBool::new(false)),
            synthetic,
            started_at: Instant::now(),
            attack_inbox: tokio::sync::Mutex::new(Some(attack_receiver)),
            block_watcher,
            inclusion_sender,
            inclusion_inbox: tokio::sync::Mutex::new(Some(inclusion_receiver)),
        })
    }

    pub fn router(&self) -> Arc<SubmissionRouter> {
        Arc::clone(&self.router)
    }

    pub fn risk_engine(&self) -> Arc<RiskEngine> {
        Arc::clone(&self.risk_engine)
    }

    pub fn decoy_generator(&self) -> Arc<DecoyGenerator> {
        Arc::clone(&self.decoys)
    }

    pub fn latest_snapshot(&self, pair: &str) -> Option<PriceSnapshot> {
        self.latest_snapshots.get(pair).map(|s| s.value().clone())
    }

    pub fn connection_manager(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.manager)
    }

    /// 장기 태스크들을 띄운다
    pub async fn start(&self) -> Result<()> {
        info!("🚀 보호 계층 기동");
        self.is_running.store(true, Ordering::SeqCst);

        let (ticks, pendings) = EventSubscriber::start(Arc::clone(&self.market)).await?;

        self.spawn_tick_pipeline(ticks);
        self.spawn_profiler_pipeline(pendings).await;
        self.spawn_attack_sink().await;
        self.spawn_inclusion_feedback();

        let chain_ids: Vec<u64> = self.config.networks.iter().map(|n| n.chain_id).collect();
        let _ = spawn_refresh_loop(Arc::clone(&self.risk_engine), chain_ids);

        Ok(())
    }

    pub fn stop(&self) {
        info!("🛑 보호 계층 종료");
        self.is_running.store(false, Ordering::SeqCst);
    }

    /// 위험 평가 -> 교란본 생성 -> 채널 라우팅까지 한 번에
    ///
    /// 수익성 게이트에 걸리면 전송 계층을 건드리지 않고 끝난다
    pub async fn submit_protected(
        &self,
        request: &TxRequest,
        expected_profit_usd: Decimal,
    ) -> Result<PlanHandle> {
        let assessment = self
            .risk_engine
            .assess(request.chain_id, &request.pair, expected_profit_usd)
            .await?;

        let batch = self.decoys.generate(request);
        let handle = self.router.submit_with_decoys(batch, &assessment).await?;
        Ok(handle)
    }

    pub fn status(&self) -> ShieldStatus {
        let snapshots = self
            .latest_snapshots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        ShieldStatus {
            is_running: self.is_running.load(Ordering::SeqCst),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            market_provider: self.market.name(),
            endpoints: self.pool.snapshot(),
            tracked_profiles: self.profile_count.load(Ordering::SeqCst),
            attacks_recorded: self.attack_count.load(Ordering::SeqCst),
            plans_total: self.router.plan_count(),
            snapshots,
        }
    }

    /// 틱 -> 검증 -> 스냅샷 파이프라인
    fn spawn_tick_pipeline(&self, mut ticks: mpsc::Receiver<crate::types::PriceTick>) {
        let validator_config = self.config.validator.clone();
        let mut sources: Vec<Arc<dyn ReferencePriceSource>> = self
            .config
            .reference_sources
            .iter()
            .enumerate()
            .map(|(index, url)| {
                Arc::new(HttpReferenceSource::new(format!("ref-{}", index), url.clone())) as _
            })
            .collect();

        // 합성 모드에서는 소스 정족수를 합성 레퍼런스로 채운다
        if self.synthetic && sources.is_empty() {
            sources.push(Arc::new(crate::mocks::JitterReferenceSource::pegged("synthetic-a", 0.5)));
            sources.push(Arc::new(crate::mocks::JitterReferenceSource::pegged("synthetic-b", 0.8)));
        }

        let mut validator = PriceValidator::new(validator_config, sources);
        let latest = Arc::clone(&self.latest_snapshots);
        let risk_engine = Arc::clone(&self.risk_engine);
        let chain_id = self.config.networks[0].chain_id;
        let pairs = self.config.pairs.clone();
        let staleness_secs = self.config.validator.staleness_secs;

        // 정체 알림 소비자: 만료된 스냅샷은 최신 테이블에서 치운다
        let (alert_sender, mut alerts) = mpsc::channel(32);
        let _ = spawn_staleness_watchdog(pairs, validator.last_updates(), staleness_secs, alert_sender);
        let stale_latest = Arc::clone(&self.latest_snapshots);
        tokio::spawn(async move {
            while let Some(alert) = alerts.recv().await {
                warn!(
                    "⏳ 스냅샷 정체: {} ({}초) - 소비자 노출 중단",
                    alert.pair, alert.silent_for_secs
                );
                stale_latest.remove(&alert.pair);
            }
        });

        tokio::spawn(async move {
            while let Some(tick) = ticks.recv().await {
                let pair = tick.pair.clone();
                if let Some(snapshot) = validator.ingest(tick).await {
                    // 네이티브 토큰 시세는 수익성 게이트로 흘러간다
                    if snapshot.pair.starts_with("WETH/") {
                        risk_engine.update_native_price(chain_id, snapshot.price);
                    }
                    latest.insert(pair, snapshot);
                }
            }
            error!("틱 파이프라인 종료 (스트림 닫힘)");
        });
    }

    /// 블록 포함 관측을 경쟁 추적기와 프로파일러 성공률로 되먹인다
    fn spawn_inclusion_feedback(&self) {
        let watcher = match &self.block_watcher {
            Some(watcher) => Arc::clone(watcher),
            None => return,
        };
        let tracker = self.risk_engine.tracker();
        let inclusions = self.inclusion_sender.clone();

        tokio::spawn(async move {
            let mut blocks = watcher.subscribe();
            loop {
                match blocks.recv().await {
                    Ok(block) => {
                        for tx in &block.txs {
                            tracker.mark_included(tx.hash);
                            let _ = inclusions.send(tx.hash).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// 멤풀 -> 프로파일러/경쟁 추적 파이프라인
    ///
    /// 프로파일 저장소는 이 태스크가 단독 소유한다
    async fn spawn_profiler_pipeline(&self, mut pendings: mpsc::Receiver<crate::types::PendingTx>) {
        let mut profiler =
            CompetitorProfiler::new(self.config.profiler.clone(), self.context.clone());

        // 재기동: 저장된 프로파일을 절대 타임스탬프 그대로 복원
        match self.store.load_profiles() {
            Ok(profiles) if !profiles.is_empty() => profiler.restore(profiles),
            Ok(_) => {}
            Err(e) => warn!("⚠️ 프로파일 복원 실패: {}", e),
        }
        self.profile_count.store(profiler.profile_count(), Ordering::SeqCst);

        let tracker = self.risk_engine.tracker();
        let context = self.context.clone();
        let store = Arc::clone(&self.store);
        let profile_count = Arc::clone(&self.profile_count);
        let maintenance_secs = self.config.profiler.maintenance_interval_secs;
        let persist_secs = self.config.storage.persist_interval_secs;
        let mut inclusions = match self.inclusion_inbox.lock().await.take() {
            Some(receiver) => receiver,
            None => return,
        };

        tokio::spawn(async move {
            let mut maintenance =
                tokio::time::interval(std::time::Duration::from_secs(maintenance_secs.max(1)));
            let mut persist =
                tokio::time::interval(std::time::Duration::from_secs(persist_secs.max(1)));

            loop {
                tokio::select! {
                    observed = pendings.recv() => match observed {
                        Some(tx) => {
                            // 같은 페어를 노리는 경쟁 수를 Risk Engine과 공유
                            if let Some(pair) = context.infer_pair(tx.to, tx.input.as_ref()) {
                                tracker.record(&pair, tx.hash);
                            }
                            profiler.observe(&tx);
                            profile_count.store(profiler.profile_count(), Ordering::SeqCst);
                        }
                        None => {
                            info!("멤풀 파이프라인 종료 (스트림 닫힘)");
                            break;
                        }
                    },
                    Some(hash) = inclusions.recv() => {
                        profiler.record_inclusion(hash);
                    }
                    _ = maintenance.tick() => {
                        profiler.maintenance(chrono::Utc::now());
                        profile_count.store(profiler.profile_count(), Ordering::SeqCst);
                    }
                    _ = persist.tick() => {
                        if let Err(e) = store.save_profiles(&profiler.export()) {
                            warn!("⚠️ 프로파일 저장 실패: {}", e);
                        }
                    }
                }
            }

            // 종료 직전 마지막 저장
            if let Err(e) = store.save_profiles(&profiler.export()) {
                warn!("⚠️ 종료 시 프로파일 저장 실패: {}", e);
            }
        });
    }

    /// 공격 기록 싱크: append-only 로그로 흘린다
    async fn spawn_attack_sink(&self) {
        let mut inbox = match self.attack_inbox.lock().await.take() {
            Some(inbox) => inbox,
            None => return,
        };
        let store = Arc::clone(&self.store);
        let count = Arc::clone(&self.attack_count);

        tokio::spawn(async move {
            while let Some(record) = inbox.recv().await {
                count.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = store.append_attacks(std::slice::from_ref(&record)) {
                    warn!("⚠️ 공격 기록 저장 실패: {}", e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_core() -> ShieldCore {
        let mut config = Config::default();
        config.storage.data_dir = tempfile::tempdir()
            .expect("tempdir")
            .into_path()
            .to_string_lossy()
            .to_string();
        ShieldCore::new(Arc::new(config), true, None).expect("core")
    }

    #[tokio::test]
    async fn test_synthetic_pipeline_produces_status() {
        let core = synthetic_core();
        core.start().await.expect("start");

        let status = core.status();
        assert!(status.is_running);
        assert_eq!(status.market_provider, "synthetic");
        assert!(!status.endpoints.is_empty());

        core.stop();
        assert!(!core.status().is_running);
    }

    #[tokio::test]
    async fn test_unprofitable_protected_submit_stops_at_gate() {
        use crate::types::PlanState;
        use ethers::types::{Bytes, U256};

        let core = synthetic_core();

        let request = TxRequest {
            chain_id: 1,
            pair: "WETH/USDC".to_string(),
            to: Address::zero(),
            value: U256::exp10(18),
            input: Bytes::from(vec![0x38, 0xed, 0x17, 0x39]),
            gas_limit: U256::from(250_000u64),
            max_fee: U256::zero(),
            priority_fee: U256::zero(),
            nonce: 0,
            decoy: false,
            submit_delay_ms: 0,
        };

        // 합성 수수료 환경에서 $1 수익은 게이트를 넘지 못한다
        let handle = core
            .submit_protected(&request, Decimal::from(1))
            .await
            .expect("submit");

        assert_eq!(
            handle.state().await,
            PlanState::Rejected(crate::types::RejectReason::Unprofitable)
        );
    }

    #[tokio::test]
    async fn test_core_rejects_invalid_config() {
        let mut config = Config::default();
        config.networks.clear();
        assert!(ShieldCore::new(Arc::new(config), true, None).is_err());
    }
}
