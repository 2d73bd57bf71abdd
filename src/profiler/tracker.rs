use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Datelike, Timelike, Utc};
use ethers::types::{Address, H256};
use tracing::{debug, info};

use crate::config::ProfilerConfig;
use crate::profiler::features::{selector_key, FeatureContext, TxFeatures};
use crate::types::{CompetitorProfile, PairId, PendingTx};

/// 행동 매칭에 쓰는 최근 가스 이력 길이
const GAS_MATCH_WINDOW: usize = 32;

/// 포함 피드백용 해시 매핑 상한
const RECENT_HASH_LIMIT: usize = 4096;

/// 경쟁 봇 프로파일러
///
/// 프로파일 저장소는 이 구조체가 단독 소유한다.
/// 바깥으로는 복사본만 나간다
pub struct CompetitorProfiler {
    config: ProfilerConfig,
    context: FeatureContext,
    allowlist: HashSet<Address>,
    hot_pairs: HashSet<PairId>,
    gas_floor_wei: u128,
    profiles: HashMap<Address, CompetitorProfile>,
    recent_hashes: HashMap<H256, Address>,
    recent_order: VecDeque<H256>,
}

impl CompetitorProfiler {
    pub fn new(config: ProfilerConfig, context: FeatureContext) -> Self {
        let allowlist = config
            .known_bots
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        let hot_pairs = config.hot_pairs.iter().cloned().collect();
        let gas_floor_wei = (config.gas_floor_gwei * 1e9) as u128;

        Self {
            config,
            context,
            allowlist,
            hot_pairs,
            gas_floor_wei,
            profiles: HashMap::new(),
            recent_hashes: HashMap::new(),
            recent_order: VecDeque::new(),
        }
    }

    pub fn profile_count(&self) -> usize {
        self.profiles.len()
    }

    pub fn profile(&self, address: &Address) -> Option<CompetitorProfile> {
        self.profiles.get(address).cloned()
    }

    pub fn snapshot(&self) -> Vec<CompetitorProfile> {
        self.profiles.values().cloned().collect()
    }

    /// 영속화를 위한 전체 복사본
    pub fn export(&self) -> HashMap<Address, CompetitorProfile> {
        self.profiles.clone()
    }

    /// 재기동 시 저장된 프로파일을 복원한다. 타임스탬프는 절대값 그대로다
    pub fn restore(&mut self, profiles: HashMap<Address, CompetitorProfile>) {
        info!("📂 프로파일 {}개 복원", profiles.len());
        self.profiles = profiles;
    }

    /// 멤풀 트랜잭션 하나를 관측한다
    ///
    /// 반환값은 이 트랜잭션이 귀속된 경쟁자 식별자
    pub fn observe(&mut self, tx: &PendingTx) -> Option<Address> {
        let features = self.context.extract(tx);

        // 1. allowlist 주소는 바로 귀속
        if self.allowlist.contains(&tx.from) {
            self.update(tx.from, tx, &features);
            return Some(tx.from);
        }

        // 2. 이미 추적 중인 주소
        if self.profiles.contains_key(&tx.from) {
            self.update(tx.from, tx, &features);
            return Some(tx.from);
        }

        // 3. 행동 기준 매칭 (주소를 바꿔 다니는 봇)
        if let Some(owner) = self.best_behavioral_match(tx, &features) {
            self.update(owner, tx, &features);
            return Some(owner);
        }

        // 4. 충분히 봇처럼 보일 때만 새 프로파일 생성
        if self.is_bot_like(&features) {
            debug!("🤖 새 봇 프로파일: {:?}", tx.from);
            self.update(tx.from, tx, &features);
            return Some(tx.from);
        }

        None
    }

    /// 4개 기준 중 3개 이상 맞는 프로파일을 찾는다
    fn best_behavioral_match(&self, tx: &PendingTx, features: &TxFeatures) -> Option<Address> {
        let mut best: Option<(Address, usize)> = None;

        for (address, profile) in &self.profiles {
            let score = self.match_score(profile, tx, features);
            if score >= 3 && best.map_or(true, |(_, s)| score > s) {
                best = Some((*address, score));
            }
        }

        best.map(|(address, _)| address)
    }

    fn match_score(&self, profile: &CompetitorProfile, tx: &PendingTx, features: &TxFeatures) -> usize {
        let mut score = 0usize;

        // 가스 가격이 최근 이력 중앙값의 허용 범위 안
        if let Some(median) = gas_median(&profile.gas_history) {
            let tolerance = median * self.config.gas_tolerance_pct / 100.0;
            if (features.gas_price_wei as f64 - median).abs() <= tolerance {
                score += 1;
            }
        }

        // 같은 추론 페어
        if let Some(pair) = &features.pair {
            if profile.pair_counts.contains_key(pair) {
                score += 1;
            }
        }

        // 알려진 시각 패턴의 윈도우 안 (분 버킷 ±1)
        let minute = tx.first_seen.minute() as usize;
        let window = (self.config.timing_window_secs / 60).max(1) as usize;
        let hit = (0..=window).any(|d| {
            profile.minute_activity[(minute + 60 - d) % 60] > 0
                || profile.minute_activity[(minute + d) % 60] > 0
        });
        if hit {
            score += 1;
        }

        // 같은 함수 셀렉터
        if let Some(selector) = features.selector {
            if profile.method_counts.contains_key(&selector_key(selector)) {
                score += 1;
            }
        }

        score
    }

    /// 4개 신호 중 3개 이상이면 봇으로 분류한다
    fn is_bot_like(&self, features: &TxFeatures) -> bool {
        let mut signals = 0usize;

        if features.gas_price_wei >= self.gas_floor_wei {
            signals += 1;
        }
        if features.input_size >= self.config.min_input_bytes {
            signals += 1;
        }
        if features
            .pair
            .as_ref()
            .map_or(false, |p| self.hot_pairs.contains(p))
        {
            signals += 1;
        }
        if features.to_known_router {
            signals += 1;
        }

        signals >= 3
    }

    fn update(&mut self, owner: Address, tx: &PendingTx, features: &TxFeatures) {
        let now = tx.first_seen;
        let profile = self
            .profiles
            .entry(owner)
            .or_insert_with(|| CompetitorProfile::new(owner, now));

        profile.gas_history.push_back(features.gas_price_wei as u64);
        while profile.gas_history.len() > CompetitorProfile::GAS_HISTORY_LIMIT {
            profile.gas_history.pop_front();
        }

        if let Some(pair) = &features.pair {
            *profile.pair_counts.entry(pair.clone()).or_insert(0) += 1;
        }
        if let Some(selector) = features.selector {
            *profile.method_counts.entry(selector_key(selector)).or_insert(0) += 1;
        }

        profile.hourly_activity[now.hour() as usize] += 1;
        profile.daily_activity[now.weekday().num_days_from_monday() as usize] += 1;
        profile.minute_activity[now.minute() as usize] += 1;
        profile.observed_txs += 1;
        profile.touch(now);

        self.recent_hashes.insert(tx.hash, owner);
        self.recent_order.push_back(tx.hash);
        while self.recent_order.len() > RECENT_HASH_LIMIT {
            if let Some(old) = self.recent_order.pop_front() {
                self.recent_hashes.remove(&old);
            }
        }
    }

    /// 추적 중인 트랜잭션의 블록 포함 피드백
    pub fn record_inclusion(&mut self, hash: H256) -> Option<Address> {
        let owner = self.recent_hashes.get(&hash).copied()?;
        if let Some(profile) = self.profiles.get_mut(&owner) {
            profile.included_txs += 1;
        }
        Some(owner)
    }

    /// 주기적 유지보수: 만료 삭제 + 활동 점수 기준 상한 유지
    pub fn maintenance(&mut self, now: DateTime<Utc>) -> (usize, usize) {
        let expiry = chrono::Duration::days(self.config.expiry_days);
        let before = self.profiles.len();
        self.profiles.retain(|_, p| now - p.last_seen <= expiry);
        let expired = before - self.profiles.len();

        let mut trimmed = 0usize;
        if self.profiles.len() > self.config.max_profiles {
            let mut scored: Vec<(Address, f64)> = self
                .profiles
                .iter()
                .map(|(a, p)| (*a, p.activity_score(now)))
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

            let keep: HashSet<Address> = scored
                .iter()
                .take(self.config.max_profiles)
                .map(|(a, _)| *a)
                .collect();
            let before = self.profiles.len();
            self.profiles.retain(|a, _| keep.contains(a));
            trimmed = before - self.profiles.len();
        }

        if expired > 0 || trimmed > 0 {
            info!(
                "🧹 프로파일 정리: 만료 {}개, 상한 초과 {}개 (잔여 {}개)",
                expired,
                trimmed,
                self.profiles.len()
            );
        }

        (expired, trimmed)
    }
}

fn gas_median(history: &VecDeque<u64>) -> Option<f64> {
    if history.is_empty() {
        return None;
    }
    let mut recent: Vec<u64> = history
        .iter()
        .rev()
        .take(GAS_MATCH_WINDOW)
        .copied()
        .collect();
    recent.sort_unstable();
    let mid = recent.len() / 2;
    let median = if recent.len() % 2 == 0 {
        (recent[mid - 1] + recent[mid]) as f64 / 2.0
    } else {
        recent[mid] as f64
    };
    Some(median)
}
