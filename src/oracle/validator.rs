use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ValidatorConfig;
use crate::oracle::sources::ReferencePriceSource;
use crate::types::{PairId, PriceSnapshot, PriceTick, StalenessAlert};

/// 집계 라운드의 기여 소스 하나
#[derive(Debug, Clone)]
struct Contributor {
    name: String,
    price: f64,
    weight: f64,
}

/// 페어별 롤링 상태
struct PairWindow {
    /// 검증된 가격 이력 (오래된 것부터 퇴출)
    history: VecDeque<f64>,
    last_sequence: u64,
    has_snapshot: bool,
}

impl PairWindow {
    fn new() -> Self {
        Self { history: VecDeque::new(), last_sequence: 0, has_snapshot: false }
    }
}

/// 가격 검증/집계기
///
/// 원시 틱과 레퍼런스 소스를 합쳐 신뢰할 수 있는 스냅샷을 만든다.
/// 근거가 부족한 라운드는 에러가 아니라 조용한 틱으로 처리된다
pub struct PriceValidator {
    config: ValidatorConfig,
    sources: Vec<Arc<dyn ReferencePriceSource>>,
    windows: HashMap<PairId, PairWindow>,
    /// 정체 감시 태스크와 공유하는 페어별 최종 갱신 시각
    last_updates: Arc<DashMap<PairId, DateTime<Utc>>>,
}

impl PriceValidator {
    pub fn new(config: ValidatorConfig, sources: Vec<Arc<dyn ReferencePriceSource>>) -> Self {
        Self {
            config,
            sources,
            windows: HashMap::new(),
            last_updates: Arc::new(DashMap::new()),
        }
    }

    pub fn last_updates(&self) -> Arc<DashMap<PairId, DateTime<Utc>>> {
        Arc::clone(&self.last_updates)
    }

    /// 틱 하나를 소비해 검증된 스냅샷을 만든다
    ///
    /// None은 "이번 라운드는 근거 부족"이라는 정상 결과다
    pub async fn ingest(&mut self, tick: PriceTick) -> Option<PriceSnapshot> {
        let pair = tick.pair.clone();
        let tolerance = self.config.reorder_tolerance;

        {
            let window = self.windows.entry(pair.clone()).or_insert_with(PairWindow::new);

            // 허용 범위를 넘어 늦게 도착한 틱은 병합하지 않고 버린다
            if window.has_snapshot
                && tick.sequence.saturating_add(tolerance) < window.last_sequence
            {
                debug!(
                    "역순 틱 폐기: {} seq {} < last {} (tolerance {})",
                    pair, tick.sequence, window.last_sequence, tolerance
                );
                return None;
            }
        }

        // 레퍼런스 소스는 각자 실패할 수 있다. 실패한 소스만 이번 라운드에서 빠진다
        let queries = self.sources.iter().map(|source| {
            let pair = pair.clone();
            let source = Arc::clone(source);
            async move { (source.name(), source.get_price(&pair).await) }
        });

        let mut contributors = vec![Contributor {
            name: format!("onchain:{}", tick.venue),
            price: tick.price,
            weight: 1.0,
        }];

        for (name, result) in join_all(queries).await {
            match result {
                Ok(price) => contributors.push(Contributor {
                    name,
                    price,
                    weight: self.config.reference_weight,
                }),
                Err(e) => warn!("⚠️ 레퍼런스 소스 제외 ({}): {}", name, e),
            }
        }

        let survivors = filter_outliers(&contributors);
        if survivors.len() < self.config.min_sources {
            debug!(
                "스냅샷 없음: {} 생존 소스 {} < {}",
                pair,
                survivors.len(),
                self.config.min_sources
            );
            return None;
        }

        let price = weighted_mean(&survivors);
        let std_dev = population_std(&survivors.iter().map(|c| c.price).collect::<Vec<_>>());

        let now = Utc::now();
        let window = self.windows.entry(pair.clone()).or_insert_with(PairWindow::new);

        window.history.push_back(price);
        while window.history.len() > self.config.history_limit {
            window.history.pop_front();
        }

        // 스냅샷 시퀀스는 페어 안에서 단조 비감소
        let sequence = tick.sequence.max(window.last_sequence);
        window.last_sequence = sequence;
        window.has_snapshot = true;

        self.last_updates.insert(pair.clone(), now);

        let volatility = log_return_volatility(&window.history);

        let snapshot = PriceSnapshot {
            pair,
            price,
            source_count: survivors.len(),
            std_dev,
            volatility,
            sequence,
            valid_until: now + ChronoDuration::seconds(self.config.snapshot_validity_secs as i64),
            created_at: now,
        };

        debug!(
            "📸 스냅샷: {} price={:.4} sources={} σ={:.4} vol={:.6}",
            snapshot.pair, snapshot.price, snapshot.source_count, snapshot.std_dev, snapshot.volatility
        );

        Some(snapshot)
    }
}

/// 중앙값에서 2σ 넘게 벗어난 기여 소스를 제거한다
///
/// 소스가 두 개뿐이면 수학적으로 아무것도 걸러지지 않는다
fn filter_outliers(contributors: &[Contributor]) -> Vec<Contributor> {
    if contributors.len() < 3 {
        return contributors.to_vec();
    }

    let prices: Vec<f64> = contributors.iter().map(|c| c.price).collect();
    let med = median(&prices);
    let sigma = population_std(&prices);
    if sigma == 0.0 {
        return contributors.to_vec();
    }

    contributors
        .iter()
        .filter(|c| (c.price - med).abs() <= 2.0 * sigma)
        .cloned()
        .collect()
}

fn weighted_mean(contributors: &[Contributor]) -> f64 {
    let total_weight: f64 = contributors.iter().map(|c| c.weight).sum();
    let weighted_sum: f64 = contributors.iter().map(|c| c.price * c.weight).sum();
    weighted_sum / total_weight
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// 모표준편차
fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// 롤링 윈도우 로그수익률의 표준편차
fn log_return_volatility(history: &VecDeque<f64>) -> f64 {
    if history.len() < 2 {
        return 0.0;
    }
    let returns: Vec<f64> = history
        .iter()
        .zip(history.iter().skip(1))
        .filter(|(prev, next)| **prev > 0.0 && **next > 0.0)
        .map(|(prev, next)| (next / prev).ln())
        .collect();
    population_std(&returns)
}

/// 정체 감시 태스크
///
/// 틱 간격이 자연히 긴 것과 무관하게, 설정 윈도우를 넘는 무갱신을
/// 명시적 알림으로 내보낸다. 갱신이 재개될 때까지 한 번만 알린다
pub fn spawn_staleness_watchdog(
    pairs: Vec<PairId>,
    last_updates: Arc<DashMap<PairId, DateTime<Utc>>>,
    staleness_secs: u64,
    alerts: mpsc::Sender<StalenessAlert>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut alerted: HashMap<PairId, DateTime<Utc>> = HashMap::new();
        let poll = std::time::Duration::from_secs((staleness_secs / 4).max(1));

        loop {
            tokio::time::sleep(poll).await;
            if alerts.is_closed() {
                break;
            }

            let now = Utc::now();
            for pair in &pairs {
                let last = match last_updates.get(pair) {
                    Some(entry) => *entry.value(),
                    None => continue,
                };

                let silent = (now - last).num_seconds().max(0) as u64;
                if silent < staleness_secs {
                    alerted.remove(pair);
                    continue;
                }

                // 같은 정체 구간에 대해서는 한 번만 알린다
                if alerted.get(pair) == Some(&last) {
                    continue;
                }
                alerted.insert(pair.clone(), last);

                info!("⏳ 가격 정체: {} ({}초 무갱신)", pair, silent);
                let alert = StalenessAlert {
                    pair: pair.clone(),
                    last_update: last,
                    silent_for_secs: silent,
                };
                if alerts.send(alert).await.is_err() {
                    return;
                }
            }
        }
    })
}
