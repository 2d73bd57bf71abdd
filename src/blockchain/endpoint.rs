use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::config::{EndpointKind, NetworkConfig};
use crate::constants::ENDPOINT_DEAD_AFTER_FAILURES;

/// 엔드포인트 건강 상태
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum EndpointHealth {
    Healthy,
    Degraded,
    Dead,
}

/// RPC/스트리밍 엔드포인트 레코드
///
/// 기동 시 설정에서 로드되고 Connection Manager만 상태를 바꾼다.
/// 삭제되지 않고 dead로 마킹되어 건너뛰어질 뿐이다
#[derive(Debug, Clone, Serialize)]
pub struct Endpoint {
    pub url: String,
    pub kind: EndpointKind,
    pub health: EndpointHealth,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
}

/// 우선순위 순서를 유지하는 엔드포인트 풀
///
/// 건강 테이블은 재연결 루프와 활성 리더가 동시에 갱신하는 유일한
/// 공유 상태라서 키 단위 배타 갱신(DashMap 엔트리 락)으로만 만진다
pub struct EndpointPool {
    table: DashMap<String, Endpoint>,
    order: Vec<String>,
}

impl EndpointPool {
    pub fn from_network(network: &NetworkConfig) -> Self {
        let table = DashMap::new();
        let mut order = Vec::with_capacity(network.endpoints.len());
        for ep in &network.endpoints {
            order.push(ep.url.clone());
            table.insert(
                ep.url.clone(),
                Endpoint {
                    url: ep.url.clone(),
                    kind: ep.kind,
                    health: EndpointHealth::Healthy,
                    consecutive_failures: 0,
                    last_success: None,
                },
            );
        }
        Self { table, order }
    }

    /// 연결 성공 보고. 실패 카운터와 건강 상태를 초기화한다
    pub fn record_success(&self, url: &str) {
        if let Some(mut entry) = self.table.get_mut(url) {
            entry.health = EndpointHealth::Healthy;
            entry.consecutive_failures = 0;
            entry.last_success = Some(Utc::now());
        }
    }

    /// 연결 실패 보고. 임계치를 넘으면 dead로 마킹한다
    pub fn record_failure(&self, url: &str) {
        if let Some(mut entry) = self.table.get_mut(url) {
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            entry.health = if entry.consecutive_failures >= ENDPOINT_DEAD_AFTER_FAILURES {
                EndpointHealth::Dead
            } else {
                EndpointHealth::Degraded
            };
        }
    }

    /// dead가 아닌 엔드포인트를 우선순위 순서로 반환
    pub fn candidates(&self, kind: Option<EndpointKind>) -> Vec<Endpoint> {
        self.order
            .iter()
            .filter_map(|url| self.table.get(url).map(|e| e.value().clone()))
            .filter(|e| e.health != EndpointHealth::Dead)
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .collect()
    }

    pub fn has_alive(&self) -> bool {
        self.table.iter().any(|e| e.health != EndpointHealth::Dead)
    }

    /// 전면 장애 보고 후 재시도를 위해 dead 엔드포인트를 degraded로 되돌린다.
    /// 백그라운드 재연결 루프만 호출한다
    pub fn revive_dead(&self) {
        for mut entry in self.table.iter_mut() {
            if entry.health == EndpointHealth::Dead {
                entry.health = EndpointHealth::Degraded;
                entry.consecutive_failures = 0;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// 상태 API용 스냅샷
    pub fn snapshot(&self) -> Vec<Endpoint> {
        self.order
            .iter()
            .filter_map(|url| self.table.get(url).map(|e| e.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, EndpointConfig};

    fn pool_with(urls: &[&str]) -> EndpointPool {
        let mut network = Config::default().networks[0].clone();
        network.endpoints = urls
            .iter()
            .map(|u| EndpointConfig { url: u.to_string(), kind: EndpointKind::Rpc })
            .collect();
        EndpointPool::from_network(&network)
    }

    #[test]
    fn test_candidates_preserve_priority_order() {
        let pool = pool_with(&["http://primary", "http://backup1", "http://backup2"]);
        let candidates = pool.candidates(None);
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].url, "http://primary");
        assert_eq!(candidates[2].url, "http://backup2");
    }

    #[test]
    fn test_failures_mark_dead_and_skip() {
        let pool = pool_with(&["http://primary", "http://backup"]);

        for _ in 0..ENDPOINT_DEAD_AFTER_FAILURES {
            pool.record_failure("http://primary");
        }

        let candidates = pool.candidates(None);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].url, "http://backup");
        assert!(pool.has_alive());

        // dead여도 레코드는 남아 있다
        assert_eq!(pool.snapshot().len(), 2);
    }

    #[test]
    fn test_success_resets_failures() {
        let pool = pool_with(&["http://primary"]);
        pool.record_failure("http://primary");
        pool.record_failure("http://primary");
        pool.record_success("http://primary");

        let snap = pool.snapshot();
        assert_eq!(snap[0].health, EndpointHealth::Healthy);
        assert_eq!(snap[0].consecutive_failures, 0);
        assert!(snap[0].last_success.is_some());
    }

    #[test]
    fn test_revive_dead_after_total_outage() {
        let pool = pool_with(&["http://a", "http://b"]);
        for url in ["http://a", "http://b"] {
            for _ in 0..ENDPOINT_DEAD_AFTER_FAILURES {
                pool.record_failure(url);
            }
        }
        assert!(!pool.has_alive());

        pool.revive_dead();
        assert!(pool.has_alive());
        assert_eq!(pool.candidates(None).len(), 2);
    }
}
