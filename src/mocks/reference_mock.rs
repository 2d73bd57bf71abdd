use async_trait::async_trait;

use crate::oracle::ReferencePriceSource;
use crate::types::{ShieldError, ShieldResult};

/// 항상 같은 가격을 돌려주는 레퍼런스 소스
pub struct StaticReferenceSource {
    name: String,
    price: f64,
}

impl StaticReferenceSource {
    pub fn new(name: impl Into<String>, price: f64) -> Self {
        Self { name: name.into(), price }
    }
}

#[async_trait]
impl ReferencePriceSource for StaticReferenceSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn get_price(&self, _pair: &str) -> ShieldResult<f64> {
        Ok(self.price)
    }
}

/// 항상 실패하는 레퍼런스 소스
pub struct FailingReferenceSource {
    name: String,
}

impl FailingReferenceSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl ReferencePriceSource for FailingReferenceSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn get_price(&self, _pair: &str) -> ShieldResult<f64> {
        Err(ShieldError::Network(format!("{}: unavailable", self.name)))
    }
}

/// 기준가 주변에서 흔들리는 합성 레퍼런스 소스
///
/// 고정 기준가를 주거나, 페어별 합성 기준가에 페깅할 수 있다
pub struct JitterReferenceSource {
    name: String,
    base: Option<f64>,
    jitter_pct: f64,
}

impl JitterReferenceSource {
    pub fn new(name: impl Into<String>, base: f64, jitter_pct: f64) -> Self {
        Self { name: name.into(), base: Some(base), jitter_pct }
    }

    /// 합성 시장 공급자와 같은 페어별 기준가를 쓴다
    pub fn pegged(name: impl Into<String>, jitter_pct: f64) -> Self {
        Self { name: name.into(), base: None, jitter_pct }
    }
}

#[async_trait]
impl ReferencePriceSource for JitterReferenceSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn get_price(&self, pair: &str) -> ShieldResult<f64> {
        let base = self
            .base
            .unwrap_or_else(|| crate::mocks::synthetic_base_price(pair));
        let jitter = 1.0 + (fastrand::f64() * 2.0 - 1.0) * self.jitter_pct / 100.0;
        Ok(base * jitter)
    }
}
