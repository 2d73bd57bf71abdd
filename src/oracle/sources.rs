use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::types::{ShieldError, ShieldResult};

/// 외부 레퍼런스 가격 소스
///
/// 각 소스는 독립적으로 실패할 수 있고, 실패는 해당 라운드에서
/// 그 소스를 빼는 것으로 끝난다 (호출 전체를 실패시키지 않는다)
#[async_trait]
pub trait ReferencePriceSource: Send + Sync {
    fn name(&self) -> String;

    async fn get_price(&self, pair: &str) -> ShieldResult<f64>;
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: f64,
}

/// HTTP 기반 레퍼런스 소스
///
/// GET {base_url}/price?pair=BASE%2FQUOTE -> {"price": 3001.2}
pub struct HttpReferenceSource {
    name: String,
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpReferenceSource {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(3),
        }
    }
}

#[async_trait]
impl ReferencePriceSource for HttpReferenceSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn get_price(&self, pair: &str) -> ShieldResult<f64> {
        let url = format!("{}/price", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("pair", pair)])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ShieldError::Network(format!("{}: {}", self.name, e)))?;

        let parsed: PriceResponse = response
            .json()
            .await
            .map_err(|e| ShieldError::Network(format!("{}: {}", self.name, e)))?;

        debug!("레퍼런스 {} {} = {}", self.name, pair, parsed.price);

        if !parsed.price.is_finite() || parsed.price <= 0.0 {
            return Err(ShieldError::Network(format!(
                "{}: 비정상 가격 {}",
                self.name, parsed.price
            )));
        }

        Ok(parsed.price)
    }
}
