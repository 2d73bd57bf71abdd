use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{Address, Bytes, H256, U256};
use tokio::sync::mpsc;
use tracing::info;

use crate::blockchain::provider::MarketDataProvider;
use crate::types::{MarketEvent, PairId, PendingTx, PriceTick};

/// 합성 시장 데이터 공급자
///
/// 네트워크 없이 전체 파이프라인을 돌릴 수 있도록 랜덤워크 틱과
/// 봇처럼 보이는 합성 멤풀 트랜잭션을 만들어낸다.
/// 하류 로직은 라이브 공급자와의 차이를 알 수 없다
pub struct SyntheticMarketProvider {
    pairs: Vec<PairId>,
    router: Address,
    tick_interval: Duration,
}

impl SyntheticMarketProvider {
    pub fn new(pairs: Vec<PairId>, router: Address) -> Self {
        Self {
            pairs,
            router,
            tick_interval: Duration::from_millis(200),
        }
    }

    fn synthetic_pending(router: Address, sequence: u64) -> PendingTx {
        let mut input = vec![0x38, 0xed, 0x17, 0x39];
        input.extend(std::iter::repeat(0u8).take(32 * 8));
        // 페이로드에 약간의 무작위성
        for byte in input.iter_mut().skip(4).take(64) {
            *byte = fastrand::u8(..);
        }

        let gas_gwei = 60 + fastrand::u64(0..80);
        PendingTx {
            hash: H256::from_low_u64_be(fastrand::u64(..)),
            from: Address::from_low_u64_be(fastrand::u64(1..1_000)),
            to: Some(router),
            value: U256::from(fastrand::u64(0..5)) * U256::exp10(18),
            gas_price: U256::from(gas_gwei * 1_000_000_000),
            gas_limit: U256::from(300_000u64 + fastrand::u64(0..200_000)),
            input: Bytes::from(input),
            nonce: sequence,
            first_seen: Utc::now(),
        }
    }
}

#[async_trait]
impl MarketDataProvider for SyntheticMarketProvider {
    async fn subscribe(&self) -> Result<mpsc::Receiver<MarketEvent>> {
        let (sender, receiver) = mpsc::channel(1024);
        let pairs = self.pairs.clone();
        let router = self.router;
        let interval = self.tick_interval;

        tokio::spawn(async move {
            info!("🎭 합성 시장 공급자 시작 (페어 {}개)", pairs.len());

            let mut prices: HashMap<PairId, f64> = pairs
                .iter()
                .map(|p| (p.clone(), crate::mocks::synthetic_base_price(p)))
                .collect();
            let mut sequence = 1u64;

            loop {
                for pair in &pairs {
                    if let Some(price) = prices.get_mut(pair) {
                        // ±0.2% 랜덤워크
                        let step = 1.0 + (fastrand::f64() * 2.0 - 1.0) * 0.002;
                        *price *= step;

                        let tick = PriceTick {
                            venue: "synthetic".to_string(),
                            pair: pair.clone(),
                            price: *price,
                            sequence,
                            received_at: Utc::now(),
                        };
                        if sender.send(MarketEvent::Tick(tick)).await.is_err() {
                            return;
                        }
                    }
                }

                // 가끔 봇처럼 보이는 멤풀 트랜잭션을 섞는다
                if fastrand::f64() < 0.3 {
                    let tx = Self::synthetic_pending(router, sequence);
                    if sender.send(MarketEvent::PendingTx(tx)).await.is_err() {
                        return;
                    }
                }

                sequence += 1;
                tokio::time::sleep(interval).await;
            }
        });

        Ok(receiver)
    }

    fn name(&self) -> &'static str {
        "synthetic"
    }
}
