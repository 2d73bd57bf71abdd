use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::blockchain::provider::MarketDataProvider;
use crate::types::{MarketEvent, PendingTx, PriceTick};

/// 이벤트 구독기
///
/// 공급자의 원시 이벤트 스트림을 가격 틱과 멤풀 피드로 분배한다.
/// 공급자가 내부에서 몇 번을 재연결하든 여기서는 끊김이 보이지 않는다
pub struct EventSubscriber;

impl EventSubscriber {
    pub async fn start(
        provider: Arc<dyn MarketDataProvider>,
    ) -> Result<(mpsc::Receiver<PriceTick>, mpsc::Receiver<PendingTx>)> {
        info!("📡 이벤트 구독 시작 (공급자: {})", provider.name());

        let mut events = provider.subscribe().await?;
        let (tick_sender, tick_receiver) = mpsc::channel(1024);
        let (pending_sender, pending_receiver) = mpsc::channel(1024);

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    MarketEvent::Tick(tick) => {
                        let _ = tick_sender.send(tick).await;
                    }
                    MarketEvent::PendingTx(tx) => {
                        let _ = pending_sender.send(tx).await;
                    }
                }

                if tick_sender.is_closed() && pending_sender.is_closed() {
                    break;
                }
            }
            debug!("이벤트 분배 태스크 종료");
        });

        Ok((tick_receiver, pending_receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use ethers::types::{Address, Bytes, H256, U256};

    struct ScriptedProvider {
        events: Vec<MarketEvent>,
    }

    #[async_trait]
    impl MarketDataProvider for ScriptedProvider {
        async fn subscribe(&self) -> Result<mpsc::Receiver<MarketEvent>> {
            let (sender, receiver) = mpsc::channel(16);
            for event in self.events.clone() {
                sender.send(event).await.expect("send");
            }
            Ok(receiver)
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn tick(seq: u64) -> PriceTick {
        PriceTick {
            venue: "uniswap_v2".to_string(),
            pair: "WETH/USDC".to_string(),
            price: 3000.0,
            sequence: seq,
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_events_are_demuxed() {
        let pending = PendingTx {
            hash: H256::zero(),
            from: Address::zero(),
            to: None,
            value: U256::zero(),
            gas_price: U256::zero(),
            gas_limit: U256::zero(),
            input: Bytes::new(),
            nonce: 0,
            first_seen: Utc::now(),
        };
        let provider = Arc::new(ScriptedProvider {
            events: vec![
                MarketEvent::Tick(tick(1)),
                MarketEvent::PendingTx(pending),
                MarketEvent::Tick(tick(2)),
            ],
        });

        let (mut ticks, mut txs) = EventSubscriber::start(provider).await.expect("start");

        assert_eq!(ticks.recv().await.map(|t| t.sequence), Some(1));
        assert_eq!(ticks.recv().await.map(|t| t.sequence), Some(2));
        assert!(txs.recv().await.is_some());
    }
}
