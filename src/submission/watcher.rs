use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::blockchain::ConnectionManager;
use crate::profiler::features::FeatureContext;
use crate::types::{PairId, ShieldError, ShieldResult};

/// 블록에 포함된 트랜잭션 관측치
#[derive(Debug, Clone)]
pub struct ObservedTx {
    pub hash: H256,
    pub from: Address,
    pub gas_price: U256,
    /// 호출 데이터에서 추론한 페어 (추론 불가면 None)
    pub pair: Option<PairId>,
    /// 블록 내 위치
    pub index: usize,
}

/// 관측된 블록 하나
#[derive(Debug, Clone)]
pub struct ObservedBlock {
    pub number: u64,
    pub txs: Vec<ObservedTx>,
}

/// 블록 관측 능력. Router의 포함/선점 감시가 이 위에서 돈다
#[async_trait]
pub trait BlockWatcher: Send + Sync {
    /// 현재 블록 번호
    async fn current_block(&self) -> ShieldResult<u64>;

    /// 다음 새 블록을 기다린다
    async fn next_block(&self) -> ShieldResult<ObservedBlock>;
}

/// 폴링 한 번으로 모든 구독자에게 블록을 뿌리는 공유 관측자
///
/// 계획별 감시 태스크와 프로파일러 포함 피드백이 같은 블록 스트림을
/// 중복 조회 없이 나눠 본다
pub struct SharedBlockWatcher {
    manager: Arc<ConnectionManager>,
    current: Arc<AtomicU64>,
    sender: broadcast::Sender<ObservedBlock>,
}

impl SharedBlockWatcher {
    /// 폴링 태스크를 띄우고 핸들을 돌려준다
    pub fn spawn(
        manager: Arc<ConnectionManager>,
        context: FeatureContext,
        block_time_secs: u64,
    ) -> Arc<Self> {
        let (sender, _) = broadcast::channel(64);
        let watcher = Arc::new(Self {
            manager: Arc::clone(&manager),
            current: Arc::new(AtomicU64::new(0)),
            sender: sender.clone(),
        });

        let current = Arc::clone(&watcher.current);
        let poll_interval = Duration::from_secs((block_time_secs / 4).max(1));

        tokio::spawn(async move {
            let mut last_seen = 0u64;
            loop {
                match Self::poll_once(&manager, &context, last_seen).await {
                    Ok(Some(block)) => {
                        last_seen = block.number;
                        current.store(block.number, Ordering::SeqCst);
                        debug!("🧱 새 블록: {} (tx {}건)", block.number, block.txs.len());
                        // 구독자가 없어도 폴링은 계속한다
                        let _ = sender.send(block);
                    }
                    Ok(None) => {}
                    Err(e) => warn!("⚠️ 블록 폴링 실패: {}", e),
                }
                tokio::time::sleep(poll_interval).await;
            }
        });

        watcher
    }

    /// 포함 피드백 등 별도 소비자를 위한 직접 구독
    pub fn subscribe(&self) -> broadcast::Receiver<ObservedBlock> {
        self.sender.subscribe()
    }

    async fn poll_once(
        manager: &ConnectionManager,
        context: &FeatureContext,
        last_seen: u64,
    ) -> ShieldResult<Option<ObservedBlock>> {
        let result = manager.rpc_call("eth_blockNumber", json!([])).await?;
        let number = parse_hex_u64(&result)
            .ok_or_else(|| ShieldError::Network("블록 번호 파싱 실패".to_string()))?;
        if number <= last_seen {
            return Ok(None);
        }

        let block = manager
            .rpc_call("eth_getBlockByNumber", json!([format!("0x{:x}", number), true]))
            .await?;
        Ok(parse_block(context, &block))
    }
}

#[async_trait]
impl BlockWatcher for SharedBlockWatcher {
    async fn current_block(&self) -> ShieldResult<u64> {
        let cached = self.current.load(Ordering::SeqCst);
        if cached > 0 {
            return Ok(cached);
        }
        // 폴링이 아직 한 바퀴 돌기 전이면 직접 조회
        let result = self.manager.rpc_call("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&result)
            .ok_or_else(|| ShieldError::Network("블록 번호 파싱 실패".to_string()))
    }

    async fn next_block(&self) -> ShieldResult<ObservedBlock> {
        let mut receiver = self.sender.subscribe();
        loop {
            match receiver.recv().await {
                Ok(block) => return Ok(block),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("⚠️ 블록 관측 지연: {}블록 건너뜀", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ShieldError::Network("블록 폴링 태스크 종료".to_string()));
                }
            }
        }
    }
}

fn parse_hex_u64(value: &Value) -> Option<u64> {
    let s = value.as_str()?;
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(stripped, 16).ok()
}

fn parse_hex_u256(value: &Value) -> Option<U256> {
    let s = value.as_str()?;
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    U256::from_str_radix(stripped, 16).ok()
}

fn parse_block(context: &FeatureContext, block: &Value) -> Option<ObservedBlock> {
    let number = block.get("number").and_then(parse_hex_u64)?;
    let txs = block
        .get("transactions")
        .and_then(|t| t.as_array())
        .map(|list| {
            list.iter()
                .enumerate()
                .filter_map(|(index, tx)| {
                    let hash: H256 = tx.get("hash")?.as_str()?.parse().ok()?;
                    let from: Address = tx.get("from")?.as_str()?.parse().ok()?;
                    let to: Option<Address> =
                        tx.get("to").and_then(|t| t.as_str()).and_then(|s| s.parse().ok());
                    let input = tx
                        .get("input")
                        .and_then(|i| i.as_str())
                        .map(|s| s.strip_prefix("0x").unwrap_or(s))
                        .and_then(|s| hex::decode(s).ok())
                        .unwrap_or_default();
                    let gas_price = tx
                        .get("gasPrice")
                        .and_then(parse_hex_u256)
                        .or_else(|| tx.get("maxFeePerGas").and_then(parse_hex_u256))
                        .unwrap_or_default();

                    Some(ObservedTx {
                        hash,
                        from,
                        gas_price,
                        pair: context.infer_pair(to, &input),
                        index,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Some(ObservedBlock { number, txs })
}
