use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::submission::watcher::{BlockWatcher, ObservedBlock, ObservedTx};
use crate::types::ShieldResult;

/// 스크립트된 블록을 순서대로 내주는 블록 관측자
///
/// 큐가 비면 다음 블록이 올 때까지 영원히 대기한다
pub struct MockBlockWatcher {
    current: AtomicU64,
    queue: Mutex<VecDeque<ObservedBlock>>,
}

impl MockBlockWatcher {
    pub fn new(current_block: u64) -> Self {
        Self {
            current: AtomicU64::new(current_block),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_block(&self, block: ObservedBlock) {
        self.queue.lock().expect("lock").push_back(block);
    }

    /// 트랜잭션 없는 블록 n개를 이어붙인다
    pub fn push_empty_blocks(&self, count: u64) {
        let mut queue = self.queue.lock().expect("lock");
        let start = self.current.load(Ordering::SeqCst);
        let offset = queue.len() as u64;
        for i in 0..count {
            queue.push_back(ObservedBlock {
                number: start + offset + i + 1,
                txs: Vec::<ObservedTx>::new(),
            });
        }
    }
}

#[async_trait]
impl BlockWatcher for MockBlockWatcher {
    async fn current_block(&self) -> ShieldResult<u64> {
        Ok(self.current.load(Ordering::SeqCst))
    }

    async fn next_block(&self) -> ShieldResult<ObservedBlock> {
        loop {
            if let Some(block) = self.queue.lock().expect("lock").pop_front() {
                return Ok(block);
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}
