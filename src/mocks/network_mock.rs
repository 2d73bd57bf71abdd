use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use ethers::types::U256;

use crate::gas::network_state::{FeeObservation, NetworkStateProvider};
use crate::types::ShieldResult;

/// 고정 수수료를 돌려주는 네트워크 상태 공급자
pub struct MockNetworkStateProvider {
    base_fee: Option<u64>,
    priority_fee: u64,
    gas_price: u64,
    fetches: AtomicUsize,
}

impl MockNetworkStateProvider {
    pub fn eip1559(base_fee_wei: u64, priority_fee_wei: u64) -> Self {
        Self {
            base_fee: Some(base_fee_wei),
            priority_fee: priority_fee_wei,
            gas_price: base_fee_wei + priority_fee_wei,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn legacy(gas_price_wei: u64) -> Self {
        Self {
            base_fee: None,
            priority_fee: 0,
            gas_price: gas_price_wei,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkStateProvider for MockNetworkStateProvider {
    async fn fetch_fees(&self, _chain_id: u64) -> ShieldResult<FeeObservation> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(FeeObservation {
            base_fee: self.base_fee.map(U256::from),
            priority_fee: U256::from(self.priority_fee),
            gas_price: U256::from(self.gas_price),
        })
    }
}
