use ethers::types::U256;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use crate::config::DecoyConfig;
use crate::types::TxRequest;

/// 교란 트랜잭션 생성기
///
/// 실물 트랜잭션의 가치/수수료/제출 시점을 흔든 복제본을 만들어
/// 관찰자가 실물의 의도를 읽기 어렵게 한다. 복제본은 내부 플래그로
/// 표시되어 Router가 정산 트랜잭션과 혼동하지 않는다
pub struct DecoyGenerator {
    config: DecoyConfig,
}

impl DecoyGenerator {
    pub fn new(config: DecoyConfig) -> Self {
        Self { config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// 실물 하나를 받아 실물 + 교란본들을 섞인 순서로 돌려준다
    pub fn generate(&self, real: &TxRequest) -> Vec<TxRequest> {
        let mut real = real.clone();
        real.decoy = false;

        if !self.config.enabled {
            return vec![real];
        }

        let mut rng = rand::thread_rng();
        let count = rng.gen_range(self.config.min_count..=self.config.max_count);

        let mut batch = Vec::with_capacity(count + 1);
        for _ in 0..count {
            let mut decoy = real.clone();
            decoy.decoy = true;
            // 가치 ±20%, 수수료 ±10%
            decoy.value = perturb(real.value, 0.20, &mut rng);
            decoy.max_fee = perturb(real.max_fee, 0.10, &mut rng);
            decoy.priority_fee = perturb(real.priority_fee, 0.10, &mut rng);
            decoy.submit_delay_ms = rng.gen_range(0..=self.config.max_delay_ms);
            batch.push(decoy);
        }
        batch.push(real);

        // 관찰자가 제출 순서로 실물을 찍지 못하게 섞는다
        batch.shuffle(&mut rng);

        debug!("🎭 교란본 {}개 생성", count);
        batch
    }
}

fn perturb<R: Rng>(value: U256, spread: f64, rng: &mut R) -> U256 {
    let factor = 1.0 + rng.gen_range(-spread..=spread);
    U256::from((value.as_u128() as f64 * factor) as u128)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use ethers::types::{Address, Bytes};

    fn real_request() -> TxRequest {
        TxRequest {
            chain_id: 1,
            pair: "WETH/USDC".to_string(),
            to: Address::zero(),
            value: U256::exp10(18),
            input: Bytes::from(vec![0x38, 0xed, 0x17, 0x39]),
            gas_limit: U256::from(250_000u64),
            max_fee: U256::from(62_000_000_000u64),
            priority_fee: U256::from(2_000_000_000u64),
            nonce: 1,
            decoy: false,
            submit_delay_ms: 0,
        }
    }

    fn enabled_generator() -> DecoyGenerator {
        let mut config = Config::default().profiler.decoy;
        config.enabled = true;
        DecoyGenerator::new(config)
    }

    #[test]
    fn test_disabled_returns_only_real() {
        let generator = DecoyGenerator::new(Config::default().profiler.decoy);
        let batch = generator.generate(&real_request());
        assert_eq!(batch.len(), 1);
        assert!(!batch[0].decoy);
    }

    #[test]
    fn test_batch_contains_exactly_one_real_within_bounds() {
        let generator = enabled_generator();
        for _ in 0..50 {
            let batch = generator.generate(&real_request());
            // 교란본 1~3개 + 실물 1개
            assert!(batch.len() >= 2 && batch.len() <= 4, "len={}", batch.len());
            assert_eq!(batch.iter().filter(|t| !t.decoy).count(), 1);
        }
    }

    #[test]
    fn test_perturbation_stays_in_band() {
        let generator = enabled_generator();
        let real = real_request();

        for _ in 0..50 {
            for decoy in generator.generate(&real).into_iter().filter(|t| t.decoy) {
                let value = decoy.value.as_u128() as f64;
                let base_value = real.value.as_u128() as f64;
                assert!(value >= base_value * 0.79 && value <= base_value * 1.21);

                let fee = decoy.max_fee.as_u128() as f64;
                let base_fee = real.max_fee.as_u128() as f64;
                assert!(fee >= base_fee * 0.89 && fee <= base_fee * 1.11);

                assert!(decoy.submit_delay_ms <= 3000);
            }
        }
    }

    #[test]
    fn test_real_keeps_original_parameters() {
        let generator = enabled_generator();
        let real = real_request();
        let batch = generator.generate(&real);

        let kept = batch.iter().find(|t| !t.decoy).expect("실물 기대");
        assert_eq!(kept.value, real.value);
        assert_eq!(kept.max_fee, real.max_fee);
        assert_eq!(kept.nonce, real.nonce);
    }
}
