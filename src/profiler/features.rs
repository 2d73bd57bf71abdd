use std::collections::{HashMap, HashSet};

use ethers::types::Address;
use once_cell::sync::Lazy;

use crate::config::Config;
use crate::types::{PairId, PendingTx};

/// DEX 스왑 함수 셀렉터들
pub static SWAP_SELECTORS: Lazy<HashSet<[u8; 4]>> = Lazy::new(|| {
    let mut selectors = HashSet::new();
    selectors.insert([0x38, 0xed, 0x17, 0x39]); // swapExactTokensForTokens
    selectors.insert([0x88, 0x03, 0xdb, 0xee]); // swapTokensForExactTokens
    selectors.insert([0x4a, 0x25, 0xd9, 0x4d]); // swapExactTokensForETH
    selectors.insert([0x18, 0xcb, 0x50, 0x15]); // swapExactTokensForETHSupportingFee
    selectors.insert([0x41, 0x4b, 0xf3, 0x89]); // exactInputSingle (V3)
    selectors
});

/// 관측 트랜잭션에서 뽑는 특징 튜플
#[derive(Debug, Clone)]
pub struct TxFeatures {
    pub gas_price_wei: u128,
    pub gas_limit: u128,
    pub input_size: usize,
    pub selector: Option<[u8; 4]>,
    pub pair: Option<PairId>,
    pub to_known_router: bool,
}

/// 주소/페어 해석에 필요한 정적 맥락
///
/// 설정에서 한 번 만들어 프로파일러와 블록 관측자가 공유한다
#[derive(Debug, Clone)]
pub struct FeatureContext {
    routers: HashSet<Address>,
    token_symbols: HashMap<Address, String>,
    known_pairs: HashSet<PairId>,
}

impl FeatureContext {
    pub fn from_config(config: &Config) -> Self {
        let routers = config
            .profiler
            .dex_routers
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();

        let token_symbols = config
            .tokens
            .iter()
            .filter_map(|(symbol, address)| {
                address.parse().ok().map(|a: Address| (a, symbol.clone()))
            })
            .collect();

        let known_pairs = config
            .pairs
            .iter()
            .chain(config.profiler.hot_pairs.iter())
            .cloned()
            .collect();

        Self { routers, token_symbols, known_pairs }
    }

    pub fn is_known_router(&self, to: Option<Address>) -> bool {
        to.map_or(false, |a| self.routers.contains(&a))
    }

    /// 호출 데이터에서 페어를 추론한다
    ///
    /// 라우터 호출의 32바이트 워드 중 주소 모양(상위 12바이트가 0)인 것을
    /// 알려진 토큰 심볼로 해석해 처음 두 개를 페어로 삼는다
    pub fn infer_pair(&self, to: Option<Address>, input: &[u8]) -> Option<PairId> {
        if !self.is_known_router(to) || input.len() < 4 {
            return None;
        }

        let mut symbols: Vec<String> = Vec::new();
        let words = input[4..].chunks_exact(32);
        for word in words {
            if word[..12].iter().any(|b| *b != 0) {
                continue;
            }
            let address = Address::from_slice(&word[12..]);
            if let Some(symbol) = self.token_symbols.get(&address) {
                if !symbols.contains(symbol) {
                    symbols.push(symbol.clone());
                    if symbols.len() == 2 {
                        break;
                    }
                }
            }
        }

        if symbols.len() < 2 {
            return None;
        }

        // 설정에 등록된 표기 방향을 우선한다
        let forward = format!("{}/{}", symbols[0], symbols[1]);
        let reverse = format!("{}/{}", symbols[1], symbols[0]);
        if self.known_pairs.contains(&forward) {
            Some(forward)
        } else if self.known_pairs.contains(&reverse) {
            Some(reverse)
        } else {
            Some(forward)
        }
    }

    pub fn extract(&self, tx: &PendingTx) -> TxFeatures {
        let selector = tx.method_selector();
        TxFeatures {
            gas_price_wei: tx.gas_price.as_u128(),
            gas_limit: tx.gas_limit.as_u128(),
            input_size: tx.input.len(),
            selector,
            pair: self.infer_pair(tx.to, tx.input.as_ref()),
            to_known_router: self.is_known_router(tx.to),
        }
    }
}

/// 트랜잭션이 DEX 스왑 호출인지 확인한다
pub fn is_dex_swap(context: &FeatureContext, tx: &PendingTx) -> bool {
    if !context.is_known_router(tx.to) {
        return false;
    }
    match tx.method_selector() {
        Some(selector) => SWAP_SELECTORS.contains(&selector),
        None => false,
    }
}

/// 셀렉터를 저장 키용 hex 문자열로
pub fn selector_key(selector: [u8; 4]) -> String {
    hex::encode(selector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ethers::types::{Bytes, H256, U256};

    fn context() -> FeatureContext {
        let mut config = Config::default();
        config.tokens.insert(
            "WETH".to_string(),
            "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2".to_string(),
        );
        config.tokens.insert(
            "USDC".to_string(),
            "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".to_string(),
        );
        FeatureContext::from_config(&config)
    }

    fn swap_input(token_a: &str, token_b: &str) -> Vec<u8> {
        let mut input = vec![0x38, 0xed, 0x17, 0x39];
        for token in [token_a, token_b] {
            let address: Address = token.parse().expect("주소");
            let mut word = [0u8; 32];
            word[12..].copy_from_slice(address.as_bytes());
            input.extend_from_slice(&word);
        }
        input
    }

    fn pending(to: Option<Address>, input: Vec<u8>) -> PendingTx {
        PendingTx {
            hash: H256::zero(),
            from: Address::zero(),
            to,
            value: U256::zero(),
            gas_price: U256::from(80_000_000_000u64),
            gas_limit: U256::from(400_000u64),
            input: Bytes::from(input),
            nonce: 0,
            first_seen: Utc::now(),
        }
    }

    #[test]
    fn test_infer_pair_uses_registered_orientation() {
        let ctx = context();
        let router: Address =
            "0x7a250d5630B4cF539739dF2C5dAcb4c659F2488D".parse().expect("주소");

        // USDC -> WETH 경로라도 등록 표기인 WETH/USDC로 해석한다
        let input = swap_input(
            "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48",
            "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2",
        );
        let pair = ctx.infer_pair(Some(router), &input);
        assert_eq!(pair.as_deref(), Some("WETH/USDC"));
    }

    #[test]
    fn test_infer_pair_requires_known_router() {
        let ctx = context();
        let input = swap_input(
            "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48",
            "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2",
        );
        assert!(ctx.infer_pair(Some(Address::zero()), &input).is_none());
        assert!(ctx.infer_pair(None, &input).is_none());
    }

    #[test]
    fn test_is_dex_swap_checks_selector() {
        let ctx = context();
        let router: Address =
            "0x7a250d5630B4cF539739dF2C5dAcb4c659F2488D".parse().expect("주소");

        let swap = pending(Some(router), vec![0x38, 0xed, 0x17, 0x39]);
        assert!(is_dex_swap(&ctx, &swap));

        let transfer = pending(Some(router), vec![0xa9, 0x05, 0x9c, 0xbb]);
        assert!(!is_dex_swap(&ctx, &transfer));
    }
}
