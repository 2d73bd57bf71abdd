pub mod market_mock;
pub mod network_mock;
pub mod reference_mock;
pub mod transport_mock;
pub mod watcher_mock;

pub use market_mock::SyntheticMarketProvider;
pub use network_mock::MockNetworkStateProvider;
pub use reference_mock::{FailingReferenceSource, JitterReferenceSource, StaticReferenceSource};
pub use transport_mock::{MockSigner, MockTransport, RejectingSigner, UnavailableSigner};
pub use watcher_mock::MockBlockWatcher;

use std::env;

/// Check if synthetic market mode is enabled via environment
pub fn is_synthetic_mode() -> bool {
    env::var("MARKET_MODE").unwrap_or_default() == "synthetic"
}

/// 페어 이름에서 결정적 합성 기준가를 만든다
///
/// 합성 공급자와 합성 레퍼런스 소스가 같은 기준가에서 출발해야
/// 검증기의 이탈 필터가 정상 동작한다
pub fn synthetic_base_price(pair: &str) -> f64 {
    let seed: u32 = pair.bytes().map(|b| b as u32).sum();
    1000.0 + (seed % 5000) as f64
}
