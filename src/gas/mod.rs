pub mod network_state;
pub mod risk_engine;

pub use network_state::{CompetitionTracker, FeeObservation, LiveNetworkStateProvider, NetworkStateProvider};
pub use risk_engine::{spawn_refresh_loop, RiskEngine};
