pub mod decoy;
pub mod features;
pub mod tracker;

pub use decoy::DecoyGenerator;
pub use features::{is_dex_swap, FeatureContext, TxFeatures};
pub use tracker::CompetitorProfiler;
