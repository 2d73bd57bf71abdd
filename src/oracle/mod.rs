pub mod sources;
pub mod validator;

pub use sources::{HttpReferenceSource, ReferencePriceSource};
pub use validator::{spawn_staleness_watchdog, PriceValidator};
