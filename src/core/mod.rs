pub mod engine;

pub use engine::{ShieldCore, ShieldStatus};
