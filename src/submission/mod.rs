pub mod channels;
pub mod router;
pub mod signer;
pub mod watcher;

pub use channels::{BundleRelayTransport, ChannelTransport, PrivateRelayTransport, PublicRpcTransport};
pub use router::{PlanHandle, SubmissionRouter};
pub use signer::TransactionSigner;
pub use watcher::{BlockWatcher, ObservedBlock, ObservedTx, SharedBlockWatcher};
