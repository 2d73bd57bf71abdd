pub mod connection;
pub mod endpoint;
pub mod provider;
pub mod subscriber;

pub use connection::{Connection, ConnectionManager, WsStream};
pub use endpoint::{Endpoint, EndpointHealth, EndpointPool};
pub use provider::{LiveMarketProvider, MarketDataProvider};
pub use subscriber::EventSubscriber;
