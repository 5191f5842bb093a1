pub mod cache;
pub mod gateway;
pub mod providers;
pub mod types;

pub use gateway::MarketDataGateway;
pub use providers::{MarketDataProvider, RestProvider, StaticProvider};
pub use types::{Candle, ChainEntry, Greeks, OptionChain, OptionQuote, OptionSide, StockQuote};
