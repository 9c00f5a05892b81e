pub mod error;
pub mod ledger;
pub mod market;
pub mod memory;
pub mod rate_limit;
pub mod reputation;

pub use error::{CacheError, MarketDataError};
pub use ledger::ReputationLedger;
pub use market::{MarketContext, MarketDataClient, TokenQuote, Trend, Volatility};
pub use memory::TtlCache;
pub use rate_limit::RateLimiter;
pub use reputation::ReputationStore;
