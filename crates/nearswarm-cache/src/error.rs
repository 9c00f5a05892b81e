use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store not available: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum MarketDataError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Market data API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Rate limited by market data API after {0} attempts")]
    RateLimited(u32),

    #[error("No market data for {0}")]
    MissingData(String),

    #[error("Unexpected market data payload for {coin}: {source}")]
    Decode {
        coin: String,
        #[source]
        source: serde_json::Error,
    },
}
