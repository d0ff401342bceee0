pub mod index;
pub mod resolver;

pub use index::{
    IndexError, Instrument, InstrumentIndex, InstrumentIndexConfig, CACHE_TTL_SECS,
    INSTRUMENT_FEED_URL,
};
pub use resolver::{ResolvedSymbol, SymbolResolver};
