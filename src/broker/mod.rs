// =============================================================================
// Broker layer — abstract adapter, Tradovate realization, session pool, and
// symbol resolution
// =============================================================================

pub mod adapter;
pub mod pool;
pub mod symbols;
pub mod tradovate;

pub use adapter::{
    BracketOrderIds, BrokerAdapter, BrokerPosition, OrderRequest, OrderType, PlacedOrder,
    TokenGrant,
};
