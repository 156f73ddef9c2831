//! Perp Gateway — core library.
//!
//! Exposes every component so both the binary and the integration tests can
//! wire an `AppState` together: Precision & Tier Tables, the Liquidation
//! Math Engine, the Price Tape, the Order Pipeline, the TWAP Scheduler, and
//! the Gateway Facade that routes HTTP onto all of them.

pub mod config;
pub mod error;
pub mod gateway;
pub mod liquidation;
pub mod middleware;
pub mod order;
pub mod order_pipeline;
pub mod precision;
pub mod price_tape;
pub mod symbol;
pub mod tiers;
pub mod transport;
pub mod twap;

pub use config::Config;
pub use error::GatewayError;
pub use gateway::{router, AppState};
