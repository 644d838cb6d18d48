pub mod chat;
pub mod config;
pub mod errors;
pub mod ledger;
pub mod market_api;
pub mod model;
pub mod money;
pub mod strategy;
pub mod supervisor;
pub mod time;
pub mod worker;

pub use errors::{PortalError, PortalResult};
