pub mod builder;
pub mod cache;
pub mod color;
pub mod crowdsale;
pub mod error;
pub mod marker;
pub mod operations;
pub mod provider;
pub mod types;

#[cfg(test)]
pub mod test_util;

pub use error::{CoreError, RpcError};
pub use operations::{Config, Controller, Mode};
pub use types::AssetId;
