pub mod audit;
pub mod config;
pub mod daemon;
pub mod error;
pub mod provider;
pub mod replay;
pub mod rules;
pub mod server;
pub mod session;

pub use error::FilterError;
