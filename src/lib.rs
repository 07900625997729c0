pub mod archive;
pub mod checkpoint;
pub mod config;
pub mod demo;
pub mod error;
pub mod node;
pub mod output;
pub mod payload;
pub mod protocol;
pub mod queen;
pub mod scheduler;
pub mod shutdown;
pub mod transport;
pub mod worker;

pub use error::{DistributorError, Result};
