pub mod args;
pub mod client;
pub mod error;
pub mod generator;
pub mod protocol;
pub mod server;
pub mod stream;
pub mod utils;

pub type BoxResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;
