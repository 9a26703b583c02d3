pub mod config;
pub mod deepstack;
pub mod detection;
pub mod export;
pub mod flow;
pub mod logger;
pub mod message;
pub mod node;
pub mod outline;
pub mod schema;
pub mod server;
pub mod status;
pub mod test_util;
