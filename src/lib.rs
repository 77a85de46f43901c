pub mod config;
pub mod core;
pub mod logging;
pub mod messenger;
pub mod metrics;
pub mod policies;
pub mod protocols;
pub mod routers;
pub mod server;
pub mod service_discovery;
pub mod types;

pub use config::DispatcherConfig;
pub use server::startup;
