//! HTTP routing to model workers

pub mod models;
pub mod router;

pub use router::ModelProxy;
