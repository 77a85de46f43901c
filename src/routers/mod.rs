//! Request routing surfaces

pub mod header_utils;
pub mod http;

pub use self::http::ModelProxy;
