pub mod request;
pub mod spec;
