//! Data models shared by the router, aggregator and subscription layers

mod response;

pub use response::*;
