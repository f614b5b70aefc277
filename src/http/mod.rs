//! HTTP protocol support: request parsing, response building, and
//! per-connection state.

pub mod conn;
pub mod request;
pub mod response;
