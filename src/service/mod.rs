//! Socket glue
//!
//! [`LinkService`] owns one datagram socket and every connection on it.

#[allow(clippy::module_inception)]
mod service;

pub use service::*;
