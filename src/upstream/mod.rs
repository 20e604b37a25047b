//! The network side of the proxy: request/response model and the fetcher.

pub mod client;
#[cfg(test)]
pub mod mock;
pub mod types;

pub use client::{Fetcher, HttpClient};
pub use types::{ContentLength, Headers, ProxyRequest, ProxyResponse, RequestKey};
