//! This crate provides a data portal. It turns sets of dataset files, already located by a
//! catalogue search, into chunked Zarr stores that clients stream over HTTP, building each
//! distinct request once and serving it from a cache afterwards.
//!
//! A request is normalized into a fingerprint. A cache hit is served straight from the cache
//! directory. A miss queues a build job in an embedded [sled] database; a pool of workers claims
//! jobs under leases, reads the sources from POSIX paths, tape-staged storage, HTTP servers or
//! S3-compatible object stores, and writes the chunks into a staging directory. Clients may
//! stream the chunks of a build while it is still running.
//!
//! The data portal is built on top of a number of open source components.
//!
//! * [Tokio](tokio), the most popular asynchronous Rust runtime.
//! * [Axum](axum) web framework, built by the Tokio team, on top of the [hyper] HTTP library.
//! * [Serde](serde) performs (de)serialisation of JSON request and response data and of the
//!   records kept in the store.
//! * [sled] provides the durable, transactional job and cache state.
//! * [AWS SDK for S3](aws-sdk-s3) is used to interact with S3-compatible object stores.
//! * [ndarray] provides the n-dimensional array views used to select source data.

pub mod app;
pub mod app_state;
pub mod array;
pub mod artifact;
pub mod cache;
pub mod chunking;
pub mod cli;
pub mod clock;
pub mod compression;
pub mod error;
pub mod fetcher;
pub mod fingerprint;
pub mod gateway;
pub mod http_client;
pub mod job;
pub mod metrics;
pub mod models;
pub mod posix;
pub mod queue;
pub mod resource_manager;
pub mod s3_client;
pub mod server;
pub mod store;
#[cfg(test)]
pub mod test_utils;
pub mod tracing;
pub mod types;
pub mod validated_json;
pub mod worker;
pub mod writer;
