//! Tenantgate - A multi-tenant edge router with scale-to-zero microservices
//!
//! This library provides an edge router that:
//! - Maps the project label of a request's Host header to a project
//! - Routes the remaining labels to a microservice through priority match patterns
//! - Activates microservices on demand, dependencies first
//! - Serves static sites directly and proxies to spawned local processes
//! - Shuts idle microservices down again, cascading through dependencies
//!   nothing else needs

pub mod config;
pub mod context;
pub mod environment;
pub mod error;
pub mod executor;
pub mod manager;
pub mod matcher;
pub mod microservice;
pub mod pool;
pub mod ports;
pub mod project;
pub mod proxy;
pub mod source;

use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;

/// Body type used for every request and response passing through the router
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Package name
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
