//! Meridian - resource resolution gateway
//!
//! Maps request URLs onto stored locations through an ordered chain of
//! mount-point resolvers, serves them through pluggable drivers and guards
//! every capability with scoped access tokens. All modules are exposed for
//! integration tests.

pub mod auth;
pub mod cache;
pub mod drivers;
pub mod entities;
pub mod errors;
pub mod jobs;
pub mod location;
pub mod mount_point;
pub mod resolver;
pub mod rpc;
pub mod settings;
pub mod storage;
pub mod web;

#[cfg(test)]
mod test_support;
