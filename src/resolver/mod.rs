//! Resolver chain: strategies, the engine that orders them, and the cached
//! front door used by the gateway and RPC surface.

pub mod cache;
pub mod engine;
pub mod strategies;

pub use cache::{Resolution, ResolveOptions};
pub use engine::{ResolverEngine, StrategyRegistry};
pub use strategies::{ResolveStrategy, ALIAS_RESOLVER_TYPE, PREFIX_RESOLVER_TYPE};
