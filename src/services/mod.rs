pub mod cache;
pub mod freshness;
pub mod invalidation;
pub mod rate_limit;
pub mod refresh;
