pub mod client;

pub use client::OriginClient;
