pub mod allocation;
pub mod config;
pub mod credentials;
pub mod cycle;
pub mod domain;
pub mod engine;
pub mod grouping;
pub mod http;
pub mod id;
pub mod offer;
pub mod pricing;
pub mod revocation;
pub mod state;
