pub mod adapters;
pub mod binaries;
pub mod cluster;
pub mod config;
pub mod consul;
pub mod harness;
pub mod health;
pub mod id;
pub mod nomad;
pub mod runner;
pub mod tls;
pub mod util;
pub mod vault;
pub mod version;
