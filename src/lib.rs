//! mcpgate - one HTTP front door for many stdio MCP servers
//!
//! This library provides a gateway that:
//! - Loads an `mcpServers` list and gives every entry its own local port
//! - Spawns one HTTP/SSE adapter per entry, plus a local tools server
//! - Routes requests by path prefix (`/<name>/...`) to the matching adapter
//! - Relays event streams and protocol upgrades without buffering
//! - Terminates every child process on SIGINT or SIGTERM

pub mod admin;
pub mod config;
pub mod error;
pub mod info;
pub mod pool;
pub mod ports;
pub mod proxy;
pub mod routes;
pub mod shutdown;
pub mod supervisor;
