//! Client-side resilience for admin web apps: tiered interception caches, a
//! durable offline mutation queue, a server-held cache epoch, and per-endpoint
//! circuit breakers with burst protection.

pub mod cache;
pub mod coherency;
pub mod config;
pub mod db;
pub mod guard;
pub mod http;
pub mod network;
pub mod queue;
pub mod stack;
pub mod worker;

#[cfg(test)]
mod testing;
