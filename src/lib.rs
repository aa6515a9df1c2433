pub mod commands;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod events;
pub mod http_api;
pub mod hub;
pub mod keepalive;
pub mod protocol;
pub mod registry;
pub mod routing;
pub mod telegram;
