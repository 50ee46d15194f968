pub mod agent;
pub mod broker;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod duration;
pub mod error;
pub mod identity;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod sink;
