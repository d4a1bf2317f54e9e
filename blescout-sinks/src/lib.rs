//! Consumers of the device registry that push it somewhere else.

pub mod forwarder;
pub mod gateway;
