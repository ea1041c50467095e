#![deny(warnings)]
#![deny(clippy::unwrap_used)]

//! termbridge: an MCP server that brokers one interactive remote
//! shell between an AI agent and any number of browser viewers.

pub mod bridge;
