//! mysql-gate - Policy-enforcing SQL gateway for MySQL.
//!
//! Every statement is parsed, risk-classified and scope-checked before it
//! may reach a pooled connection.

pub mod cli;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod logging;
pub mod query;
pub mod safety;
