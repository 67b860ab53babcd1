//! This crate contains various shared helpers and utilities used across the charm crates in this
//! workspace.

pub mod yaml;
