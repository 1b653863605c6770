//! # dfarm-host — Device Farm Mirroring Host
//!
//! Headless driver that mirrors a fleet of Android devices: each
//! configured serial gets a pooled session with agent push, tunnel
//! setup, and a decode pipeline, with encoding quality scaled to the
//! fleet size.
//!
//! ## Modes
//!
//! - **Console**: Run in the foreground until Ctrl-C.
//! - **Gen-config**: Print the default TOML config (`--gen-config`).

pub mod config;
pub mod service;
