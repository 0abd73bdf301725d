//! VeriTag: registry & verification engine for anti-counterfeit item tracking.
//!
//! This crate provides:
//! - An issuer allow-list and single-administrator access control
//! - Immutable product-batch registration with per-call input caps
//! - First-scan-wins item verification with replay detection
//! - A global pause circuit-breaker gating all mutating paths
//! - An append-only, hash-chained audit log (SQLite) with export/rebuild
//! - Deterministic item-identifier derivation shared with scanning clients
//!
//! The CLI wrapper lives in `src/main.rs`.

#![deny(unsafe_code)]

pub mod error;
pub mod config;

pub mod events;
pub mod identity;
pub mod item;
pub mod registry;
pub mod util;
