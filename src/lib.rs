//! sipp-sync - Scheduled synchronization of SIPP case and schedule records
//!
//! This crate pulls records from a SIPP (Sistem Informasi Penelusuran Perkara)
//! instance into a local SQLite store, with retrying API access, per-run
//! audit records and a small HTTP API for status and manual triggers.

pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod server;
pub mod sync;
pub mod telemetry;
