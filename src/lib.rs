//! eSIM provisioning toolkit.
//!
//! This crate provides:
//! - The LPA activation-code codec (`LPA:1$server$code`) with a tolerant
//!   classifier for scanned or pasted input
//! - QR encode/decode of activation codes
//! - A single-use SQLite inventory with an at-most-once claim
//! - A session-authenticated client for the fulfillment status API
//!
//! The CLI wrapper lives in `src/main.rs`.

#![deny(unsafe_code)]

pub mod error;
pub mod config;

pub mod inventory;
pub mod lpa;
pub mod qr;
pub mod session;
pub mod status;
pub mod transport;
pub mod util;
