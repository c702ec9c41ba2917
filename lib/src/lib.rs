// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Secure memory controller.
//!
//! Sits between a processor's cache hierarchy and main memory. Lines leave
//! the chip encrypted and tagged, and every line coming back is checked
//! against a Merkle tree over the per-line counters, rooted in a digest that
//! never leaves the chip.

pub mod config;
pub mod controller;
pub mod crypto;
pub mod fault;
pub mod geometry;
pub mod hash;
pub mod image;
pub mod log;
pub mod meta_cache;
pub mod metadata;
pub mod port;
pub mod sim;
pub mod tree;

pub use config::SecCtrlConfig;
pub use controller::SecCtrl;
pub use fault::Fault;
pub use geometry::BlockAddr;
pub use geometry::Line;
pub use geometry::LINE_BYTES;
