//! Core model for blescout: advertising payloads and their decoding, the
//! registry of devices in view, and the filter/sort pipeline over it.
//!
//! Nothing in here does I/O or can fail; radios and gateways live in the
//! sibling crates.

pub mod advertising;
pub mod clock;
pub mod decoder;
pub mod device;
pub mod discover;
pub mod filter;
pub mod pattern;
pub mod registry;
pub mod snapshot;
