#![warn(missing_docs)]

//! This crate constitutes a library of light weight helpers that are shared
//! across the other medvault crates: an injectable [`Clock`] and the
//! [`Checksum`] used to verify sealed document content.

mod time;
pub use time::*;

mod hash;
pub use hash::*;
