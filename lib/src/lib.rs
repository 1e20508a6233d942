//! # Virtual machine installer core
//!
//! Given an install media location (HTTP/FTP/NFS URL, local directory or
//! ISO) this crate recognizes which distribution the tree belongs to,
//! fetches its installer kernel and initrd, and drives a guest through the
//! install boot to its final persistent definition.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![forbid(unused_must_use)]
#![deny(unsafe_code)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]

pub mod cli;
pub mod config;
pub mod conn;
pub mod detect;
pub mod distro;
mod error;
pub mod fetch;
pub mod guest;
pub mod installer;
mod mount;
pub mod osdb;
pub mod storage;
mod task;
pub mod treeinfo;
pub mod treemedia;

#[cfg(test)]
mod fixture;

pub use error::Error;
