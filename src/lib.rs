#![forbid(unsafe_code)]

//! Schematic Sync Portal (ssp): a weekly mirror of a remote schematic share,
//! plus an archive shield for what it downloads.
//!
//! Two halves:
//! 1. **Sync**: log in to the share, hand the session to rclone, mirror it.
//! 2. **Archive shield**: list every downloaded archive without unpacking it,
//!    rescue schematic and firmware files from archives that bundle cracks or
//!    loaders, then purge (or isolate) the original and record it in the
//!    exclusion ledger so the next sync does not fetch it again.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use schematic_sync_portal::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use schematic_sync_portal::core::config::Config;
//! use schematic_sync_portal::shield::sweep::{SweepConfig, SweepOrchestrator};
//! ```

pub mod prelude;

pub mod core;
pub mod logger;
pub mod platform;
pub mod shield;
pub mod sync;
