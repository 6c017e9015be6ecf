//! Archive shield: inspect downloaded archives, rescue schematic data from
//! garbage-bearing ones, and purge or isolate the originals.

pub mod engine;
pub mod extractor;
pub mod ledger;
pub mod protection;
pub mod rules;
pub mod sweep;
pub mod walker;
