//! Host detection, recurring-job scheduling, and interrupt handling.

pub mod pal;
pub mod service;
pub mod signals;
