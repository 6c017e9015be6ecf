//! Remote side of a sync run: session login, the rclone mirror, and the host
//! tools both depend on.

pub mod auth;
pub mod deps;
pub mod rclone;
