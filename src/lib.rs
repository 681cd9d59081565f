//! herd - run a network service as a supervised pool of worker processes.
//!
//! See [`cluster`] for the supervisor and [`server`] for the bundled
//! demonstration application.

pub mod cluster;
pub mod error;
pub mod logging;
pub mod server;
