//! Shared infrastructure for SDP components
//!
//! Home of the pieces every crate in the workspace needs: the common error
//! type and the centralized logging setup. Domain logic lives in `sdp-etl`.

pub mod error;
pub mod logging;

pub use error::{Result, SdpError};
