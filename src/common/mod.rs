//! Common utilities and types

pub mod error;
pub mod net;

pub use error::{Error, Result};
pub use net::{is_ip_address, split_host_port, LOCALHOST};
