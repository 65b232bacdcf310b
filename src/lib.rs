//! Chainforge - proxy chain configuration compiler
//!
//! Compiles proxy profiles, multi-hop chains and routing rules into a
//! complete V2Ray-core configuration document, plus the side tables a
//! service layer needs to supervise external plugin processes.
//!
//! # Architecture
//!
//! ```text
//!                  +----------------+
//!                  |   compiler/    |
//!                  | (compile pass) |
//!                  +-------+--------+
//!                          |
//!      +---------+---------+---------+---------+
//!      |         |         |         |         |
//! +----v----+ +--v---+ +---v---+ +---v----+ +--v----+
//! | chain/  | |synth/| |bridge/| |policy/ | |alloc/ |
//! |(resolve)| |(hops)| |(exts) | |(rules, | |(ports,|
//! |         | |      | |       | |  dns)  | | tags) |
//! +----+----+ +--+---+ +---+---+ +---+----+ +-------+
//!      |         |         |         |
//!      +---------+----+----+---------+
//!                     |
//!             +-------v--------+
//!             |   document/    |
//!             | (wire schema)  |
//!             +----------------+
//! ```
//!
//! Profiles and rules come from a [`store::ProfileStore`]; the output of
//! [`compiler::compile`] is ready to hand to the engine loader.

pub mod alloc;
pub mod bridge;
pub mod chain;
pub mod common;
pub mod compiler;
pub mod document;
pub mod policy;
pub mod profile;
pub mod rule;
pub mod store;
pub mod synth;

pub use common::error::{Error, Result};
pub use compiler::{compile, Alert, CompileOptions, CompileResult};
pub use profile::{Profile, ProfileId, ProxyBean};
pub use store::{MemoryStore, ProfileStore};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
