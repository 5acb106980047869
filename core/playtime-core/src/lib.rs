//! # playtime-core
//!
//! Shared logic for playtime tracking that has no process or database state:
//! the data-driven heuristic tables and the executable resolution built on
//! them.
//!
//! ## Design Principles
//!
//! - **Pure**: the only I/O is reading the install directory and table files.
//! - **Data-driven**: per-title behavior lives in versioned TOML tables, not in
//!   conditionals.
//! - **Graceful degradation**: a title nothing can be resolved for yields a
//!   [`ResolutionFailure`]; callers fall back to wall-clock tracking.

pub mod error;
pub mod resolver;
pub mod scan;
pub mod tables;

pub use error::{CoreError, ResolutionFailure, Result};
pub use resolver::{
    resolve_tracking_target, select_target, tracking_delay, ResolutionStrategy, TrackingTarget,
};
pub use scan::{enumerate_executables, ExecutableCandidate};
pub use tables::{HeuristicTables, KnownGame, TitleClass, SUPPORTED_TABLES_VERSION};
