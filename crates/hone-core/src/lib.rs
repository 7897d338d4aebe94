//! hone-core: domain model for the validation-refinement engine.
//!
//! Everything here is synchronous and free of I/O apart from reading config
//! files, so the state machine and the refinement policy can be tested without
//! a runtime or any external tool.

pub mod config;
pub mod controller;
pub mod events;
pub mod machine;
pub mod snapshot;
pub mod types;
pub mod verdict;

pub use config::{AdapterConfig, AdmissionPolicy, Config, ConfigError, OutputFormat};
pub use controller::{decide, Decision, RefinementRequest};
pub use machine::{transition, PhaseEvent, TransitionError};
pub use snapshot::{BlobRef, Snapshot, SCHEMA_VERSION};
pub use types::*;
pub use verdict::{Verdict, VerdictSummary};
