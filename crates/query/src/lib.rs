//! appdeck query: kind-agnostic list engine over cached objects.
//!
//! The engine knows nothing about concrete kinds; each kind contributes a predicate and
//! comparator pair through the [`Registry`].

#![forbid(unsafe_code)]

pub mod engine;
pub mod registry;

pub use engine::{execute, execute_with_debug, QueryDebugInfo};
pub use registry::{KindPolicy, Registry, DISPLAY_NAME_POLICY, METADATA_POLICY};
