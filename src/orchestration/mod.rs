//! Watchdog, health evaluation and merge resolution.

pub mod health;
pub mod resolver;
pub mod watchdog;

pub use health::{evaluate, HealthCheck, HealthStatus, SuggestedAction};
pub use resolver::{
    CodeValidator, ConflictHistory, MergeOutcome, MergeResolver, MergeResult, MergeTier,
    PastResolution,
};
pub use watchdog::{FailureRecord, TickReport, TriageVerdict, Watchdog};
