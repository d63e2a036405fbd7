//! Error Recovery
//!
//! Error classification and the recovery strategies applied to each category.

pub mod classifier;
pub mod service;

pub use classifier::{
    categorize, category_of, is_quota_exhaustion, ClassifiedError, ErrorCategory,
    ErrorClassifier, ErrorSeverity, RecoveryStrategy,
};
pub use service::{
    ErrorRecord, ReauthSignal, RecoveryConfig, RecoveryOutcome, RecoveryService, RecoveryStats,
};
