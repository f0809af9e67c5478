//! Content Records
//!
//! Versioned edits to governed subjects and A/B experiments on them.
//!
//! - [`version`]: field diffs and immutable version snapshots
//! - [`abtest`]: experiments and the winner-selection rule

pub mod abtest;
pub mod version;

pub use abtest::{select_winner, ABTest, ABTestResults, ABTestStatus, Variant, VariantScore};
pub use version::{diff_fields, Changes, ContentVersion, FieldChange};
