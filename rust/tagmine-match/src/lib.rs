//! Pattern matching and feedback learning
//!
//! Scores detected clusters against the pattern library, emits suggestions
//! for operators, and folds their decisions back into pattern confidences.

pub mod feedback;
pub mod matcher;
pub mod scoring;
pub mod seed;

pub use feedback::FeedbackLearner;
pub use matcher::PatternMatcher;
pub use scoring::{assign_roles, score_role, RolePointView, RoleScore};
pub use seed::builtin_patterns;
