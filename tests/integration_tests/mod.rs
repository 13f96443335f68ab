//! Integration tests module
//!
//! End-to-end tests for the verification scheduler, including:
//! - Submit → route → lease → lookup → result pipeline
//! - Multi-instance lease exclusivity
//! - Error handling and retry scenarios

pub mod error_scenarios;
pub mod scenario_test;
