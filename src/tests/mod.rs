//! Scenario tests for the queue and cache.

mod cases_cache_test;

pub mod support;
