//! Integration Tests Module
//!
//! End-to-end runs of the binscope front end over temporary directories:
//! format detection, the built-in rules, combined analysis and output.

// Shared fixtures
mod fixtures;

// Full analysis runs over the filesystem
mod analysis_test;

// Configuration and rendering
mod output_test;
