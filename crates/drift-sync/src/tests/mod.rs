//! Tests for the drift-sync crate.

mod helpers;
