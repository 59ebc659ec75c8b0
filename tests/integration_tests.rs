//! End-to-end tests of the core against script-driven managers.

mod integration;
