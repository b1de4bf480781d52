//! Scenario-based tests for pipewright

mod helpers;

mod batch;
mod robustness;
mod sequential;
mod sessions;
mod variable_resolution;
