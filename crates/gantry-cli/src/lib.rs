//! gantry command-line front end.

pub mod cli;
pub mod health_check;
pub mod serve;
