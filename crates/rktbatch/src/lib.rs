//! `rktbatch` binary support: argument parsing and the job runner.

pub mod cli;
pub mod runner;
