//! End-to-end scenarios for plandoc, run against real stores in temp dirs.

mod harness;
mod scenarios;
