//! Library for the Performance Traffic Engine (PTE) containing its core code.
//!
//! The `pte` binary is a thin CLI on top of this crate: it loads a
//! [`workload::WorkloadDescriptor`], hands it to the [`coordinator`] and
//! writes the resulting report. Everything that decides *when* a transaction
//! is sent, *how* its commit event is matched and *whether* a run passed
//! lives here so it can be exercised without a ledger network.

#![cfg_attr(
    not(test),
    warn(clippy::print_stdout, clippy::dbg_macro),
    deny(clippy::unwrap_used, clippy::expect_used)
)]

pub mod coordinator;
pub mod correlator;
pub mod exec;
pub mod ledger;
pub mod pacing;
pub mod stats;
pub mod tx;
pub mod utils;
pub mod worker;
pub mod workload;
