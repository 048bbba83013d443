// Copyright 2024-Present the npu-runtime-diagnostics authors
// SPDX-License-Identifier: Apache-2.0

//! Crash diagnostics for the npud accelerator runtime.
//!
//! When a monitored process takes a fatal signal (or the runtime's
//! diagnostic signal), a separately spawned collector process suspends
//! every thread, captures registers and frame-pointer stacks, and persists
//! a fixed-format binary dump plus contextual system state into a
//! per-incident directory. The `npud-dump-reader` companion binary renders
//! the binary artifact into a human-readable report.
//!
//! The crash path is allocation-free end to end: everything it needs is
//! staged by [`init`] into process-wide statics.

#![cfg(unix)]

pub mod collector;
pub mod dump;
pub mod recorder;
pub mod shared;

pub use collector::{
    begin_hard_exit, configuration, enabled, init, register_crash_callback, request_dump,
    shutdown,
};
pub use shared::configuration::{default_signals, CrashdumpConfiguration, DumpMode};
