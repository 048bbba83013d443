// Copyright 2024-Present the npu-runtime-diagnostics authors
// SPDX-License-Identifier: Apache-2.0

use crate::shared::constants;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Dump strategy selected by the diagnostic signal's 32-bit payload.
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DumpMode {
    /// Every thread, rendered directly as text by the collector.
    FullProcessText = 0,
    /// Only the faulting thread, as a binary dump.
    SingleThreadBinary = 1,
    /// Every thread as a binary dump; the collector then hands the file to
    /// the reader binary for rendering.
    FullProcessBinary = 2,
}

impl TryFrom<i32> for DumpMode {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, i32> {
        match value {
            0 => Ok(DumpMode::FullProcessText),
            1 => Ok(DumpMode::SingleThreadBinary),
            2 => Ok(DumpMode::FullProcessBinary),
            other => Err(other),
        }
    }
}

/// The signal numbers handled by default: the fatal set plus the runtime's
/// diagnostic signal.
pub fn default_signals() -> Vec<i32> {
    vec![
        libc::SIGINT,
        libc::SIGTERM,
        libc::SIGQUIT,
        libc::SIGILL,
        libc::SIGTRAP,
        libc::SIGABRT,
        libc::SIGBUS,
        libc::SIGFPE,
        libc::SIGSEGV,
        libc::SIGXCPU,
        libc::SIGXFSZ,
        libc::SIGSYS,
        constants::diagnostic_signum(),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashdumpConfiguration {
    event_name: String,
    signals: Vec<i32>,
    create_alt_stack: bool,
    use_alt_stack: bool,
    timeout: Duration,
    /// Path to the npud-dump-reader binary; when `None` it is resolved next
    /// to the running executable at crash time.
    reader_binary: Option<String>,
}

impl CrashdumpConfiguration {
    pub fn new(
        event_name: Option<String>,
        mut signals: Vec<i32>,
        create_alt_stack: bool,
        use_alt_stack: bool,
        timeout: Option<Duration>,
        reader_binary: Option<String>,
    ) -> anyhow::Result<Self> {
        // Creating but not using the altstack is paradoxical.
        anyhow::ensure!(
            !create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        let event_name = event_name.unwrap_or_else(|| constants::DEFAULT_EVENT_NAME.to_string());
        anyhow::ensure!(!event_name.is_empty(), "Event name must not be empty");
        anyhow::ensure!(
            !event_name.contains("..") && !event_name.contains('/'),
            "Event name must be a single path component: {event_name}"
        );
        if signals.is_empty() {
            signals = default_signals();
        } else {
            let before_len = signals.len();
            signals.sort();
            signals.dedup();
            anyhow::ensure!(
                before_len == signals.len(),
                "Signals contained duplicate elements"
            );
            for signum in &signals {
                anyhow::ensure!(
                    *signum > 0 && *signum <= libc::SIGRTMAX(),
                    "Invalid signal number {signum}"
                );
            }
        }
        let timeout = timeout.unwrap_or(constants::DEFAULT_DUMP_TIMEOUT);
        Ok(Self {
            event_name,
            signals,
            create_alt_stack,
            use_alt_stack,
            timeout,
            reader_binary,
        })
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn signals(&self) -> &[i32] {
        &self.signals
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn use_alt_stack(&self) -> bool {
        self.use_alt_stack
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn reader_binary(&self) -> Option<&str> {
        self.reader_binary.as_deref()
    }
}

impl Default for CrashdumpConfiguration {
    fn default() -> Self {
        #[allow(clippy::expect_used)]
        Self::new(None, vec![], true, true, None, None).expect("default configuration is valid")
    }
}
