//! Options for preparing loopers and building executors.

use std::ffi::c_int;

use crate::sys;

/// Flags passed to the native prepare call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrepareOptions {
    /// Allow fds registered without a callback (reported by ident from a poll).
    pub allow_non_callbacks: bool,
}

impl PrepareOptions {
    pub(crate) fn bits(self) -> c_int {
        if self.allow_non_callbacks {
            sys::ALOOPER_PREPARE_ALLOW_NON_CALLBACKS
        } else {
            0
        }
    }
}

/// Settings for a [`SerialExecutor`](crate::SerialExecutor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Name attached to the executor's log lines.
    pub label: String,
}

impl ExecutorConfig {
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::labeled("serial")
    }
}
