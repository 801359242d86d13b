// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! POSIX implementation of the platform trait (Linux and macOS).

use std::time::SystemTime;

use super::Platform;

/// POSIX platform probe.
///
/// The start time is captured at construction: the platform is built
/// first thing in `main`, which is early enough for the reclaim cutoff
/// and avoids parsing `/proc/self/stat` tick arithmetic.
pub struct UnixPlatform {
    started_at: SystemTime,
}

impl UnixPlatform {
    pub fn new() -> Self {
        Self {
            started_at: SystemTime::now(),
        }
    }
}

impl Default for UnixPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for UnixPlatform {
    fn cpu_count(&self) -> usize {
        // SAFETY: sysconf is always safe to call.
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if count < 1 {
            1
        } else {
            count as usize
        }
    }

    fn process_start_time(&self) -> SystemTime {
        self.started_at
    }

    fn is_privileged(&self) -> bool {
        // SAFETY: geteuid is always safe to call.
        unsafe { libc::geteuid() == 0 }
    }

    fn platform_name(&self) -> &'static str {
        if cfg!(target_os = "linux") {
            "linux"
        } else {
            "unix"
        }
    }
}
