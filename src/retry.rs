// This file is part of vrm-bridge.
//
// Copyright 2026 vrm-bridge contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Delays between the retries of a failed operation.

use std::time::Duration;

/// Maximum delay between two registration attempts.
pub const MAX_REGISTRATION_DELAY: Duration = Duration::from_secs(30 * 60);

/// Exponential back-off, doubling the delay from one second up to a maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    next_secs: u64,
    max_secs: u64,
}

impl Backoff {
    /// Creates a back-off capped at `max`, with a one second resolution.
    pub fn with_max(max: Duration) -> Self {
        let max_secs = max.as_secs().max(1);

        Self {
            next_secs: 1,
            max_secs,
        }
    }

    /// Returns the delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let secs = self.next_secs;

        self.next_secs = secs.saturating_mul(2).min(self.max_secs);

        Duration::from_secs(secs)
    }

    /// Restarts from the shortest delay.
    pub fn reset(&mut self) {
        self.next_secs = 1;
    }
}
