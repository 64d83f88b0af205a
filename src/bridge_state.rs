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

//! Connection state of the VRM bridges.
//!
//! The broker doesn't tell whether a bridge is meant to be active, so it's deduced from the VRM
//! portal mode and the status message.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Message of a bridge that is not configured.
pub const BRIDGE_DEACTIVATED: &str = "deactivated";
/// Message of a bridge whose state is not known yet.
pub const BRIDGE_PENDING: &str = "pending";

const DISAPPEARED_FROM_CONFIG: &str = "disappeared from config";

/// Mode of the VRM portal setting.
///
/// The variants are ordered, a bridge is active when the mode is at least its
/// [`BridgeName::required_mode`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VrmPortalMode {
    /// The setting wasn't read yet.
    Unknown,
    /// No data is sent to the VRM portal.
    Off,
    /// Data is sent, but the portal can't control the device.
    ReadOnly,
    /// Data is sent and the portal can control the device.
    #[default]
    Full,
}

impl VrmPortalMode {
    /// Converts the value of the `/Settings/Network/VrmPortal` setting.
    pub fn from_setting(value: i64) -> Self {
        match value {
            0 => Self::Off,
            1 => Self::ReadOnly,
            2 => Self::Full,
            _ => Self::Unknown,
        }
    }
}

impl Display for VrmPortalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self {
            VrmPortalMode::Unknown => "unknown",
            VrmPortalMode::Off => "off",
            VrmPortalMode::ReadOnly => "read-only",
            VrmPortalMode::Full => "full",
        };

        f.write_str(mode)
    }
}

/// Error returned when parsing a [`VrmPortalMode`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid VRM portal mode {0:?}, expected off, read-only or full")]
pub struct ParseModeError(String);

impl FromStr for VrmPortalMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" => Ok(Self::Off),
            "read-only" | "readonly" | "1" => Ok(Self::ReadOnly),
            "full" | "2" => Ok(Self::Full),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}

/// Bridges to the VRM cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BridgeName {
    /// Bridge relaying the device data.
    Dbus,
    /// Bridge relaying the remote procedure calls.
    Rpc,
}

impl BridgeName {
    /// All the bridges, in configuration order.
    pub const ALL: [BridgeName; 2] = [BridgeName::Dbus, BridgeName::Rpc];

    /// Name of the bridge connection in the broker.
    pub const fn as_str(&self) -> &'static str {
        match self {
            BridgeName::Dbus => "GXdbus",
            BridgeName::Rpc => "GXrpc",
        }
    }

    /// Minimum portal mode for the bridge to be configured.
    pub const fn required_mode(&self) -> VrmPortalMode {
        match self {
            BridgeName::Dbus => VrmPortalMode::ReadOnly,
            BridgeName::Rpc => VrmPortalMode::Full,
        }
    }

    /// Returns `true` if the bridge is configured in the given mode.
    pub fn is_enabled(&self, mode: VrmPortalMode) -> bool {
        mode >= self.required_mode()
    }

    /// Finds the bridge by its connection name.
    pub fn from_connection_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|bridge| bridge.as_str() == name)
    }
}

impl Display for BridgeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for BridgeName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// Connection state of a bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConnectionState {
    /// Whether the bridge is connected, [`None`] when unknown or not applicable.
    pub connected: Option<bool>,
    /// Human readable status.
    pub msg: String,
}

impl BridgeConnectionState {
    /// Creates a new state.
    pub fn new(connected: Option<bool>, msg: impl Into<String>) -> Self {
        Self {
            connected,
            msg: msg.into(),
        }
    }

    /// State of a bridge not configured.
    pub fn deactivated() -> Self {
        Self::new(None, BRIDGE_DEACTIVATED)
    }

    /// State to report, given the portal mode.
    pub fn effective(&self, bridge: BridgeName, mode: VrmPortalMode) -> Self {
        if self.msg.contains(DISAPPEARED_FROM_CONFIG) || !bridge.is_enabled(mode) {
            return Self::deactivated();
        }

        self.clone()
    }
}

impl Default for BridgeConnectionState {
    fn default() -> Self {
        Self::new(None, BRIDGE_PENDING)
    }
}

/// Effective states of all the bridges, keyed by name.
pub type EffectiveStates = BTreeMap<BridgeName, BridgeConnectionState>;

/// Tracks the state of the bridges and what was last reported.
#[derive(Debug, Clone, Default)]
pub struct BridgeStates {
    mode: VrmPortalMode,
    states: BTreeMap<BridgeName, BridgeConnectionState>,
    last_reported: Option<EffectiveStates>,
}

impl BridgeStates {
    /// Creates the states with both bridges pending.
    pub fn new(mode: VrmPortalMode) -> Self {
        let states = BridgeName::ALL
            .into_iter()
            .map(|bridge| (bridge, BridgeConnectionState::default()))
            .collect();

        Self {
            mode,
            states,
            last_reported: None,
        }
    }

    /// Current portal mode.
    pub fn mode(&self) -> VrmPortalMode {
        self.mode
    }

    /// Sets the portal mode, returns `true` if it changed.
    pub fn set_mode(&mut self, mode: VrmPortalMode) -> bool {
        let changed = self.mode != mode;
        self.mode = mode;

        changed
    }

    /// Sets the raw state of a bridge, returns `true` if it changed.
    pub fn set(&mut self, bridge: BridgeName, state: BridgeConnectionState) -> bool {
        self.states.insert(bridge, state.clone()) != Some(state)
    }

    /// Raw state of a bridge.
    pub fn get(&self, bridge: BridgeName) -> Option<&BridgeConnectionState> {
        self.states.get(&bridge)
    }

    /// States of the bridges after applying the portal mode.
    pub fn effective_states(&self) -> EffectiveStates {
        self.states
            .iter()
            .map(|(bridge, state)| (*bridge, state.effective(*bridge, self.mode)))
            .collect()
    }

    /// Returns the effective states if they differ from the last reported ones.
    pub fn take_changes(&mut self) -> Option<EffectiveStates> {
        let current = self.effective_states();

        if self.last_reported.as_ref() == Some(&current) {
            return None;
        }

        self.last_reported = Some(current.clone());

        Some(current)
    }
}
