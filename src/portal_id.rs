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

//! Resolves the VRM portal ID of the device.
//!
//! The portal ID is read from the unique-id file written at first boot. If it is missing, the
//! platform `get-unique-id` command is tried, and as a last resort the MAC address of the
//! network interface configured with `VRM_IFACE`.

use std::fmt::{self, Display};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::error::Report;

/// File containing the unique identifier of the device.
pub const DEFAULT_UNIQUE_ID_FILE: &str = "/data/venus/unique-id";
/// Platform command printing the unique identifier of the device.
pub const DEFAULT_UNIQUE_ID_COMMAND: &str = "/sbin/get-unique-id";
/// Directory with the network interfaces.
pub const DEFAULT_SYSFS_NET_DIR: &str = "/sys/class/net";
/// Interface used when `VRM_IFACE` is not set.
pub const DEFAULT_IFACE: &str = "eth0";
/// Environment variable selecting the interface whose MAC is the portal ID.
pub const IFACE_ENV: &str = "VRM_IFACE";

/// Error returned while resolving the portal ID.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum PortalIdError {
    /// The identifier is empty.
    #[error("the portal ID is empty")]
    Empty,
    /// The identifier can't be used in a topic.
    #[error("invalid character {character:?} in portal ID {id:?}")]
    InvalidCharacter {
        /// The rejected identifier.
        id: String,
        /// The first invalid character.
        character: char,
    },
    /// Couldn't read the unique-id file.
    #[error("couldn't read {}", path.display())]
    Read {
        /// Path of the file.
        path: PathBuf,
        #[source]
        backtrace: io::Error,
    },
    /// The unique-id command failed.
    #[error("command {command} failed: {reason}")]
    Command {
        /// Command that was run.
        command: String,
        /// Exit status or spawn error.
        reason: String,
    },
    /// The interface address is not a MAC address.
    #[error("invalid MAC address {0:?}")]
    InvalidMac(String),
    /// None of the sources returned an identifier.
    #[error("no source for the portal ID is available")]
    Unavailable,
}

/// Unique identifier of the device in the VRM portal.
///
/// The identifier is opaque, it's only trimmed and checked to be usable inside an MQTT topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortalId(String);

impl PortalId {
    /// Creates a portal ID, trimming the surrounding whitespace.
    pub fn new(id: impl Into<String>) -> Result<Self, PortalIdError> {
        let id: String = id.into();
        let trimmed = id.trim();

        if trimmed.is_empty() {
            return Err(PortalIdError::Empty);
        }

        if let Some(character) = trimmed
            .chars()
            .find(|c| c.is_whitespace() || matches!(c, '/' | '+' | '#'))
        {
            return Err(PortalIdError::InvalidCharacter {
                id: trimmed.to_string(),
                character,
            });
        }

        // Avoid the allocation when nothing was trimmed
        if trimmed.len() == id.len() {
            return Ok(Self(id));
        }

        Ok(Self(trimmed.to_string()))
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Builds the portal ID from a MAC address, like `00:1A:2b:3c:4d:5e`.
    pub fn from_mac(mac: &str) -> Result<Self, PortalIdError> {
        let mac = mac.trim();

        let octets: Vec<&str> = mac.split(':').collect();
        let valid = octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));

        if !valid {
            return Err(PortalIdError::InvalidMac(mac.to_string()));
        }

        Self::new(octets.concat().to_ascii_lowercase())
    }
}

impl Display for PortalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PortalId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl FromStr for PortalId {
    type Err = PortalIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for PortalId {
    type Error = PortalIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PortalId> for String {
    fn from(value: PortalId) -> Self {
        value.0
    }
}

/// Source of the VRM portal ID.
#[allow(async_fn_in_trait)]
#[cfg_attr(test, mockall::automock)]
pub trait PortalIdSource {
    /// Resolves the portal ID of this device.
    async fn portal_id(&self) -> Result<PortalId, PortalIdError>;
}

/// Resolves the portal ID from the platform unique-id, falling back to the interface MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueIdResolver {
    unique_id_file: PathBuf,
    unique_id_command: PathBuf,
    sysfs_net_dir: PathBuf,
    iface: String,
}

impl UniqueIdResolver {
    /// Creates a resolver with the platform defaults.
    ///
    /// The interface is read from the `VRM_IFACE` environment variable.
    pub fn new() -> Self {
        let iface = std::env::var(IFACE_ENV)
            .ok()
            .filter(|iface| !iface.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_IFACE.to_string());

        Self {
            unique_id_file: PathBuf::from(DEFAULT_UNIQUE_ID_FILE),
            unique_id_command: PathBuf::from(DEFAULT_UNIQUE_ID_COMMAND),
            sysfs_net_dir: PathBuf::from(DEFAULT_SYSFS_NET_DIR),
            iface,
        }
    }

    /// Sets the unique-id file.
    pub fn unique_id_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.unique_id_file = path.into();

        self
    }

    /// Sets the unique-id command.
    pub fn unique_id_command(mut self, path: impl Into<PathBuf>) -> Self {
        self.unique_id_command = path.into();

        self
    }

    /// Sets the directory listing the network interfaces.
    pub fn sysfs_net_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.sysfs_net_dir = path.into();

        self
    }

    /// Sets the interface whose MAC address is used as fallback.
    pub fn iface(mut self, iface: impl Into<String>) -> Self {
        self.iface = iface.into();

        self
    }

    async fn from_file(&self) -> Result<Option<PortalId>, PortalIdError> {
        let content = match fs::read_to_string(&self.unique_id_file).await {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.unique_id_file.display(), "no unique-id file");

                return Ok(None);
            }
            Err(err) => {
                return Err(PortalIdError::Read {
                    path: self.unique_id_file.clone(),
                    backtrace: err,
                })
            }
        };

        let line = content.lines().next().unwrap_or_default();
        if line.trim().is_empty() {
            warn!(path = %self.unique_id_file.display(), "unique-id file is empty");

            return Ok(None);
        }

        match PortalId::new(line) {
            Ok(id) => Ok(Some(id)),
            Err(err) => {
                warn!(
                    path = %self.unique_id_file.display(),
                    error = %Report::new(&err),
                    "invalid portal ID in unique-id file"
                );

                Ok(None)
            }
        }
    }

    async fn from_command(&self) -> Result<Option<PortalId>, PortalIdError> {
        let command = self.unique_id_command.display().to_string();

        let output = match Command::new(&self.unique_id_command)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .await
        {
            Ok(output) => output,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(%command, "no unique-id command");

                return Ok(None);
            }
            Err(err) => {
                return Err(PortalIdError::Command {
                    command,
                    reason: err.to_string(),
                })
            }
        };

        if !output.status.success() {
            return Err(PortalIdError::Command {
                command,
                reason: output.status.to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.trim();
        if line.is_empty() {
            warn!(%command, "unique-id command printed nothing");

            return Ok(None);
        }

        match PortalId::new(line) {
            Ok(id) => Ok(Some(id)),
            Err(err) => {
                warn!(%command, error = %Report::new(&err), "invalid portal ID from unique-id command");

                Ok(None)
            }
        }
    }

    async fn from_mac(&self) -> Result<Option<PortalId>, PortalIdError> {
        let path = mac_address_path(&self.sysfs_net_dir, &self.iface);

        match fs::read_to_string(&path).await {
            Ok(mac) => PortalId::from_mac(&mac).map(Some),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(iface = %self.iface, "interface not found");

                Ok(None)
            }
            Err(err) => Err(PortalIdError::Read {
                path,
                backtrace: err,
            }),
        }
    }
}

impl Default for UniqueIdResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PortalIdSource for UniqueIdResolver {
    #[instrument(skip_all)]
    async fn portal_id(&self) -> Result<PortalId, PortalIdError> {
        if let Some(id) = self.from_file().await? {
            debug!(%id, "portal ID read from unique-id file");

            return Ok(id);
        }

        if let Some(id) = self.from_command().await? {
            debug!(%id, "portal ID read from unique-id command");

            return Ok(id);
        }

        if let Some(id) = self.from_mac().await? {
            debug!(%id, iface = %self.iface, "portal ID read from interface MAC");

            return Ok(id);
        }

        Err(PortalIdError::Unavailable)
    }
}

fn mac_address_path(sysfs_net_dir: &Path, iface: &str) -> PathBuf {
    sysfs_net_dir.join(iface).join("address")
}
