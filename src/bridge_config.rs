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

//! Bridge configuration of the local broker.
//!
//! The configuration is rendered deterministically, so it can be compared with the file on disk
//! to know if the broker needs to be reloaded.

use std::collections::HashMap;
use std::fmt::{self, Display, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bridge_state::{BridgeName, VrmPortalMode};
use crate::credentials::{broker_identifier, Secret};
use crate::portal_id::PortalId;

/// Bridge configuration of FlashMQ.
pub const FLASHMQ_CONFIG_PATH: &str = "/data/conf/flashmq.d/vrm_bridge.conf";
/// Bridge configuration of Mosquitto.
pub const MOSQUITTO_CONFIG_PATH: &str = "/data/conf/mosquitto.d/vrm_bridge.conf";
/// Bundle with the CA of the VRM brokers.
pub const DEFAULT_CA_FILE: &str = "/etc/ssl/certs/ccgx-ca.pem";

const KEEPALIVE_SECS: u32 = 60;

/// Broker running on the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerFlavor {
    /// FlashMQ, configured with `bridge { }` blocks.
    #[default]
    FlashMq,
    /// Mosquitto, configured with `connection` sections.
    Mosquitto,
}

impl BrokerFlavor {
    /// Default path of the bridge configuration.
    pub fn default_config_path(&self) -> PathBuf {
        match self {
            BrokerFlavor::FlashMq => PathBuf::from(FLASHMQ_CONFIG_PATH),
            BrokerFlavor::Mosquitto => PathBuf::from(MOSQUITTO_CONFIG_PATH),
        }
    }
}

impl Display for BrokerFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerFlavor::FlashMq => f.write_str("flashmq"),
            BrokerFlavor::Mosquitto => f.write_str("mosquitto"),
        }
    }
}

/// Error returned when parsing a [`BrokerFlavor`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown broker {0:?}, expected flashmq or mosquitto")]
pub struct ParseFlavorError(String);

impl FromStr for BrokerFlavor {
    type Err = ParseFlavorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flashmq" => Ok(Self::FlashMq),
            "mosquitto" => Ok(Self::Mosquitto),
            _ => Err(ParseFlavorError(s.to_string())),
        }
    }
}

/// Settings recovered from an existing configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExistingSettings {
    /// Client ID of the data bridge.
    pub client_id: Option<String>,
    /// Password of the remote broker.
    pub password: Option<String>,
}

impl ExistingSettings {
    /// Parses the `key value` lines of the configuration, the first occurrence of a key wins.
    pub fn parse(config: &str) -> Self {
        let mut settings = HashMap::new();

        for line in config.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once(' ') else {
                continue;
            };

            let value = value.trim();
            if value.is_empty() {
                continue;
            }

            settings.entry(key).or_insert(value);
        }

        Self {
            client_id: settings.get("remote_clientid").map(|v| v.to_string()),
            password: settings.get("remote_password").map(|v| v.to_string()),
        }
    }
}

/// Everything needed to render the bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeSettings<'a> {
    /// Portal ID of the device.
    pub portal_id: &'a PortalId,
    /// Host of the data broker.
    pub broker_host: &'a str,
    /// Host of the RPC broker.
    pub rpc_host: &'a str,
    /// Port of the remote brokers.
    pub port: u16,
    /// CA bundle to verify the remote brokers.
    pub ca_file: &'a Path,
    /// Client ID of the data bridge.
    pub client_id: &'a str,
    /// Password of the remote brokers.
    pub password: &'a Secret,
    /// Mode selecting the bridges to configure.
    pub portal_mode: VrmPortalMode,
}

struct Bridge<'a> {
    name: BridgeName,
    host: &'a str,
    client_id: String,
    publish: String,
    subscribe: Vec<String>,
}

impl BridgeSettings<'_> {
    fn bridges(&self) -> Vec<Bridge<'_>> {
        let id = self.portal_id;

        BridgeName::ALL
            .into_iter()
            .filter(|name| name.is_enabled(self.portal_mode))
            .map(|name| match name {
                BridgeName::Dbus => Bridge {
                    name,
                    host: self.broker_host,
                    client_id: self.client_id.to_string(),
                    publish: format!("N/{id}/#"),
                    subscribe: vec![format!("R/{id}/#"), format!("W/{id}/#")],
                },
                BridgeName::Rpc => Bridge {
                    name,
                    host: self.rpc_host,
                    client_id: format!("rpc-{}", self.client_id),
                    publish: format!("P/{id}/out/#"),
                    subscribe: vec![format!("P/{id}/in/#")],
                },
            })
            .collect()
    }

    /// Renders the configuration for the given broker.
    pub fn render(&self, flavor: BrokerFlavor) -> String {
        let mut out = String::new();

        // Writing to a String never fails
        let _ = self.write_config(&mut out, flavor);

        out
    }

    fn write_config(&self, out: &mut String, flavor: BrokerFlavor) -> fmt::Result {
        writeln!(out, "# Generated by vrm-bridge, changes will be overwritten.")?;
        writeln!(out, "# VRM portal mode: {}", self.portal_mode)?;

        let username = broker_identifier(self.portal_id);

        for bridge in self.bridges() {
            writeln!(out)?;

            match flavor {
                BrokerFlavor::FlashMq => self.write_flashmq(out, &bridge, &username)?,
                BrokerFlavor::Mosquitto => self.write_mosquitto(out, &bridge, &username)?,
            }
        }

        Ok(())
    }

    fn write_flashmq(&self, out: &mut String, bridge: &Bridge, username: &str) -> fmt::Result {
        writeln!(out, "bridge {{")?;
        writeln!(out, "    address {}", bridge.host)?;
        writeln!(out, "    port {}", self.port)?;
        writeln!(out, "    tls on")?;
        writeln!(out, "    ca_file {}", self.ca_file.display())?;
        writeln!(out, "    protocol_version mqtt3.1.1")?;
        writeln!(out, "    keepalive {KEEPALIVE_SECS}")?;
        writeln!(out, "    clean_start true")?;
        writeln!(out, "    clientid_prefix {}", bridge.name)?;
        writeln!(out, "    bridge_protocol_bit true")?;
        writeln!(out, "    remote_username {username}")?;
        writeln!(out, "    remote_password {}", self.password.expose())?;
        writeln!(out, "    publish {}", bridge.publish)?;
        for topic in &bridge.subscribe {
            writeln!(out, "    subscribe {topic}")?;
        }
        writeln!(out, "}}")
    }

    fn write_mosquitto(&self, out: &mut String, bridge: &Bridge, username: &str) -> fmt::Result {
        writeln!(out, "connection {}", bridge.name)?;
        writeln!(out, "address {}:{}", bridge.host, self.port)?;
        writeln!(out, "bridge_cafile {}", self.ca_file.display())?;
        writeln!(out, "bridge_insecure false")?;
        writeln!(out, "bridge_protocol_version mqttv311")?;
        writeln!(out, "keepalive_interval {KEEPALIVE_SECS}")?;
        writeln!(out, "cleansession true")?;
        writeln!(out, "try_private false")?;
        writeln!(out, "remote_clientid {}", bridge.client_id)?;
        writeln!(out, "remote_username {username}")?;
        writeln!(out, "remote_password {}", self.password.expose())?;
        writeln!(out, "notifications true")?;
        writeln!(
            out,
            "notification_topic $SYS/broker/connection/{}/state",
            bridge.name
        )?;
        writeln!(out, "topic {} out 1", bridge.publish)?;
        for topic in &bridge.subscribe {
            writeln!(out, "topic {topic} in 1")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn settings<'a>(
        id: &'a PortalId,
        password: &'a Secret,
        portal_mode: VrmPortalMode,
    ) -> BridgeSettings<'a> {
        BridgeSettings {
            portal_id: id,
            broker_host: "mqtt81.victronenergy.com",
            rpc_host: "mqtt-rpc.victronenergy.com",
            port: 8883,
            ca_file: Path::new("/etc/ssl/certs/ccgx-ca.pem"),
            client_id: "ccgx_abcdefghijkl",
            password,
            portal_mode,
        }
    }

    #[test]
    fn should_parse_flavor() {
        assert_eq!("flashmq".parse::<BrokerFlavor>().unwrap(), BrokerFlavor::FlashMq);
        assert_eq!("Mosquitto".parse::<BrokerFlavor>().unwrap(), BrokerFlavor::Mosquitto);
        assert!("emqx".parse::<BrokerFlavor>().is_err());
    }

    #[test]
    fn should_parse_existing_settings() {
        let config = "\
# remote_password commented
connection GXdbus
remote_clientid ccgx_first
remote_password pw1
remote_username

connection GXrpc
remote_clientid rpc-ccgx_first
remote_password pw2
";

        let settings = ExistingSettings::parse(config);

        assert_eq!(
            settings,
            ExistingSettings {
                client_id: Some("ccgx_first".to_string()),
                password: Some("pw1".to_string()),
            }
        );
    }

    #[test]
    fn should_parse_flashmq_settings() {
        let config = "bridge {\n    address host\n    remote_password secret\n}\n";

        let settings = ExistingSettings::parse(config);

        assert_eq!(settings.client_id, None);
        assert_eq!(settings.password.as_deref(), Some("secret"));
    }

    #[test]
    fn should_render_mosquitto() {
        let id = PortalId::new("c0619ab1b2c3").unwrap();
        let password = Secret::new("pw");

        let config = settings(&id, &password, VrmPortalMode::Full).render(BrokerFlavor::Mosquitto);

        let expected = "\
# Generated by vrm-bridge, changes will be overwritten.
# VRM portal mode: full

connection GXdbus
address mqtt81.victronenergy.com:8883
bridge_cafile /etc/ssl/certs/ccgx-ca.pem
bridge_insecure false
bridge_protocol_version mqttv311
keepalive_interval 60
cleansession true
try_private false
remote_clientid ccgx_abcdefghijkl
remote_username ccgxapikey_c0619ab1b2c3
remote_password pw
notifications true
notification_topic $SYS/broker/connection/GXdbus/state
topic N/c0619ab1b2c3/# out 1
topic R/c0619ab1b2c3/# in 1
topic W/c0619ab1b2c3/# in 1

connection GXrpc
address mqtt-rpc.victronenergy.com:8883
bridge_cafile /etc/ssl/certs/ccgx-ca.pem
bridge_insecure false
bridge_protocol_version mqttv311
keepalive_interval 60
cleansession true
try_private false
remote_clientid rpc-ccgx_abcdefghijkl
remote_username ccgxapikey_c0619ab1b2c3
remote_password pw
notifications true
notification_topic $SYS/broker/connection/GXrpc/state
topic P/c0619ab1b2c3/out/# out 1
topic P/c0619ab1b2c3/in/# in 1
";

        assert_eq!(config, expected);
    }

    #[test]
    fn should_render_flashmq_read_only() {
        let id = PortalId::new("c0619ab1b2c3").unwrap();
        let password = Secret::new("pw");

        let config =
            settings(&id, &password, VrmPortalMode::ReadOnly).render(BrokerFlavor::FlashMq);

        let expected = "\
# Generated by vrm-bridge, changes will be overwritten.
# VRM portal mode: read-only

bridge {
    address mqtt81.victronenergy.com
    port 8883
    tls on
    ca_file /etc/ssl/certs/ccgx-ca.pem
    protocol_version mqtt3.1.1
    keepalive 60
    clean_start true
    clientid_prefix GXdbus
    bridge_protocol_bit true
    remote_username ccgxapikey_c0619ab1b2c3
    remote_password pw
    publish N/c0619ab1b2c3/#
    subscribe R/c0619ab1b2c3/#
    subscribe W/c0619ab1b2c3/#
}
";

        assert_eq!(config, expected);
    }

    #[test]
    fn should_render_only_header_when_off() {
        let id = PortalId::new("c0619ab1b2c3").unwrap();
        let password = Secret::new("pw");

        for flavor in [BrokerFlavor::FlashMq, BrokerFlavor::Mosquitto] {
            let config = settings(&id, &password, VrmPortalMode::Off).render(flavor);

            assert_eq!(
                config,
                "# Generated by vrm-bridge, changes will be overwritten.\n# VRM portal mode: off\n"
            );
        }
    }

    #[test]
    fn should_read_back_rendered_settings() {
        let id = PortalId::new("c0619ab1b2c3").unwrap();
        let password = Secret::new("pw");

        let config = settings(&id, &password, VrmPortalMode::Full).render(BrokerFlavor::Mosquitto);
        let existing = ExistingSettings::parse(&config);

        assert_eq!(existing.client_id.as_deref(), Some("ccgx_abcdefghijkl"));
        assert_eq!(existing.password.as_deref(), Some("pw"));
    }
}
