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

use std::path::PathBuf;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand};
use url::Url;
use vrm_bridge::bridge_config::{BrokerFlavor, DEFAULT_CA_FILE};
use vrm_bridge::bridge_state::VrmPortalMode;
use vrm_bridge::broker::{DEFAULT_BRIDGE_PORT, VRM_API_URL};
use vrm_bridge::credentials::DEFAULT_PASSWORD_FILE;
use vrm_bridge::monitor::{MonitorConfig, DEFAULT_HOST, DEFAULT_PORT};
use vrm_bridge::portal_id::{
    UniqueIdResolver, DEFAULT_IFACE, DEFAULT_UNIQUE_ID_COMMAND, DEFAULT_UNIQUE_ID_FILE, IFACE_ENV,
};
use vrm_bridge::registrator::RegistratorConfig;
use vrm_bridge::tls::IGNORE_SSL_ENV;

/// Registers the device at the VRM portal and configures the MQTT bridges.
#[derive(Debug, Parser)]
#[command(version, about, args_conflicts_with_subcommands = true)]
pub(crate) struct Cli {
    /// Command to run, registers the device when omitted
    #[command(subcommand)]
    pub(crate) command: Option<Command>,

    #[command(flatten)]
    pub(crate) register: Register,
}

impl Cli {
    pub(crate) fn into_command(self) -> Command {
        self.command.unwrap_or(Command::Register(self.register))
    }
}

#[derive(Debug, Clone, Subcommand)]
pub(crate) enum Command {
    /// Register at the VRM portal and write the bridge configuration
    Register(Register),
    /// Print the VRM portal ID of the device
    PortalId(UniqueId),
    /// Report the connection state of the bridges
    Monitor(Monitor),
}

#[derive(Debug, Clone, Args)]
pub(crate) struct UniqueId {
    /// File with the unique identifier of the device.
    #[arg(long, env = "VRM_UNIQUE_ID_FILE", default_value = DEFAULT_UNIQUE_ID_FILE)]
    pub(crate) unique_id_file: PathBuf,
    /// Command printing the unique identifier, used if the file is missing.
    #[arg(long, env = "VRM_UNIQUE_ID_COMMAND", default_value = DEFAULT_UNIQUE_ID_COMMAND)]
    pub(crate) unique_id_command: PathBuf,
    /// Network interface whose MAC address is used as last resort.
    #[arg(long, env = IFACE_ENV, default_value = DEFAULT_IFACE)]
    pub(crate) iface: String,
}

impl UniqueId {
    pub(crate) fn resolver(&self) -> UniqueIdResolver {
        UniqueIdResolver::new()
            .unique_id_file(&self.unique_id_file)
            .unique_id_command(&self.unique_id_command)
            .iface(&self.iface)
    }
}

#[derive(Debug, Clone, Args)]
pub(crate) struct Register {
    #[command(flatten)]
    pub(crate) unique_id: UniqueId,
    /// Broker to write the configuration for (flashmq or mosquitto).
    #[arg(long, env = "VRM_BROKER_FLAVOR", default_value = "flashmq")]
    pub(crate) flavor: BrokerFlavor,
    /// Path of the bridge configuration, the broker default when not set.
    #[arg(long, env = "VRM_BRIDGE_CONFIG")]
    pub(crate) config_path: Option<PathBuf>,
    /// File keeping the broker password.
    #[arg(long, env = "VRM_PASSWORD_FILE", default_value = DEFAULT_PASSWORD_FILE)]
    pub(crate) password_file: PathBuf,
    /// Base URL of the VRM API.
    #[arg(long, env = "VRM_API_URL", default_value = VRM_API_URL)]
    pub(crate) api_url: Url,
    /// CA bundle verifying the VRM servers.
    #[arg(long, env = "VRM_CA_BUNDLE", default_value = DEFAULT_CA_FILE)]
    pub(crate) ca_bundle: PathBuf,
    /// Verify the VRM API with the system roots instead of the CA bundle.
    #[arg(long, env = "VRM_NO_CA_BUNDLE", conflicts_with = "ca_bundle", value_parser = BoolishValueParser::new())]
    pub(crate) no_ca_bundle: bool,
    /// Ignore the certificate errors of the VRM API.
    #[arg(long, env = IGNORE_SSL_ENV, value_parser = BoolishValueParser::new())]
    pub(crate) ignore_ssl_errors: bool,
    /// Data broker, computed from the portal ID when not set.
    #[arg(long, env = "VRM_BROKER_HOST")]
    pub(crate) broker_host: Option<String>,
    /// Port of the VRM brokers.
    #[arg(long, env = "VRM_BROKER_PORT", default_value_t = DEFAULT_BRIDGE_PORT)]
    pub(crate) port: u16,
    /// VRM portal mode (off, read-only or full).
    #[arg(long, env = "VRM_PORTAL_MODE", default_value = "full")]
    pub(crate) portal_mode: VrmPortalMode,
    /// Command reloading the broker after the configuration changed.
    ///
    /// The command is split on white spaces, quotes are not interpreted.
    #[arg(long, env = "VRM_RELOAD_COMMAND")]
    pub(crate) reload_command: Option<String>,
    /// Timeout in seconds of the requests to the VRM API.
    #[arg(long, env = "VRM_TIMEOUT", default_value_t = 5)]
    pub(crate) timeout: u64,
    /// Keep retrying in the background until the registration succeeds.
    #[arg(long, env = "VRM_RETRY", value_parser = BoolishValueParser::new())]
    pub(crate) retry: bool,
}

impl Register {
    pub(crate) fn registrator_config(&self) -> RegistratorConfig {
        let ca_bundle = (!self.no_ca_bundle).then(|| self.ca_bundle.clone());

        let mut config = RegistratorConfig::default()
            .flavor(self.flavor)
            .password_file(&self.password_file)
            .api_url(self.api_url.clone())
            .ca_bundle(ca_bundle)
            .port(self.port)
            .portal_mode(self.portal_mode)
            .timeout(Duration::from_secs(self.timeout));

        if let Some(path) = &self.config_path {
            config = config.config_path(path);
        }

        if self.ignore_ssl_errors {
            config = config.ignore_ssl_errors();
        }

        if let Some(host) = &self.broker_host {
            config = config.broker_host(host);
        }

        if let Some(argv) = self.reload_command.as_deref().and_then(split_command) {
            config = config.reload_command(argv);
        }

        config
    }
}

#[derive(Debug, Clone, Args)]
pub(crate) struct Monitor {
    #[command(flatten)]
    pub(crate) unique_id: UniqueId,
    /// Host of the local broker.
    #[arg(long, env = "VRM_MONITOR_HOST", default_value = DEFAULT_HOST)]
    pub(crate) host: String,
    /// Port of the local broker.
    #[arg(long, env = "VRM_MONITOR_PORT", default_value_t = DEFAULT_PORT)]
    pub(crate) port: u16,
    /// Write the bridge states as JSON to this file, they are only logged otherwise.
    #[arg(long, env = "VRM_STATUS_FILE")]
    pub(crate) status_file: Option<PathBuf>,
    /// Registration command started in the background.
    ///
    /// The command is split on white spaces, quotes are not interpreted.
    #[arg(long, env = "VRM_REGISTRATOR_COMMAND")]
    pub(crate) registrator_command: Option<String>,
}

impl Monitor {
    pub(crate) fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig::default()
            .host(&self.host)
            .port(self.port)
            .registrator_command(self.registrator_command.as_deref().and_then(split_command))
    }
}

/// Splits a command on the white spaces, returns [`None`] when empty.
///
/// No shell is involved, so quotes are kept as part of the arguments.
fn split_command(command: &str) -> Option<Vec<String>> {
    let argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();

    (!argv.is_empty()).then_some(argv)
}
