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

//! Watches the local broker and reports the connection state of the VRM bridges.
//!
//! The broker publishes the state of each bridge connection on
//! `$SYS/broker/connection/<name>/state`, while the portal mode is read from the settings
//! published by the device. Changes are debounced before being reported to a [`StatusSink`].

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use rumqttc::{AsyncClient, ClientError, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::bridge_state::{
    BridgeConnectionState, BridgeName, BridgeStates, EffectiveStates, VrmPortalMode,
};
use crate::error::Report;
use crate::portal_id::PortalId;
use crate::process::{self, ProcessError};
use crate::retry::Backoff;
use crate::utils::write_atomic;

/// Host of the local broker.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Port of the local broker.
pub const DEFAULT_PORT: u16 = 1883;
/// Delay between the last change and the report.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);
/// Filter matching the state of all the bridge connections.
pub const BRIDGE_STATE_FILTER: &str = "$SYS/broker/connection/+/state";

const BRIDGE_STATE_PREFIX: &str = "$SYS/broker/connection/";
const BRIDGE_STATE_SUFFIX: &str = "/state";
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const CHANNEL_CAPACITY: usize = 10;

/// Error returned by the [`BridgeMonitor`].
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum MonitorError {
    /// Couldn't send a request to the local broker.
    #[error("couldn't send the request to the broker")]
    Client(#[from] ClientError),
    /// Couldn't serialize the status.
    #[error("couldn't serialize the bridge status")]
    Serialize(#[from] serde_json::Error),
    /// Couldn't write the status file.
    #[error("couldn't write the status file {}", path.display())]
    WriteStatus {
        /// Path of the status file.
        path: PathBuf,
        #[source]
        backtrace: io::Error,
    },
}

/// Topic of the VRM portal setting of the device.
pub fn vrm_portal_topic(id: &PortalId) -> String {
    format!("N/{id}/settings/0/Settings/Network/VrmPortal")
}

fn keepalive_topic(id: &PortalId) -> String {
    format!("R/{id}/keepalive")
}

/// Returns the bridge of a `$SYS/broker/connection/<name>/state` topic.
pub fn parse_bridge_state_topic(topic: &str) -> Option<BridgeName> {
    let name = topic
        .strip_prefix(BRIDGE_STATE_PREFIX)?
        .strip_suffix(BRIDGE_STATE_SUFFIX)?;

    BridgeName::from_connection_name(name)
}

/// Converts the payload of a bridge state topic.
pub fn parse_connection_payload(payload: &[u8]) -> BridgeConnectionState {
    let text = String::from_utf8_lossy(payload);

    match text.trim() {
        "1" => BridgeConnectionState::new(Some(true), "connected"),
        "0" => BridgeConnectionState::new(Some(false), "disconnected"),
        other => BridgeConnectionState::new(None, other),
    }
}

#[derive(Deserialize)]
struct SettingValue {
    value: Option<serde_json::Value>,
}

/// Converts the payload of the VRM portal setting.
pub fn parse_portal_mode(payload: &[u8]) -> VrmPortalMode {
    serde_json::from_slice::<SettingValue>(payload)
        .ok()
        .and_then(|setting| setting.value)
        .and_then(|value| value.as_i64())
        .map_or(VrmPortalMode::Unknown, VrmPortalMode::from_setting)
}

/// Receives the effective bridge states when they change.
#[allow(async_fn_in_trait)]
pub trait StatusSink {
    /// Reports the new states.
    async fn report(&mut self, states: &EffectiveStates) -> Result<(), MonitorError>;
}

/// Logs the states.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl StatusSink for LogSink {
    async fn report(&mut self, states: &EffectiveStates) -> Result<(), MonitorError> {
        for (bridge, state) in states {
            info!(
                %bridge,
                connected = ?state.connected,
                msg = %state.msg,
                "bridge state"
            );
        }

        Ok(())
    }
}

/// Writes the states as JSON to a file, replacing it atomically.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    /// Creates the sink writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the status file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StatusSink for JsonFileSink {
    async fn report(&mut self, states: &EffectiveStates) -> Result<(), MonitorError> {
        let content = serde_json::to_vec(states)?;

        write_atomic(&self.path, &content)
            .await
            .map_err(|err| MonitorError::WriteStatus {
                path: self.path.clone(),
                backtrace: err,
            })?;

        debug!(path = %self.path.display(), "status written");

        Ok(())
    }
}

/// Options of the [`BridgeMonitor`].
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    host: String,
    port: u16,
    client_id: String,
    debounce: Duration,
    registrator_command: Option<Vec<String>>,
}

impl MonitorConfig {
    /// Host of the local broker.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();

        self
    }

    /// Port of the local broker.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;

        self
    }

    /// Client id used on the local broker.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();

        self
    }

    /// Delay between the last change and the report.
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;

        self
    }

    /// Command started in the background to register the bridges.
    pub fn registrator_command(mut self, argv: Option<Vec<String>>) -> Self {
        self.registrator_command = argv.filter(|argv| !argv.is_empty());

        self
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            client_id: format!("{}-monitor", env!("CARGO_PKG_NAME")),
            debounce: DEFAULT_DEBOUNCE,
            registrator_command: None,
        }
    }
}

/// Tracks the bridges through the local broker.
#[derive(Debug)]
pub struct BridgeMonitor<S> {
    portal_id: PortalId,
    portal_topic: String,
    config: MonitorConfig,
    states: BridgeStates,
    sink: S,
    deadline: Option<Instant>,
}

impl<S> BridgeMonitor<S>
where
    S: StatusSink,
{
    /// Creates the monitor, the portal mode is unknown until the setting is received.
    pub fn new(portal_id: PortalId, config: MonitorConfig, sink: S) -> Self {
        let portal_topic = vrm_portal_topic(&portal_id);

        Self {
            portal_id,
            portal_topic,
            config,
            states: BridgeStates::new(VrmPortalMode::Unknown),
            sink,
            deadline: None,
        }
    }

    /// Current states of the bridges.
    pub fn states(&self) -> &BridgeStates {
        &self.states
    }

    /// Returns `true` while a report is scheduled.
    pub fn is_report_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Handles a message of the broker, returns `true` if the state changed.
    ///
    /// A change schedules the report after the debounce delay, postponing the previous one.
    pub fn handle_publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        let changed = if topic == self.portal_topic {
            let mode = parse_portal_mode(payload);

            debug!(%mode, "VRM portal mode received");

            self.states.set_mode(mode)
        } else if let Some(bridge) = parse_bridge_state_topic(topic) {
            let state = parse_connection_payload(payload);

            debug!(%bridge, msg = %state.msg, "bridge state received");

            self.states.set(bridge, state)
        } else {
            trace!(topic, "ignoring message");

            false
        };

        if changed {
            self.schedule_report();
        }

        changed
    }

    fn schedule_report(&mut self) {
        self.deadline = Some(Instant::now() + self.config.debounce);
    }

    /// Reports the states if they changed since the last report.
    pub async fn flush(&mut self) -> Result<(), MonitorError> {
        self.deadline = None;

        let Some(states) = self.states.take_changes() else {
            trace!("no changes to report");

            return Ok(());
        };

        self.sink.report(&states).await
    }

    async fn report(&mut self) {
        if let Err(err) = self.flush().await {
            error!(error = %Report::new(&err), "couldn't report the bridge states");
        }
    }

    /// Waits `delay` before a reconnection, still sending the scheduled reports.
    ///
    /// Returns `false` if the shutdown future resolved first.
    async fn wait_reconnect<F>(&mut self, delay: Duration, mut shutdown: Pin<&mut F>) -> bool
    where
        F: Future<Output = ()>,
    {
        let reconnect = tokio::time::sleep(delay);
        tokio::pin!(reconnect);

        loop {
            tokio::select! {
                () = shutdown.as_mut() => return false,
                () = &mut reconnect => return true,
                () = sleep_until_deadline(self.deadline) => self.report().await,
            }
        }
    }

    async fn on_connected(&self, client: &AsyncClient) -> Result<(), MonitorError> {
        info!(
            host = %self.config.host,
            port = self.config.port,
            "connected to the local broker"
        );

        client
            .subscribe(BRIDGE_STATE_FILTER, QoS::AtMostOnce)
            .await?;
        client
            .subscribe(self.portal_topic.as_str(), QoS::AtMostOnce)
            .await?;

        // Asks the device to publish its values
        client
            .publish(
                keepalive_topic(&self.portal_id),
                QoS::AtMostOnce,
                false,
                Vec::<u8>::new(),
            )
            .await?;

        Ok(())
    }

    /// Monitors the bridges until the shutdown future resolves.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), MonitorError>
    where
        F: Future<Output = ()>,
    {
        let mut options =
            MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(KEEP_ALIVE);

        let (client, mut eventloop) = AsyncClient::new(options, CHANNEL_CAPACITY);

        let registration = self
            .config
            .registrator_command
            .clone()
            .map(process::spawn_registration);

        tokio::pin!(shutdown);

        let mut backoff = Backoff::with_max(MAX_RECONNECT_DELAY);
        // Reports the initial states even if nothing is received
        self.schedule_report();

        let res = loop {
            tokio::select! {
                () = &mut shutdown => {
                    debug!("shutting down the monitor");

                    break Ok(());
                }
                () = sleep_until_deadline(self.deadline) => self.report().await,
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        backoff.reset();

                        if let Err(err) = self.on_connected(&client).await {
                            break Err(err);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.handle_publish(&publish.topic, &publish.payload);
                    }
                    Ok(event) => {
                        trace!(?event, "event received");
                    }
                    Err(err) => {
                        let delay = backoff.next_delay();

                        warn!(
                            error = %Report::new(&err),
                            delay_secs = delay.as_secs(),
                            "connection to the local broker failed, retrying"
                        );

                        if !self.wait_reconnect(delay, shutdown.as_mut()).await {
                            break Ok(());
                        }
                    }
                },
            }
        };

        if let Err(err) = client.try_disconnect() {
            debug!(error = %Report::new(&err), "couldn't disconnect from the broker");
        }

        if let Some(handle) = registration {
            stop_registration(handle).await;
        }

        res
    }
}

/// Sleeps until the deadline, or forever without one.
async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn stop_registration(handle: JoinHandle<Result<String, ProcessError>>) {
    if handle.is_finished() {
        return;
    }

    debug!("stopping the registration");

    handle.abort();

    if let Err(err) = handle.await {
        if !err.is_cancelled() {
            error!(error = %Report::new(&err), "registration task failed");
        }
    }
}
