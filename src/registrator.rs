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

//! Registers the device at the VRM portal and writes the bridge configuration of the broker.
//!
//! The registration stores a password for the `ccgxapikey_<portal id>` user through the VRM API,
//! then configures the local broker to bridge the device topics to the VRM brokers with it.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, error, info, instrument};
use url::Url;

use crate::api::{ApiClient, ApiError};
use crate::bridge_config::{BridgeSettings, BrokerFlavor, ExistingSettings, DEFAULT_CA_FILE};
use crate::bridge_state::VrmPortalMode;
use crate::broker::{vrm_broker_host, DEFAULT_BRIDGE_PORT, RPC_BROKER_HOST, VRM_API_URL};
use crate::credentials::{
    broker_identifier, generate_client_id, load_or_generate_password, Secret,
    DEFAULT_PASSWORD_FILE,
};
use crate::error::{Error, Report};
use crate::portal_id::PortalId;
use crate::process;
use crate::retry::{Backoff, MAX_REGISTRATION_DELAY};
use crate::tls;
use crate::utils::write_atomic;

/// Timeout of the first registration attempt.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout of the attempts retried in the background.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// The bridge configuration was already correct.
    Unchanged,
    /// A new bridge configuration was written.
    Updated,
}

/// Registers the device bridges.
#[allow(async_fn_in_trait)]
#[cfg_attr(test, mockall::automock)]
pub trait Registrator {
    /// Registers at the VRM portal and configures the bridges.
    async fn register(&self) -> Result<RegistrationOutcome, Error>;
}

/// Configuration of the [`BridgeRegistrator`].
///
/// As a default this configuration:
///
/// - writes the FlashMQ bridge configuration.
/// - verifies the VRM API with the CCGX CA bundle.
/// - configures both the data and RPC bridges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistratorConfig {
    pub(crate) flavor: BrokerFlavor,
    pub(crate) config_path: Option<PathBuf>,
    pub(crate) password_file: PathBuf,
    pub(crate) api_url: Option<Url>,
    pub(crate) ca_bundle: Option<PathBuf>,
    pub(crate) ignore_ssl_errors: bool,
    pub(crate) broker_host: Option<String>,
    pub(crate) rpc_host: String,
    pub(crate) port: u16,
    pub(crate) portal_mode: VrmPortalMode,
    pub(crate) reload_command: Option<Vec<String>>,
    pub(crate) timeout: Duration,
    pub(crate) retry_timeout: Duration,
}

impl Default for RegistratorConfig {
    fn default() -> Self {
        Self {
            flavor: BrokerFlavor::default(),
            config_path: None,
            password_file: PathBuf::from(DEFAULT_PASSWORD_FILE),
            api_url: None,
            ca_bundle: Some(PathBuf::from(DEFAULT_CA_FILE)),
            ignore_ssl_errors: false,
            broker_host: None,
            rpc_host: RPC_BROKER_HOST.to_string(),
            port: DEFAULT_BRIDGE_PORT,
            portal_mode: VrmPortalMode::default(),
            reload_command: None,
            timeout: DEFAULT_TIMEOUT,
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
        }
    }
}

impl RegistratorConfig {
    /// Sets the broker to write the configuration for.
    pub fn flavor(mut self, flavor: BrokerFlavor) -> Self {
        self.flavor = flavor;

        self
    }

    /// Overrides the path of the bridge configuration.
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());

        self
    }

    /// Sets the file keeping the broker password.
    pub fn password_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.password_file = path.into();

        self
    }

    /// Sets the base URL of the VRM API.
    pub fn api_url(mut self, url: Url) -> Self {
        self.api_url = Some(url);

        self
    }

    /// Sets the CA bundle, with [`None`] the system roots are used for the API.
    pub fn ca_bundle(mut self, path: Option<PathBuf>) -> Self {
        self.ca_bundle = path;

        self
    }

    /// Ignore TLS/SSL certificate errors of the VRM API.
    pub fn ignore_ssl_errors(mut self) -> Self {
        self.ignore_ssl_errors = true;

        self
    }

    /// Overrides the data broker, computed from the portal ID otherwise.
    pub fn broker_host(mut self, host: impl Into<String>) -> Self {
        self.broker_host = Some(host.into());

        self
    }

    /// Sets the RPC broker.
    pub fn rpc_host(mut self, host: impl Into<String>) -> Self {
        self.rpc_host = host.into();

        self
    }

    /// Sets the port of the remote brokers.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;

        self
    }

    /// Sets the portal mode selecting the bridges.
    pub fn portal_mode(mut self, mode: VrmPortalMode) -> Self {
        self.portal_mode = mode;

        self
    }

    /// Command run after the configuration changed, like `["svc", "-t", "/service/flashmq"]`.
    pub fn reload_command(mut self, argv: Vec<String>) -> Self {
        self.reload_command = Some(argv);

        self
    }

    /// Sets the timeout of the first attempt.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;

        self
    }

    /// Sets the timeout of the retried attempts.
    pub fn retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = timeout;

        self
    }

    /// Path of the bridge configuration.
    pub fn bridge_config_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(|| self.flavor.default_config_path())
    }

    fn vrm_api_url(&self) -> Result<Url, ApiError> {
        match &self.api_url {
            Some(url) => Ok(url.clone()),
            None => Url::parse(VRM_API_URL).map_err(ApiError::InvalidUrl),
        }
    }
}

/// Registers the bridges of a device.
#[derive(Debug, Clone)]
pub struct BridgeRegistrator {
    portal_id: PortalId,
    config: RegistratorConfig,
}

impl BridgeRegistrator {
    /// Creates the registrator for the device, no I/O is done.
    pub fn new(portal_id: PortalId, config: RegistratorConfig) -> Self {
        Self { portal_id, config }
    }

    /// Portal ID of the device.
    pub fn portal_id(&self) -> &PortalId {
        &self.portal_id
    }

    /// Configuration of the registrator.
    pub fn config(&self) -> &RegistratorConfig {
        &self.config
    }

    /// Retries the registration until it succeeds or the shutdown future resolves.
    ///
    /// Only the first attempt is logged as an error, the following ones are retried silently.
    pub async fn register_until_success<F>(&self, shutdown: F) -> Result<RegistrationOutcome, Error>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        match self.try_register(false, self.config.timeout).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) => {
                info!(error = %Report::new(&err), "registration failed, retrying in the background, silently");
            }
        }

        let mut backoff = Backoff::with_max(MAX_REGISTRATION_DELAY);

        loop {
            let delay = backoff.next_delay();

            debug!("waiting for {} seconds before retry", delay.as_secs());

            tokio::select! {
                () = &mut shutdown => return Err(Error::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }

            let res = tokio::select! {
                () = &mut shutdown => return Err(Error::Cancelled),
                res = self.try_register(true, self.config.retry_timeout) => res,
            };

            match res {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    debug!(error = %Report::new(&err), "registration attempt failed");
                }
            }
        }
    }

    #[instrument(skip(self), fields(portal_id = %self.portal_id))]
    async fn try_register(
        &self,
        quiet: bool,
        timeout: Duration,
    ) -> Result<RegistrationOutcome, Error> {
        let config_path = self.config.bridge_config_path();

        let existing = read_existing_config(&config_path).await?;
        let settings = existing
            .as_deref()
            .map(ExistingSettings::parse)
            .unwrap_or_default();

        let client_id = settings.client_id.unwrap_or_else(generate_client_id);
        let password = match settings.password {
            Some(password) => Secret::new(password),
            None => load_or_generate_password(&self.config.password_file).await?,
        };

        if !quiet {
            info!("registering at the VRM portal");
        }

        let tls =
            tls::client_config(self.config.ca_bundle.as_deref(), self.config.ignore_ssl_errors)
                .await?;
        let client = ApiClient::new(self.config.vrm_api_url()?, tls, timeout)?;

        let identifier = broker_identifier(&self.portal_id);
        if let Err(err) = client.store_mqtt_password(&identifier, &password).await {
            if !quiet {
                match &err {
                    ApiError::Status { status, body } => {
                        error!(%status, %body, "VRM registration failed");
                    }
                    err => error!(error = %Report::new(err), "VRM registration failed"),
                }
            }

            return Err(err.into());
        }

        let broker_host = self
            .config
            .broker_host
            .clone()
            .unwrap_or_else(|| vrm_broker_host(&self.portal_id));
        let ca_file = self
            .config
            .ca_bundle
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CA_FILE));

        let rendered = BridgeSettings {
            portal_id: &self.portal_id,
            broker_host: &broker_host,
            rpc_host: &self.config.rpc_host,
            port: self.config.port,
            ca_file: &ca_file,
            client_id: &client_id,
            password: &password,
            portal_mode: self.config.portal_mode,
        }
        .render(self.config.flavor);

        if existing.as_deref() == Some(rendered.as_str()) {
            info!(path = %config_path.display(), "registration successful, bridge config is already correct");

            return Ok(RegistrationOutcome::Unchanged);
        }

        info!(path = %config_path.display(), "writing new bridge config");

        write_config(&config_path, &rendered).await?;

        if let Some(argv) = &self.config.reload_command {
            info!(command = %argv.join(" "), "reloading the broker");

            process::run_argv(argv).await.map_err(Error::Reload)?;
        }

        info!("registration successful");

        Ok(RegistrationOutcome::Updated)
    }
}

impl Registrator for BridgeRegistrator {
    async fn register(&self) -> Result<RegistrationOutcome, Error> {
        self.try_register(false, self.config.timeout).await
    }
}

async fn read_existing_config(path: &Path) -> Result<Option<String>, Error> {
    match fs::read_to_string(path).await {
        Ok(config) => Ok(Some(config)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no bridge config yet");

            Ok(None)
        }
        Err(err) => Err(Error::ReadConfig {
            path: path.to_path_buf(),
            backtrace: err,
        }),
    }
}

async fn write_config(path: &Path, config: &str) -> Result<(), Error> {
    let to_error = |err| Error::WriteConfig {
        path: path.to_path_buf(),
        backtrace: err,
    };

    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir).await.map_err(to_error)?;
    }

    write_atomic(path, config.as_bytes()).await.map_err(to_error)
}

#[cfg(test)]
mod tests {
    use mockito::{Server, ServerGuard};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::api::tests::mock_store_password;

    const ID: &str = "c0619ab1b2c3";

    fn test_config(dir: &Path, server: &ServerGuard) -> RegistratorConfig {
        RegistratorConfig::default()
            .flavor(BrokerFlavor::Mosquitto)
            .config_path(dir.join("mosquitto.d").join("vrm_bridge.conf"))
            .password_file(dir.join("mqtt_password.txt"))
            .api_url(server.url().parse().unwrap())
            .ca_bundle(None)
            .ignore_ssl_errors()
    }

    fn registrator(config: RegistratorConfig) -> BridgeRegistrator {
        BridgeRegistrator::new(PortalId::new(ID).unwrap(), config)
    }

    #[test]
    fn should_use_defaults() {
        let config = RegistratorConfig::default();

        assert_eq!(config.bridge_config_path(), Path::new(crate::bridge_config::FLASHMQ_CONFIG_PATH));
        assert_eq!(config.vrm_api_url().unwrap().as_str(), "https://ccgxlogging.victronenergy.com/");
        assert_eq!(config.ca_bundle.as_deref(), Some(Path::new(DEFAULT_CA_FILE)));
        assert_eq!(config.port, 8883);
        assert_eq!(config.portal_mode, VrmPortalMode::Full);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.retry_timeout, Duration::from_secs(60));
    }

    #[test]
    fn should_deserialize_partial_config() {
        let config: RegistratorConfig = serde_json::from_str(
            r#"{"flavor":"mosquitto","portal_mode":"read-only","reload_command":["svc","-t","/service/mosquitto"]}"#,
        )
        .unwrap();

        let expected = RegistratorConfig::default()
            .flavor(BrokerFlavor::Mosquitto)
            .portal_mode(VrmPortalMode::ReadOnly)
            .reload_command(vec![
                "svc".to_string(),
                "-t".to_string(),
                "/service/mosquitto".to_string(),
            ]);

        assert_eq!(config, expected);
        assert_eq!(
            config.bridge_config_path(),
            Path::new(crate::bridge_config::MOSQUITTO_CONFIG_PATH)
        );
    }

    #[tokio::test]
    async fn should_register_and_write_config() {
        let dir = TempDir::new().unwrap();
        let mut server = Server::new_async().await;
        let mock = mock_store_password(&mut server, "ccgxapikey_c0619ab1b2c3", 200)
            .expect(2)
            .create_async()
            .await;

        let config = test_config(dir.path(), &server);
        let path = config.bridge_config_path();
        let registrator = registrator(config);

        let outcome = registrator.register().await.unwrap();
        assert_eq!(outcome, RegistrationOutcome::Updated);

        let written = tokio::fs::read_to_string(&path).await.unwrap();
        let password = tokio::fs::read_to_string(dir.path().join("mqtt_password.txt"))
            .await
            .unwrap();
        let settings = ExistingSettings::parse(&written);

        assert_eq!(settings.password.as_deref(), Some(password.as_str()));
        assert!(written.contains("address mqtt81.victronenergy.com:8883"));
        assert!(written.contains("remote_username ccgxapikey_c0619ab1b2c3"));
        assert!(written.contains("topic N/c0619ab1b2c3/# out 1"));

        // The second registration keeps client ID and password
        let outcome = registrator.register().await.unwrap();
        assert_eq!(outcome, RegistrationOutcome::Unchanged);

        let rewritten = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(written, rewritten);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn should_prefer_password_from_config() {
        let dir = TempDir::new().unwrap();
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/log/storemqttpassword.php")
            .match_body(mockito::Matcher::UrlEncoded(
                "mqttPassword".to_string(),
                "from-config".to_string(),
            ))
            .with_status(200)
            .create_async()
            .await;

        let config = test_config(dir.path(), &server);
        let path = config.bridge_config_path();
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(
            &path,
            "connection GXdbus\nremote_clientid ccgx_existing\nremote_password from-config\n",
        )
        .await
        .unwrap();
        tokio::fs::write(dir.path().join("mqtt_password.txt"), "from-file")
            .await
            .unwrap();

        let outcome = registrator(config).register().await.unwrap();
        assert_eq!(outcome, RegistrationOutcome::Updated);

        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(written.contains("remote_clientid ccgx_existing\n"));
        assert!(written.contains("remote_clientid rpc-ccgx_existing\n"));
        assert!(written.contains("remote_password from-config\n"));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn should_not_write_config_on_api_error() {
        let dir = TempDir::new().unwrap();
        let mut server = Server::new_async().await;
        let mock = mock_store_password(&mut server, "ccgxapikey_c0619ab1b2c3", 500)
            .with_body("internal error")
            .create_async()
            .await;

        let config = test_config(dir.path(), &server);
        let path = config.bridge_config_path();

        let err = registrator(config).register().await.unwrap_err();

        assert!(matches!(err, Error::Api(ApiError::Status { .. })));
        assert!(!path.exists());
        // The password is kept for the next attempt
        assert!(dir.path().join("mqtt_password.txt").exists());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn should_reload_only_on_change() {
        let dir = TempDir::new().unwrap();
        let mut server = Server::new_async().await;
        let _mock = mock_store_password(&mut server, "ccgxapikey_c0619ab1b2c3", 200)
            .create_async()
            .await;

        let marker = dir.path().join("reloaded");
        let config = test_config(dir.path(), &server).reload_command(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("touch {}", marker.display()),
        ]);
        let registrator = registrator(config);

        registrator.register().await.unwrap();
        assert!(marker.exists());

        tokio::fs::remove_file(&marker).await.unwrap();

        let outcome = registrator.register().await.unwrap();
        assert_eq!(outcome, RegistrationOutcome::Unchanged);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn should_fail_on_reload_error() {
        let dir = TempDir::new().unwrap();
        let mut server = Server::new_async().await;
        let _mock = mock_store_password(&mut server, "ccgxapikey_c0619ab1b2c3", 200)
            .create_async()
            .await;

        let config = test_config(dir.path(), &server)
            .reload_command(vec!["sh".to_string(), "-c".to_string(), "exit 1".to_string()]);

        let err = registrator(config).register().await.unwrap_err();

        assert!(matches!(err, Error::Reload(_)));
    }

    #[tokio::test]
    async fn should_return_on_first_success() {
        let dir = TempDir::new().unwrap();
        let mut server = Server::new_async().await;
        let mock = mock_store_password(&mut server, "ccgxapikey_c0619ab1b2c3", 200)
            .expect(1)
            .create_async()
            .await;

        let outcome = registrator(test_config(dir.path(), &server))
            .register_until_success(std::future::pending())
            .await
            .unwrap();

        assert_eq!(outcome, RegistrationOutcome::Updated);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn should_retry_until_registered() {
        let dir = TempDir::new().unwrap();
        let mut server = Server::new_async().await;
        let unavailable = mock_store_password(&mut server, "ccgxapikey_c0619ab1b2c3", 503)
            .expect(1)
            .create_async()
            .await;
        let stored = mock_store_password(&mut server, "ccgxapikey_c0619ab1b2c3", 200)
            .expect(1)
            .create_async()
            .await;

        let config = test_config(dir.path(), &server);
        let path = config.bridge_config_path();

        // The first retry waits one second
        let outcome = tokio::time::timeout(
            Duration::from_secs(30),
            registrator(config).register_until_success(std::future::pending()),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(outcome, RegistrationOutcome::Updated);
        assert!(path.exists());

        unavailable.assert_async().await;
        stored.assert_async().await;
    }

    #[tokio::test]
    async fn should_stop_retrying_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let mut server = Server::new_async().await;
        let mock = mock_store_password(&mut server, "ccgxapikey_c0619ab1b2c3", 503)
            .expect(1)
            .create_async()
            .await;

        let err = registrator(test_config(dir.path(), &server))
            .register_until_success(std::future::ready(()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn should_write_only_header_when_off() {
        let dir = TempDir::new().unwrap();
        let mut server = Server::new_async().await;
        let _mock = mock_store_password(&mut server, "ccgxapikey_c0619ab1b2c3", 200)
            .create_async()
            .await;

        let config = test_config(dir.path(), &server).portal_mode(VrmPortalMode::Off);
        let path = config.bridge_config_path();

        registrator(config).register().await.unwrap();

        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(!written.contains("connection"));
    }
}
