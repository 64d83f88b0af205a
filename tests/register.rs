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

use std::path::Path;

use mockito::{Matcher, Server, ServerGuard};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use vrm_bridge::bridge_config::ExistingSettings;
use vrm_bridge::bridge_state::VrmPortalMode;
use vrm_bridge::portal_id::{PortalIdError, UniqueIdResolver};
use vrm_bridge::registrator::{BridgeRegistrator, RegistratorConfig};
use vrm_bridge::{register_at_vrm, Error, RegistrationOutcome};

const ID: &str = "c0619ab1b2c3";

fn resolver(dir: &Path) -> UniqueIdResolver {
    UniqueIdResolver::new()
        .unique_id_file(dir.join("unique-id"))
        .unique_id_command(dir.join("get-unique-id"))
        .sysfs_net_dir(dir.join("net"))
}

fn config(dir: &Path, server: &ServerGuard) -> RegistratorConfig {
    let reload = format!("echo reloaded >> {}", dir.join("reloads").display());

    RegistratorConfig::default()
        .config_path(dir.join("flashmq.d").join("vrm_bridge.conf"))
        .password_file(dir.join("mqtt_password.txt"))
        .api_url(server.url().parse().unwrap())
        .ca_bundle(None)
        .ignore_ssl_errors()
        .reload_command(vec!["sh".to_string(), "-c".to_string(), reload])
}

async fn reloads(dir: &Path) -> usize {
    match tokio::fs::read_to_string(dir.join("reloads")).await {
        Ok(content) => content.lines().count(),
        Err(_) => 0,
    }
}

#[tokio::test]
async fn register_device() {
    let dir = TempDir::new().unwrap();
    tokio::fs::write(dir.path().join("unique-id"), format!("{ID}\n"))
        .await
        .unwrap();

    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/log/storemqttpassword.php")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("identifier".to_string(), format!("ccgxapikey_{ID}")),
            Matcher::Regex("mqttPassword=".to_string()),
        ]))
        .with_status(200)
        .expect(2)
        .create_async()
        .await;

    let resolver = resolver(dir.path());
    let config = config(dir.path(), &server);
    let path = config.bridge_config_path();

    let outcome = register_at_vrm(&resolver, |portal_id| {
        BridgeRegistrator::new(portal_id, config.clone())
    })
    .await
    .unwrap();

    assert_eq!(outcome, RegistrationOutcome::Updated);
    assert_eq!(reloads(dir.path()).await, 1);

    let written = tokio::fs::read_to_string(&path).await.unwrap();
    let password = tokio::fs::read_to_string(dir.path().join("mqtt_password.txt"))
        .await
        .unwrap();

    assert_eq!(
        ExistingSettings::parse(&written).password.as_deref(),
        Some(password.as_str())
    );
    assert!(written.contains("address mqtt81.victronenergy.com"));
    assert!(written.contains("address mqtt-rpc.victronenergy.com"));
    assert!(written.contains("publish N/c0619ab1b2c3/#"));

    // Registering again keeps the configuration and doesn't reload the broker
    let outcome = register_at_vrm(&resolver, |portal_id| {
        BridgeRegistrator::new(portal_id, config.clone())
    })
    .await
    .unwrap();

    assert_eq!(outcome, RegistrationOutcome::Unchanged);
    assert_eq!(reloads(dir.path()).await, 1);
    assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), written);

    mock.assert_async().await;
}

#[tokio::test]
async fn register_read_only_device() {
    let dir = TempDir::new().unwrap();
    tokio::fs::write(dir.path().join("unique-id"), ID).await.unwrap();

    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/log/storemqttpassword.php")
        .with_status(200)
        .create_async()
        .await;

    let config = config(dir.path(), &server).portal_mode(VrmPortalMode::ReadOnly);
    let path = config.bridge_config_path();

    register_at_vrm(&resolver(dir.path()), |portal_id| {
        BridgeRegistrator::new(portal_id, config)
    })
    .await
    .unwrap();

    let written = tokio::fs::read_to_string(&path).await.unwrap();
    assert!(written.contains("address mqtt81.victronenergy.com"));
    assert!(!written.contains("mqtt-rpc.victronenergy.com"));

    mock.assert_async().await;
}

#[tokio::test]
async fn keep_config_on_api_error() {
    let dir = TempDir::new().unwrap();
    tokio::fs::write(dir.path().join("unique-id"), ID).await.unwrap();

    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/log/storemqttpassword.php")
        .with_status(500)
        .with_body("try again later")
        .create_async()
        .await;

    let config = config(dir.path(), &server);
    let path = config.bridge_config_path();

    let err = register_at_vrm(&resolver(dir.path()), |portal_id| {
        BridgeRegistrator::new(portal_id, config)
    })
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Api(_)), "unexpected error {err:?}");
    assert!(!path.exists());
    assert_eq!(reloads(dir.path()).await, 0);

    mock.assert_async().await;
}

#[tokio::test]
async fn fail_without_portal_id() {
    let dir = TempDir::new().unwrap();

    let err = register_at_vrm(&resolver(dir.path()), |portal_id| {
        BridgeRegistrator::new(portal_id, RegistratorConfig::default())
    })
    .await
    .unwrap_err();

    assert!(
        matches!(err, Error::PortalId(PortalIdError::Unavailable)),
        "unexpected error {err:?}"
    );
}
