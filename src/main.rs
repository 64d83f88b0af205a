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

use clap::Parser;
use eyre::WrapErr;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use vrm_bridge::error::Report;
use vrm_bridge::monitor::{BridgeMonitor, JsonFileSink, LogSink};
use vrm_bridge::portal_id::PortalIdSource;
use vrm_bridge::registrator::BridgeRegistrator;
use vrm_bridge::{register_at_vrm, RegistrationOutcome};

use crate::cli::{Cli, Command, Monitor, Register, UniqueId};

mod cli;

/// Resolves when Ctrl-C is received.
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %Report::new(&err), "couldn't listen for Ctrl-C");

        // Never resolve, the process is stopped by other means
        std::future::pending::<()>().await;
    }

    info!("shutdown requested");
}

async fn register(args: Register) -> eyre::Result<()> {
    let resolver = args.unique_id.resolver();
    let config = args.registrator_config();

    let outcome = if args.retry {
        let portal_id = resolver
            .portal_id()
            .await
            .wrap_err("couldn't resolve the VRM portal ID")?;

        BridgeRegistrator::new(portal_id, config)
            .register_until_success(shutdown_signal())
            .await?
    } else {
        register_at_vrm(&resolver, |portal_id| {
            BridgeRegistrator::new(portal_id, config)
        })
        .await?
    };

    match outcome {
        RegistrationOutcome::Unchanged => info!("bridge configuration unchanged"),
        RegistrationOutcome::Updated => info!("bridge configuration updated"),
    }

    Ok(())
}

async fn portal_id(args: UniqueId) -> eyre::Result<()> {
    let portal_id = args
        .resolver()
        .portal_id()
        .await
        .wrap_err("couldn't resolve the VRM portal ID")?;

    println!("{portal_id}");

    Ok(())
}

async fn monitor(args: Monitor) -> eyre::Result<()> {
    let portal_id = args
        .unique_id
        .resolver()
        .portal_id()
        .await
        .wrap_err("couldn't resolve the VRM portal ID")?;

    let config = args.monitor_config();

    match &args.status_file {
        Some(path) => {
            BridgeMonitor::new(portal_id, config, JsonFileSink::new(path))
                .run(shutdown_signal())
                .await
        }
        None => {
            BridgeMonitor::new(portal_id, config, LogSink)
                .run(shutdown_signal())
                .await
        }
    }
    .wrap_err("bridge monitor failed")
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()?;

    let cli = Cli::parse();

    match cli.into_command() {
        Command::Register(args) => register(args).await,
        Command::PortalId(args) => portal_id(args).await,
        Command::Monitor(args) => monitor(args).await,
    }
}
