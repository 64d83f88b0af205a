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

#![doc = include_str!("../README.md")]

pub mod api;
pub mod bridge_config;
pub mod bridge_state;
pub mod broker;
pub mod credentials;
pub mod error;
pub mod monitor;
pub mod portal_id;
pub mod process;
pub mod registrator;
pub mod retry;
pub mod tls;
mod utils;

use tracing::{debug, instrument};

pub use crate::error::Error;
pub use crate::portal_id::{PortalId, PortalIdSource};
pub use crate::registrator::{RegistrationOutcome, Registrator};

/// Registers the device bridges at the VRM portal.
///
/// The portal ID is resolved once and handed as is to `registrator`, which builds the
/// [`Registrator`] scoped to the device. The registration is then run once, any error of either
/// step is returned.
#[instrument(skip_all)]
pub async fn register_at_vrm<S, R, F>(source: &S, registrator: F) -> Result<RegistrationOutcome, Error>
where
    S: PortalIdSource,
    R: Registrator,
    F: FnOnce(PortalId) -> R,
{
    let portal_id = source.portal_id().await?;

    debug!(%portal_id, "portal ID resolved");

    registrator(portal_id).register().await
}
