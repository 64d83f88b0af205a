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

//! Error types for the VRM bridge registration.

use std::error::Error as StdError;
use std::fmt::{self, Display};
use std::path::PathBuf;

use crate::api::ApiError;
use crate::credentials::CredentialsError;
use crate::monitor::MonitorError;
use crate::portal_id::PortalIdError;
use crate::process::ProcessError;
use crate::tls::TlsError;

/// VRM bridge error.
///
/// Possible errors returned by the registration and monitoring functions.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Couldn't resolve the VRM portal ID.
    #[error("couldn't resolve the VRM portal ID")]
    PortalId(#[from] PortalIdError),

    /// Couldn't read or store the bridge credentials.
    #[error("couldn't handle the bridge credentials")]
    Credentials(#[from] CredentialsError),

    /// Couldn't configure TLS for the VRM API.
    #[error("couldn't configure TLS")]
    Tls(#[from] TlsError),

    /// The VRM API rejected or failed the registration.
    #[error("couldn't register at the VRM portal")]
    Api(#[from] ApiError),

    /// Couldn't read the current bridge configuration.
    #[error("couldn't read bridge config {}", path.display())]
    ReadConfig {
        /// Path of the bridge configuration.
        path: PathBuf,
        #[source]
        backtrace: std::io::Error,
    },

    /// Couldn't write the new bridge configuration.
    #[error("couldn't write bridge config {}", path.display())]
    WriteConfig {
        /// Path of the bridge configuration.
        path: PathBuf,
        #[source]
        backtrace: std::io::Error,
    },

    /// The broker reload command failed.
    #[error("couldn't reload the broker")]
    Reload(#[source] ProcessError),

    /// Error while monitoring the bridges.
    #[error("bridge monitor failed")]
    Monitor(#[from] MonitorError),

    /// The operation was interrupted by a shutdown request.
    #[error("operation cancelled")]
    Cancelled,
}

/// Displays an error together with its chain of sources.
///
/// Used when logging an error with a structured field, since the [`Display`] of an error
/// shouldn't include the source.
///
/// ```
/// use vrm_bridge::error::Report;
///
/// let err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
///
/// assert_eq!(Report::new(&err).to_string(), "boom");
/// ```
#[derive(Debug)]
pub struct Report<E>(E);

impl<E> Report<E> {
    /// Wraps the error to display it.
    pub fn new(error: E) -> Self {
        Self(error)
    }
}

impl<E> Display for Report<E>
where
    E: StdError,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;

        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;

            source = err.source();
        }

        Ok(())
    }
}
