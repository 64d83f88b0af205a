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

//! Credentials used by the bridges to authenticate to the VRM brokers.

use std::fmt::{self, Debug};
use std::io;
use std::path::{Path, PathBuf};

use base64::Engine;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::portal_id::PortalId;
use crate::utils::write_atomic;

/// File keeping the password posted to the VRM API.
pub const DEFAULT_PASSWORD_FILE: &str = "/data/conf/mqtt_password.txt";

const IDENTIFIER_PREFIX: &str = "ccgxapikey_";
const CLIENT_ID_PREFIX: &str = "ccgx_";
const CLIENT_ID_RANDOM_LEN: usize = 12;

/// Error returned while handling the credentials.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum CredentialsError {
    /// Couldn't read the password file.
    #[error("couldn't read password file {}", path.display())]
    Read {
        /// Path of the file.
        path: PathBuf,
        #[source]
        backtrace: io::Error,
    },
    /// Couldn't write the password file.
    #[error("couldn't write password file {}", path.display())]
    Write {
        /// Path of the file.
        path: PathBuf,
        #[source]
        backtrace: io::Error,
    },
}

/// Password of the remote broker.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wraps the password.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Returns the password in clear.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("REDACTED")
    }
}

/// Username on the remote broker, also used as identifier for the VRM API.
pub fn broker_identifier(id: &PortalId) -> String {
    format!("{IDENTIFIER_PREFIX}{id}")
}

/// Random URL safe token of 22 characters.
pub fn random_token() -> String {
    let uuid = Uuid::new_v4();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(uuid.as_bytes())
}

/// Random password for the remote broker.
pub fn generate_password() -> Secret {
    Secret(random_token() + &random_token())
}

/// Random client ID of the bridge connection.
pub fn generate_client_id() -> String {
    let token = random_token();

    format!("{CLIENT_ID_PREFIX}{}", &token[..CLIENT_ID_RANDOM_LEN])
}

/// Reads the stored password or generates and stores a new one.
///
/// If the password was posted but the response never arrived, the server may already know it,
/// so the same password is used for the next registration.
pub async fn load_or_generate_password(path: &Path) -> Result<Secret, CredentialsError> {
    match fs::read_to_string(path).await {
        Ok(password) if !password.trim().is_empty() => {
            info!(path = %path.display(), "using stored password");

            return Ok(Secret::new(password.trim()));
        }
        Ok(_) => {
            warn!(path = %path.display(), "password file is empty, generating a new one");
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no password file");
        }
        Err(err) => {
            return Err(CredentialsError::Read {
                path: path.to_path_buf(),
                backtrace: err,
            })
        }
    }

    let password = generate_password();

    info!(path = %path.display(), "writing new password file");

    write_atomic(path, password.expose().as_bytes())
        .await
        .map_err(|err| CredentialsError::Write {
            path: path.to_path_buf(),
            backtrace: err,
        })?;

    Ok(password)
}
