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

//! Client of the VRM API storing the broker password of the device.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, instrument};
use url::{ParseError, Url};

use crate::credentials::Secret;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Error returned by the VRM API.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    /// The API URL can't be used as a base.
    #[error("invalid API URL")]
    InvalidUrl(#[from] ParseError),
    /// Couldn't build the HTTP client.
    #[error("couldn't build the HTTP client")]
    Client(#[source] reqwest::Error),
    /// Error while sending or receiving the request.
    #[error("error while sending or receiving request")]
    Request(#[from] reqwest::Error),
    /// The API returned an error.
    #[error("API returned an error code {status}")]
    Status {
        /// HTTP status of the response.
        status: StatusCode,
        /// Body of the response.
        body: String,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StorePassword<'a> {
    identifier: &'a str,
    mqtt_password: &'a str,
}

/// Client of the VRM API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: Url,
    client: reqwest::Client,
}

impl ApiClient {
    /// Creates the client, the timeout is used both to connect and for the whole request.
    pub fn new(
        base_url: Url,
        tls: rustls::ClientConfig,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .user_agent(USER_AGENT)
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(ApiError::Client)?;

        Ok(Self { base_url, client })
    }

    fn store_password_url(&self) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();

        // Push the segments to not depend on the trailing slash of the base URL
        url.path_segments_mut()
            .map_err(|()| ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .push("log")
            .push("storemqttpassword.php");

        Ok(url)
    }

    /// Stores the password the bridges will use to authenticate as `identifier`.
    #[instrument(skip(self, password))]
    pub async fn store_mqtt_password(
        &self,
        identifier: &str,
        password: &Secret,
    ) -> Result<(), ApiError> {
        let url = self.store_password_url()?;

        debug!(%url, "storing MQTT password");

        let response = self
            .client
            .post(url)
            .form(&StorePassword {
                identifier,
                mqtt_password: password.expose(),
            })
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(()),
            status => {
                let body = response.text().await?;

                Err(ApiError::Status { status, body })
            }
        }
    }
}
