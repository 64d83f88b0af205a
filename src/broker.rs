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

//! Endpoints of the VRM cloud.

use crate::portal_id::PortalId;

/// Number of brokers the devices are spread over.
pub const VRM_NUMBER_OF_BROKERS: u32 = 128;
/// Broker relaying the remote procedure calls.
pub const RPC_BROKER_HOST: &str = "mqtt-rpc.victronenergy.com";
/// Base URL of the VRM API used to store the broker password.
pub const VRM_API_URL: &str = "https://ccgxlogging.victronenergy.com";
/// Port of the remote brokers.
pub const DEFAULT_BRIDGE_PORT: u16 = 8883;

/// Index of the broker assigned to the device.
///
/// It's the sum of the characters of the lowercase ID, so the same device always lands on the
/// same broker.
pub fn vrm_broker_index(id: &PortalId) -> u32 {
    let sum = id
        .as_str()
        .trim()
        .to_lowercase()
        .chars()
        .fold(0u32, |acc, c| acc.wrapping_add(u32::from(c)));

    sum % VRM_NUMBER_OF_BROKERS
}

/// Host name of the VRM broker assigned to the device.
pub fn vrm_broker_host(id: &PortalId) -> String {
    format!("mqtt{}.victronenergy.com", vrm_broker_index(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_compute_broker_index() {
        let id = PortalId::new("c0619ab1b2c3").unwrap();

        // "c0619ab1b2c3" sums to 849
        assert_eq!(vrm_broker_index(&id), 81);
        assert_eq!(vrm_broker_host(&id), "mqtt81.victronenergy.com");
    }

    #[test]
    fn should_ignore_case() {
        let lower = PortalId::new("hq2212abcde").unwrap();
        let upper = PortalId::new("HQ2212ABCDE").unwrap();

        assert_eq!(vrm_broker_host(&lower), vrm_broker_host(&upper));
    }

    #[test]
    fn should_stay_in_range() {
        for id in ["a", "zzzzzzzzzzzzzzzzzzzzzzzzzzzzzz", "001a2b3c4d5e", "ffffffffffff"] {
            let id = PortalId::new(id).unwrap();

            assert!(vrm_broker_index(&id) < VRM_NUMBER_OF_BROKERS);
        }
    }
}
