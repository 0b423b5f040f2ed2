// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

pub const APP_NAME: &str = "relay-operator";
pub const ENV_PREFIX: &str = "RELAY";
