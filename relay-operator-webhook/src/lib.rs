// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

#[allow(unused_extern_crates)]
extern crate self as relay_operator_webhook;

pub mod router;
pub mod server;
pub mod admission;
