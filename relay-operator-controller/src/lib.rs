// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

#[allow(unused_extern_crates)]
extern crate self as relay_operator_controller;

pub mod cluster;
pub mod condition;
pub mod controller;
pub mod crd;
pub mod document;
pub mod error;
pub mod gc;
pub mod labels;
pub mod ownership;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
