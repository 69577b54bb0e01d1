// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
pub mod certificate;
pub mod config;
pub mod constants;
pub mod error;
pub mod initializer;
pub mod kubernetes;
pub mod migration;
pub mod offering;
pub mod reconcilers;
pub mod resources;
pub mod restart;
pub mod types;
pub mod update;
pub mod upload;

#[cfg(test)]
pub mod test_utils;
