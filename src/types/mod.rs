// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Custom resource types watched and written by the operator.

pub mod ibpca;
pub mod route;

pub use ibpca::{CaKind, CaStatus, IbpcaSpec, StatusType, IBPCA};
pub use route::Route;
