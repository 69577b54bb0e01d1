// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Update tracking: change flags, the per-instance queue and the watch
//! event classification that fills it.

pub mod classifier;
pub mod flags;
pub mod queue;
pub mod spec_state;

pub use classifier::EventClassifier;
pub use flags::Update;
pub use queue::UpdateQueue;
