// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! drover-adapters: pluggable discovery sources and notification sinks

pub mod discover;
pub mod notify;
mod static_inventory;

pub use discover::{build_detectors, DetectError, DetectorSet, Discover};
#[cfg(any(test, feature = "test-support"))]
pub use discover::FakeDetector;
pub use notify::{build_notifiers, DesktopNotifier, Notify, NotifierSet, NotifyError};
#[cfg(any(test, feature = "test-support"))]
pub use notify::{FakeNotifier, NotifyCall};
pub use static_inventory::StaticInventoryDetector;
