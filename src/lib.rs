#![forbid(unsafe_code)]

//! USB Gatekeeper (ugk): hotplug admission controller for USB storage.
//!
//! Every newly attached USB device is identified, decided on, recorded and
//! enforced:
//! 1. **History**: vendors a human allowed often enough are auto-allowed
//! 2. **Classifier**: an offline decision tree may predict "allow"
//! 3. **Prompt**: otherwise a human decides; failures block
//!
//! Allowed devices are mounted under `<media-root>/<user>/<serial>`; blocked
//! ones get a udev deauthorization rule.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use usb_gatekeeper::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use usb_gatekeeper::core::config::Config;
//! use usb_gatekeeper::history::store::{FileHistoryStore, HistoryStore};
//! ```

pub mod prelude;

pub mod classifier;
pub mod core;
pub mod daemon;
pub mod device;
pub mod enforce;
pub mod engine;
pub mod history;
pub mod logger;
