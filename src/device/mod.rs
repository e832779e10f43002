//! Device identity, hotplug events, event sources, and block-device resolution.

pub mod identity;
pub mod resolver;
pub mod source;
