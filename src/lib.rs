//! A cross-ABI bridge for VST 2.4 plugins. The DAW loads the [`shim`], which
//! presents a complete `AEffect` and forwards every ABI call over a pair of
//! datagram channels to a helper process running the [`agent`], which hosts
//! the real plugin binary. The wire protocol and its two endpoints live in
//! [`bridge`].

#[macro_use]
pub mod debug;

pub mod agent;
pub mod bridge;
pub mod config;
pub mod logging;
pub mod shim;
pub mod util;
pub mod vst2;

// Re-exported for use in the `bridge_*!()` macros
pub use log;
