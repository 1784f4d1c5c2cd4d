//! The helper process entry point. Started by the shim (through the
//! configured launcher) as:
//!
//! ```text
//! vst2-bridge-host <plugin-path> <main-fd> <rt-fd>
//! ```
//!
//! Exits 0 on a clean close, nonzero when the plugin cannot be loaded or the
//! channels cannot be established.

use std::path::PathBuf;

use clap::Parser;

use vst2_bridge::{agent, logging};

/// Host agent for bridged VST 2.4 plugins. Loads the real plugin library and
/// serves the bridge channels inherited from the shim.
#[derive(Debug, Parser)]
#[clap(about = None, long_about = None)]
struct HostArgs {
    /// The plugin library to load.
    #[clap(value_parser)]
    plugin: PathBuf,

    /// Inherited fd of the main thread class channel.
    #[clap(value_parser)]
    main_fd: i32,

    /// Inherited fd of the realtime thread class channel.
    #[clap(value_parser)]
    rt_fd: i32,
}

fn main() -> anyhow::Result<()> {
    logging::init("vst2-bridge-host");

    let args = HostArgs::parse();
    agent::run(&args.plugin, args.main_fd, args.rt_fd)
}
