//! Spawning the helper process. The shim creates both channel pairs first so
//! the helper can inherit its ends as plain fd numbers on the command line:
//! `<launcher> <host-agent-path> <plugin-path> <main-fd> <rt-fd>`.

use std::process::{Child, Command};

use anyhow::Context;

use crate::bridge::channel::BridgeChannel;
use crate::config::BridgeConfig;

pub(super) struct SpawnedHost {
    pub child: Child,
    pub main: BridgeChannel,
    pub rt: BridgeChannel,
}

pub(super) fn spawn_host(config: &BridgeConfig) -> anyhow::Result<SpawnedHost> {
    let (main, main_helper) = BridgeChannel::pair().context("creating the main channel pair")?;
    let (rt, rt_helper) = BridgeChannel::pair().context("creating the realtime channel pair")?;

    // The helper's ends must survive the exec; ours stay close-on-exec so a
    // second instance's helper does not inherit them by accident
    main_helper
        .clear_cloexec()
        .and_then(|_| rt_helper.clear_cloexec())
        .context("marking the helper channel ends inheritable")?;

    let child = Command::new(&config.launcher)
        .arg(&config.host_agent)
        .arg(&config.plugin)
        .arg(main_helper.raw_fd().to_string())
        .arg(rt_helper.raw_fd().to_string())
        .spawn()
        .with_context(|| {
            format!(
                "spawning '{} {} {}'",
                config.launcher.display(),
                config.host_agent.display(),
                config.plugin.display()
            )
        })?;

    bridge_log!(
        "spawned helper pid {} for {}",
        child.id(),
        config.plugin.display()
    );

    // Dropping the helper-side ends here closes our copies; from now on a
    // zero-byte read means the helper itself went away
    Ok(SpawnedHost { child, main, rt })
}
