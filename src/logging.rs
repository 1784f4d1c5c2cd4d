//! One diagnostic text stream per endpoint process.
//!
//! By default each endpoint appends to `/tmp/<endpoint>.<pid>.log`; the
//! `VST2_BRIDGE_LOG` environment variable overrides this with either
//! `stderr` or a file path shared by every instance. The shim initialises
//! this on `VSTPluginMain`, the host agent at the top of `main`.

use std::env;
use std::fs::OpenOptions;
use std::process;

use parking_lot::Once;
use simplelog::{Config, LevelFilter, SimpleLogger, WriteLogger};

static INIT: Once = Once::new();

fn level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Set up the process-wide logger for `endpoint` (`"shim"` or `"host"`).
/// Idempotent; a DAW loading several bridged plugins only gets one logger,
/// owned by whichever instance came first.
pub fn init(endpoint: &str) {
    INIT.call_once(|| {
        let target = match env::var("VST2_BRIDGE_LOG") {
            Ok(target) => target,
            Err(_) => format!("/tmp/{}.{}.log", endpoint, process::id()),
        };

        if target != "stderr" {
            if let Ok(file) = OpenOptions::new().create(true).append(true).open(&target) {
                if WriteLogger::init(level(), Config::default(), file).is_ok() {
                    return;
                }
            }
        }

        // Either stderr was asked for or the file could not be opened
        let _ = SimpleLogger::init(level(), Config::default());
    });
}
