//! The foreign-side endpoint, running in the helper process. Loads the real
//! plugin library, hands it a bridge-backed host callback, and serves bridge
//! requests on the main thread plus a dedicated audio thread.

mod dispatch;
mod editor;
mod host_callback;

use std::cell::UnsafeCell;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::OnceLock;
use std::thread::{self, ThreadId};
use std::time::Duration;

use anyhow::{bail, Context};
use parking_lot::Mutex;

use crate::bridge::channel::BridgeChannel;
use crate::bridge::{BridgeError, BridgeResult, ChannelContext, Cmd, Endpoint, Frame, PluginData};
use crate::vst2::{AEffect, PluginMainProc, VstTimeInfo};

use self::editor::EditorWindow;

/// The tag parity of agent-initiated requests; the shim uses even tags.
const AGENT_FIRST_TAG: u32 = 1;

/// Poll tick of the main serve loop; short so the editor's event queue stays
/// responsive between frames.
const MAIN_POLL: Duration = Duration::from_millis(50);
/// Poll tick of the realtime serve loop; only gates the stop check.
const RT_POLL: Duration = Duration::from_secs(1);

/// Stack size of the audio thread. Some plugins put large working sets on
/// the processing stack.
const AUDIO_STACK_SIZE: usize = 8 * 1024 * 1024;

/// The process-wide agent. The plugin's host callback is a plain C function
/// pointer with no closure context, so it recovers its endpoint through this.
static AGENT: OnceLock<HostAgent> = OnceLock::new();

/// The foreign-side endpoint state.
pub struct HostAgent {
    main: ChannelContext,
    rt: ChannelContext,

    /// The real plugin's descriptor, set once `VSTPluginMain` has returned.
    /// Callbacks can legally arrive before that, while the plugin is still
    /// constructing itself.
    effect: AtomicPtr<AEffect>,

    /// Cached descriptor snapshot for mutation detection; see
    /// [`check_plugin_data`](Self::check_plugin_data).
    plugin_data: Mutex<PluginData>,

    /// Storage behind the pointer returned to the plugin for
    /// `audioMasterGetTime`; valid until the next query, per the ABI.
    time_info: UnsafeCell<VstTimeInfo>,

    /// The native editor window, owned and pumped by the main thread.
    editor: Mutex<EditorWindow>,

    /// Identity of the audio thread, for routing callbacks to the right
    /// context.
    audio_thread: Mutex<Option<ThreadId>>,

    stop: AtomicBool,
}

// The raw descriptor pointer is only used per the ABI's threading rules; all
// other shared state is behind locks or atomics.
unsafe impl Send for HostAgent {}
unsafe impl Sync for HostAgent {}

impl HostAgent {
    pub fn new(main: BridgeChannel, rt: BridgeChannel) -> Self {
        Self {
            main: ChannelContext::new("main", main, AGENT_FIRST_TAG),
            rt: ChannelContext::new("rt", rt, AGENT_FIRST_TAG),
            effect: AtomicPtr::new(std::ptr::null_mut()),
            plugin_data: Mutex::new(PluginData::default()),
            time_info: UnsafeCell::new(VstTimeInfo::default()),
            editor: Mutex::new(EditorWindow::new()),
            audio_thread: Mutex::new(None),
            stop: AtomicBool::new(false),
        }
    }

    /// Install the real plugin's descriptor once its entry point returned.
    pub fn set_effect(&self, effect: *mut AEffect) {
        self.effect.store(effect, Ordering::Release);
    }

    fn effect(&self) -> Option<&AEffect> {
        let effect = self.effect.load(Ordering::Acquire);
        if effect.is_null() {
            None
        } else {
            Some(unsafe { &*effect })
        }
    }

    fn effect_ptr(&self) -> *mut AEffect {
        self.effect.load(Ordering::Acquire)
    }

    /// Read the handshake request the shim sends right after spawning us.
    /// Arrives before the plugin is even loaded, so a malformed frame here
    /// means we were started by something that does not speak the protocol.
    pub fn expect_handshake(&self) -> BridgeResult<()> {
        let mut frame = Frame::new();
        self.main.channel().recv(&mut frame)?;
        match frame.cmd()? {
            Cmd::PluginMain => Ok(()),
            _ => Err(BridgeError::BadFrame("expected a PLUGIN_MAIN handshake")),
        }
    }

    /// Send the handshake response: the initial descriptor snapshot.
    pub fn send_initial_plugin_data(&self) -> BridgeResult<()> {
        let snapshot = match self.effect() {
            Some(effect) => snapshot_plugin_data(effect),
            None => return Err(BridgeError::BadFrame("no plugin loaded")),
        };
        *self.plugin_data.lock() = snapshot;

        let mut frame = Frame::request(Cmd::PluginMain);
        frame.set_plugin_data(&snapshot);
        self.main.send(&frame)
    }

    /// Request the loops to wind down.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Serve the MainContext and pump the editor's native event queue until
    /// stop or peer closure.
    pub fn main_loop(&self) {
        let mut frame = Frame::new();
        while !self.stopping() {
            match self.main.serve_one(self, &mut frame, MAIN_POLL) {
                Ok(served) => {
                    if served {
                        self.check_plugin_data(&self.main);
                    }
                }
                Err(BridgeError::Closed) => {
                    bridge_log!("main channel closed, shutting down");
                    break;
                }
                Err(err) => {
                    bridge_error!("main loop failed: {err}");
                    break;
                }
            }

            self.editor.lock().pump();
        }
        self.request_stop();
    }

    /// Serve the RealtimeContext until stop or peer closure. Runs on the
    /// dedicated audio thread.
    pub fn audio_loop(&self) {
        *self.audio_thread.lock() = Some(thread::current().id());

        let mut frame = Frame::new();
        while !self.stopping() {
            match self.rt.serve_one(self, &mut frame, RT_POLL) {
                Ok(served) => {
                    if served {
                        self.check_plugin_data(&self.rt);
                    }
                }
                Err(BridgeError::Closed) => {
                    bridge_log!("realtime channel closed, shutting down");
                    break;
                }
                Err(err) => {
                    bridge_error!("audio loop failed: {err}");
                    break;
                }
            }
        }
        self.request_stop();
    }

    /// The context for traffic originating on the current thread.
    fn current_context(&self) -> &ChannelContext {
        if *self.audio_thread.lock() == Some(thread::current().id()) {
            &self.rt
        } else {
            &self.main
        }
    }

    /// Compare the plugin's live descriptor against the cached snapshot; on
    /// divergence, refresh the cache under every context's lock and push the
    /// update to the shim on `ctx`. Called after every serve and around every
    /// callback, so the shim's mirror is eventually consistent with whatever
    /// the plugin mutated.
    fn check_plugin_data(&self, ctx: &ChannelContext) {
        let Some(effect) = self.effect() else { return };
        let current = snapshot_plugin_data(effect);

        let mut cached = self.plugin_data.lock();
        if *cached == current {
            return;
        }

        // Mirroring touches state both thread classes read, so it happens
        // under every context's mutex. The other thread class may be mid
        // serve and holding its context; backing off keeps the two loops
        // from deadlocking, and the divergence is caught again on the next
        // serve or callback.
        let Some(_main) = self.main.try_lock() else { return };
        let Some(_rt) = self.rt.try_lock() else { return };
        *cached = current;

        let mut frame = Frame::request(Cmd::PluginData);
        frame.set_plugin_data(&current);
        if let Err(err) = ctx.send(&frame) {
            bridge_error!("failed to push a descriptor update: {err}");
        }
    }

    /// One request/response round trip on `ctx`, holding it across both
    /// halves.
    fn roundtrip(&self, ctx: &ChannelContext, frame: &mut Frame) -> BridgeResult<()> {
        let _guard = ctx.lock();
        let tag = ctx.send_request(frame)?;
        ctx.wait(tag, frame, self)
    }
}

impl Endpoint for HostAgent {
    fn is_peer_call(&self, cmd: Cmd) -> bool {
        // Everything the shim initiates is a call to serve; the only frames
        // that are responses to us are our own host callbacks coming back
        cmd != Cmd::AudioMasterCallback
    }

    fn dispatch_call(&self, ctx: &ChannelContext, frame: &mut Frame) -> BridgeResult<()> {
        self.serve(ctx, frame)
    }

    fn handle_oneway(&self, _ctx: &ChannelContext, frame: &Frame) -> BridgeResult<()> {
        bridge_debug_assert_failure!(
            "unexpected one-way frame with command {} on the agent",
            frame.raw_cmd()
        );
        Ok(())
    }
}

fn snapshot_plugin_data(effect: &AEffect) -> PluginData {
    PluginData {
        has_set_parameter: effect.setParameter.is_some(),
        has_get_parameter: effect.getParameter.is_some(),
        has_process_replacing: effect.processReplacing.is_some(),
        has_process_double_replacing: effect.processDoubleReplacing.is_some(),
        num_programs: effect.numPrograms,
        num_params: effect.numParams,
        num_inputs: effect.numInputs,
        num_outputs: effect.numOutputs,
        flags: effect.flags,
        initial_delay: effect.initialDelay,
        unique_id: effect.uniqueID,
        version: effect.version,
    }
}

/// Run the host agent over the inherited channel fds: validate the
/// handshake, load the plugin, answer with its descriptor, and serve until
/// close. Returns an error (and thus a nonzero exit) when the plugin cannot
/// be loaded or the channel cannot be established.
pub fn run(plugin_path: &Path, main_fd: i32, rt_fd: i32) -> anyhow::Result<()> {
    let main = unsafe { BridgeChannel::from_raw_fd(main_fd) }
        .with_context(|| format!("adopting main channel fd {main_fd}"))?;
    let rt = unsafe { BridgeChannel::from_raw_fd(rt_fd) }
        .with_context(|| format!("adopting realtime channel fd {rt_fd}"))?;

    // The callback the plugin gets has no closure context, so the agent must
    // be reachable through the process-wide slot before the plugin runs
    let agent = AGENT.get_or_init(|| HostAgent::new(main, rt));

    agent
        .expect_handshake()
        .context("waiting for the shim's handshake")?;

    // Load the real plugin and resolve its entry point, preferring the
    // modern name over the legacy `main`
    let library = unsafe { libloading::Library::new(plugin_path) }
        .with_context(|| format!("loading plugin library {}", plugin_path.display()))?;
    let plugin_main: PluginMainProc = unsafe {
        let symbol = library
            .get::<PluginMainProc>(b"VSTPluginMain\0")
            .or_else(|_| library.get::<PluginMainProc>(b"main\0"))
            .context("plugin library exports neither VSTPluginMain nor main")?;
        *symbol
    };
    // The plugin stays loaded for the life of the process
    std::mem::forget(library);

    let effect = unsafe { plugin_main(Some(host_callback::agent_audio_master)) };
    if effect.is_null() {
        bail!("the plugin's entry point returned null");
    }
    agent.set_effect(effect);

    agent
        .send_initial_plugin_data()
        .context("sending the initial descriptor")?;
    bridge_log!("plugin {} is up, serving", plugin_path.display());

    let audio_thread = thread::Builder::new()
        .name(String::from("audio"))
        .stack_size(AUDIO_STACK_SIZE)
        .spawn(|| {
            AGENT
                .get()
                .expect("the agent is installed before the audio thread starts")
                .audio_loop()
        })
        .context("spawning the audio thread")?;

    agent.main_loop();

    agent.request_stop();
    let _ = audio_thread.join();
    Ok(())
}
