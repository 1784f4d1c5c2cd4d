//! The native-side endpoint, loaded into the DAW process. Presents a complete
//! [`AEffect`] and translates every ABI entry point into bridge traffic.
//!
//! One [`ShimEffect`] exists per plugin instance, owned through the raw
//! pointer handed to the host; there is no process-global state. The
//! `AEffect` is the first field so the ABI entry points can recover the
//! endpoint with a plain pointer cast.

mod audio_master;
mod dispatch;
mod spawn;

use std::cell::UnsafeCell;
use std::os::raw::c_void;
use std::process::Child;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::bridge::frame::SchedParam;
use crate::bridge::{BridgeResult, ChannelContext, Cmd, Endpoint, Frame, PluginData};
use crate::bridge::channel::BridgeChannel;
use crate::config::BridgeConfig;
use crate::vst2::{
    effect_opcodes, AEffect, AudioMasterCallback, ERect, GetParameterProc, ProcessDoubleProc,
    ProcessProc, SetParameterProc, EFFECT_MAGIC,
};
use crate::{logging, util};

/// The tag parity of shim-initiated requests; the host agent uses odd tags.
const SHIM_FIRST_TAG: u32 = 2;

/// The native-side endpoint for one bridged plugin instance.
#[repr(C)]
pub struct ShimEffect {
    /// The descriptor the DAW sees. Kept as the first field so the ABI
    /// function pointers can cast their `*mut AEffect` straight back to the
    /// endpoint.
    effect: UnsafeCell<AEffect>,

    /// The DAW's audio-master callback, invoked for calls arriving from the
    /// real plugin.
    host_callback: AudioMasterCallback,

    main: ChannelContext,
    rt: ChannelContext,

    /// The helper process, reaped on drop. Absent when the channels were
    /// wired up without spawning (loopback tests).
    child: Mutex<Option<Child>>,

    /// Storage returned to the host for `effGetChunk`; stays valid until the
    /// next chunk request, per the ABI contract. Guarded by the MainContext
    /// lock, but the pointer escapes to the host so borrows cannot model it.
    chunk: UnsafeCell<Vec<u8>>,
    /// Storage behind the pointer returned for `effEditGetRect`. Guarded by
    /// the MainContext lock, same escape as `chunk`.
    rect: UnsafeCell<ERect>,

    /// Set when `effClose` has been forwarded; tells the outer dispatcher to
    /// tear the endpoint down once the dispatch unwinds.
    closing: AtomicBool,
    /// Whether the realtime scheduling hint has been forwarded yet.
    sched_sent: AtomicBool,
}

// The DAW calls into the shim from its UI and audio threads concurrently; all
// shared state is behind the per-context locks or atomics, and the raw
// pointers in `AEffect` are only dereferenced by the host per the ABI's own
// threading rules.
unsafe impl Send for ShimEffect {}
unsafe impl Sync for ShimEffect {}

impl ShimEffect {
    /// Wire up a shim over an established channel pair. `VSTPluginMain` goes
    /// through [`spawn`](Self::spawn); tests connect the channels to an
    /// in-process agent instead.
    pub fn new(
        host_callback: AudioMasterCallback,
        main: BridgeChannel,
        rt: BridgeChannel,
        child: Option<Child>,
    ) -> Box<Self> {
        let mut shim = Box::new(Self {
            effect: UnsafeCell::new(AEffect {
                magic: EFFECT_MAGIC,
                dispatcher: Some(shim_dispatcher),
                process: None,
                setParameter: Some(shim_set_parameter),
                getParameter: Some(shim_get_parameter),
                numPrograms: 0,
                numParams: 0,
                numInputs: 0,
                numOutputs: 0,
                flags: 0,
                resvd1: 0,
                resvd2: 0,
                initialDelay: 0,
                realQualities: 0,
                offQualities: 0,
                ioRatio: 0.0,
                object: ptr::null_mut(),
                user: ptr::null_mut(),
                uniqueID: 0,
                version: 0,
                processReplacing: Some(shim_process_replacing),
                processDoubleReplacing: Some(shim_process_double_replacing),
                future: [0; 56],
            }),
            host_callback,
            main: ChannelContext::new("main", main, SHIM_FIRST_TAG),
            rt: ChannelContext::new("rt", rt, SHIM_FIRST_TAG),
            child: Mutex::new(child),
            chunk: UnsafeCell::new(Vec::new()),
            rect: UnsafeCell::new(ERect::default()),
            closing: AtomicBool::new(false),
            sched_sent: AtomicBool::new(false),
        });

        let this = &mut *shim as *mut Self;
        shim.effect_mut().object = this as *mut c_void;
        shim
    }

    /// Spawn the helper process per the configuration and wire a shim to it.
    pub fn spawn(host_callback: AudioMasterCallback, config: &BridgeConfig) -> anyhow::Result<Box<Self>> {
        let spawned = spawn::spawn_host(config)?;
        Ok(Self::new(
            host_callback,
            spawned.main,
            spawned.rt,
            Some(spawned.child),
        ))
    }

    /// The descriptor pointer to hand to the DAW.
    pub fn effect_ptr(&self) -> *mut AEffect {
        self.effect.get()
    }

    fn effect(&self) -> &AEffect {
        unsafe { &*self.effect.get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn effect_mut(&self) -> &mut AEffect {
        unsafe { &mut *self.effect.get() }
    }

    /// Perform the tag-0 handshake on the MainContext: request `PLUGIN_MAIN`
    /// and block for the initial descriptor snapshot, dispatching any host
    /// callbacks the plugin makes while it initialises in the helper.
    pub fn handshake(&self) -> BridgeResult<()> {
        let mut frame = Frame::request(Cmd::PluginMain);
        self.main.send(&frame)?;

        loop {
            self.main.channel().recv(&mut frame)?;
            match frame.cmd()? {
                Cmd::PluginMain => {
                    self.apply_plugin_data(&frame.plugin_data());
                    bridge_log!(
                        "handshake complete: uniqueID {:08x}, {} in / {} out",
                        self.effect().uniqueID,
                        self.effect().numInputs,
                        self.effect().numOutputs
                    );
                    return Ok(());
                }
                Cmd::AudioMasterCallback => {
                    self.handle_audio_master(&self.main, &mut frame)?;
                }
                other => {
                    bridge_error!("unexpected command {:?} during handshake", other);
                }
            }
        }
    }

    /// Mirror a descriptor snapshot into the `AEffect` the DAW sees. A false
    /// capability nulls the matching function pointer so the host never calls
    /// an unsupported entry.
    fn apply_plugin_data(&self, data: &PluginData) {
        let effect = self.effect_mut();
        effect.numPrograms = data.num_programs;
        effect.numParams = data.num_params;
        effect.numInputs = data.num_inputs;
        effect.numOutputs = data.num_outputs;
        effect.flags = data.flags;
        effect.initialDelay = data.initial_delay;
        effect.uniqueID = data.unique_id;
        effect.version = data.version;

        effect.setParameter = data
            .has_set_parameter
            .then_some(shim_set_parameter as SetParameterProc);
        effect.getParameter = data
            .has_get_parameter
            .then_some(shim_get_parameter as GetParameterProc);
        effect.processReplacing = data
            .has_process_replacing
            .then_some(shim_process_replacing as ProcessProc);
        effect.processDoubleReplacing = data
            .has_process_double_replacing
            .then_some(shim_process_double_replacing as ProcessDoubleProc);
    }

    // Realtime entry points. These use the RealtimeContext exclusively so
    // audio traffic is never interleaved with UI traffic.

    fn get_parameter(&self, index: i32) -> f32 {
        let _guard = self.rt.lock();
        let mut frame = Frame::request(Cmd::GetParameter);
        frame.param_mut().index = index;

        match self.roundtrip(&self.rt, &mut frame) {
            Ok(()) => frame.param().value,
            Err(err) => {
                bridge_error!("getParameter({index}) failed: {err}");
                0.0
            }
        }
    }

    fn set_parameter(&self, index: i32, value: f32) {
        let _guard = self.rt.lock();
        let mut frame = Frame::request(Cmd::SetParameter);
        {
            let param = frame.param_mut();
            param.index = index;
            param.value = value;
        }

        // Fire-and-forget: a tag is allocated but nobody waits on it
        if let Err(err) = self.rt.send_request(&mut frame) {
            bridge_error!("setParameter({index}) failed: {err}");
        }
    }

    unsafe fn process_f32(&self, inputs: *const *const f32, outputs: *mut *mut f32, nframes: i32) {
        let _guard = self.rt.lock();
        self.forward_sched_param();

        let nframes = nframes.max(0) as usize;
        let num_inputs = self.effect().numInputs.max(0) as usize;
        let num_outputs = self.effect().numOutputs.max(0) as usize;

        let mut frame = Frame::request(Cmd::Process);
        frame.set_nframes(nframes as u32);
        let samples = frame.samples_f32_mut(num_inputs * nframes);
        for channel in 0..num_inputs {
            let input = std::slice::from_raw_parts(*inputs.add(channel), nframes);
            samples[channel * nframes..(channel + 1) * nframes].copy_from_slice(input);
        }

        if let Err(err) = self.roundtrip(&self.rt, &mut frame) {
            bridge_error!("process round trip failed: {err}");
            return;
        }

        let samples = frame.samples_f32(num_outputs * nframes);
        for channel in 0..num_outputs {
            let output = std::slice::from_raw_parts_mut(*outputs.add(channel), nframes);
            output.copy_from_slice(&samples[channel * nframes..(channel + 1) * nframes]);
        }
    }

    unsafe fn process_f64(&self, inputs: *const *const f64, outputs: *mut *mut f64, nframes: i32) {
        let _guard = self.rt.lock();
        self.forward_sched_param();

        let nframes = nframes.max(0) as usize;
        let num_inputs = self.effect().numInputs.max(0) as usize;
        let num_outputs = self.effect().numOutputs.max(0) as usize;

        let mut frame = Frame::request(Cmd::ProcessDouble);
        frame.set_nframes(nframes as u32);
        let samples = frame.samples_f64_mut(num_inputs * nframes);
        for channel in 0..num_inputs {
            let input = std::slice::from_raw_parts(*inputs.add(channel), nframes);
            samples[channel * nframes..(channel + 1) * nframes].copy_from_slice(input);
        }

        if let Err(err) = self.roundtrip(&self.rt, &mut frame) {
            bridge_error!("processDouble round trip failed: {err}");
            return;
        }

        let samples = frame.samples_f64(num_outputs * nframes);
        for channel in 0..num_outputs {
            let output = std::slice::from_raw_parts_mut(*outputs.add(channel), nframes);
            output.copy_from_slice(&samples[channel * nframes..(channel + 1) * nframes]);
        }
    }

    /// On the first realtime entry, forward our thread's scheduling setup so
    /// the helper's audio thread can match it. Fire-and-forget, like
    /// `SET_PARAMETER`.
    fn forward_sched_param(&self) {
        if self.sched_sent.swap(true, Ordering::Relaxed) {
            return;
        }

        #[cfg(unix)]
        {
            let mut policy = 0;
            let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
            if unsafe { libc::pthread_getschedparam(libc::pthread_self(), &mut policy, &mut param) }
                != 0
            {
                return;
            }
            if policy != libc::SCHED_FIFO && policy != libc::SCHED_RR {
                return;
            }

            let mut frame = Frame::request(Cmd::SetSchedParam);
            frame.set_sched(SchedParam {
                policy,
                priority: param.sched_priority,
            });
            if let Err(err) = self.rt.send_request(&mut frame) {
                bridge_error!("failed to forward scheduling parameters: {err}");
            } else {
                bridge_log!(
                    "forwarded realtime scheduling: policy {policy}, priority {}",
                    param.sched_priority
                );
            }
        }
    }

    /// One request/response round trip, holding the context across both
    /// halves so concurrent host threads never interleave on it.
    fn roundtrip(&self, ctx: &ChannelContext, frame: &mut Frame) -> BridgeResult<()> {
        let _guard = ctx.lock();
        let tag = ctx.send_request(frame)?;
        ctx.wait(tag, frame, self)
    }
}

impl Endpoint for ShimEffect {
    fn is_peer_call(&self, cmd: Cmd) -> bool {
        // The only calls the helper initiates towards us are host callbacks
        cmd == Cmd::AudioMasterCallback
    }

    fn dispatch_call(&self, ctx: &ChannelContext, frame: &mut Frame) -> BridgeResult<()> {
        self.handle_audio_master(ctx, frame)
    }

    fn handle_oneway(&self, _ctx: &ChannelContext, frame: &Frame) -> BridgeResult<()> {
        match frame.cmd()? {
            Cmd::PluginData => {
                bridge_log!("descriptor update from helper");
                self.apply_plugin_data(&frame.plugin_data());
            }
            other => {
                bridge_debug_assert_failure!("unexpected one-way command {:?}", other);
            }
        }
        Ok(())
    }
}

impl Drop for ShimEffect {
    fn drop(&mut self) {
        // The helper exits on effClose (or on seeing the channels close);
        // reap it so no zombie outlives the shim
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.wait();
        }
    }
}

/// The plugin library entry point the DAW resolves. Spawns the helper,
/// performs the handshake, and hands back the bridged descriptor. Returns
/// null when the helper cannot be started or the handshake fails, which the
/// ABI defines as "plugin failed to load".
#[no_mangle]
pub unsafe extern "C" fn VSTPluginMain(audio_master: Option<AudioMasterCallback>) -> *mut AEffect {
    logging::init("vst2-bridge-shim");

    let Some(host_callback) = audio_master else {
        return ptr::null_mut();
    };
    let Some(config) = BridgeConfig::from_environment() else {
        bridge_error!("no plugin path configured; set VST2_BRIDGE_PLUGIN or rebuild the shim");
        return ptr::null_mut();
    };

    let shim = match ShimEffect::spawn(host_callback, &config) {
        Ok(shim) => Box::into_raw(shim),
        Err(err) => {
            bridge_error!("failed to start the bridge helper: {err:#}");
            return ptr::null_mut();
        }
    };

    if let Err(err) = (*shim).handshake() {
        bridge_error!("bridge handshake failed: {err}");
        drop(Box::from_raw(shim));
        return ptr::null_mut();
    }

    (*shim).effect_ptr()
}

// ABI trampolines. The DAW hands back the `AEffect` pointer it got from
// `VSTPluginMain`; since that is the first field of `ShimEffect`, a cast
// recovers the endpoint.

unsafe extern "C" fn shim_dispatcher(
    effect: *mut AEffect,
    opcode: i32,
    index: i32,
    value: isize,
    ptr: *mut c_void,
    opt: f32,
) -> isize {
    if effect.is_null() {
        bridge_debug_assert_failure!("null effect passed to the dispatcher");
        return 0;
    }

    let shim = &*(effect as *const ShimEffect);
    let result = shim.dispatch(opcode, index, value, ptr, opt);

    // effClose forwards without waiting; the endpoint is destroyed only after
    // the dispatch that delivered it has fully unwound
    if opcode == effect_opcodes::CLOSE && shim.closing.load(Ordering::Acquire) {
        drop(Box::from_raw(effect as *mut ShimEffect));
    }

    result
}

unsafe extern "C" fn shim_get_parameter(effect: *mut AEffect, index: i32) -> f32 {
    if effect.is_null() {
        return 0.0;
    }
    util::permit_alloc(|| (*(effect as *const ShimEffect)).get_parameter(index))
}

unsafe extern "C" fn shim_set_parameter(effect: *mut AEffect, index: i32, value: f32) {
    if effect.is_null() {
        return;
    }
    util::permit_alloc(|| (*(effect as *const ShimEffect)).set_parameter(index, value));
}

unsafe extern "C" fn shim_process_replacing(
    effect: *mut AEffect,
    inputs: *const *const f32,
    outputs: *mut *mut f32,
    sample_frames: i32,
) {
    if effect.is_null() || inputs.is_null() || outputs.is_null() {
        return;
    }
    util::permit_alloc(|| (*(effect as *const ShimEffect)).process_f32(inputs, outputs, sample_frames));
}

unsafe extern "C" fn shim_process_double_replacing(
    effect: *mut AEffect,
    inputs: *const *const f64,
    outputs: *mut *mut f64,
    sample_frames: i32,
) {
    if effect.is_null() || inputs.is_null() || outputs.is_null() {
        return;
    }
    util::permit_alloc(|| (*(effect as *const ShimEffect)).process_f64(inputs, outputs, sample_frames));
}
