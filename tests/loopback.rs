//! End-to-end bridge scenarios over in-process socketpairs: a real
//! [`ShimEffect`] driven the way a DAW would drive it, talking to a real
//! [`HostAgent`] whose "plugin" is a stub `AEffect` built by hand, the same
//! way a loaded binary would present one.

use std::os::raw::c_void;
use std::ptr;
use std::slice;
use std::sync::Mutex;
use std::thread::JoinHandle;

use approx::assert_relative_eq;

use vst2_bridge::agent::HostAgent;
use vst2_bridge::bridge::channel::BridgeChannel;
use vst2_bridge::bridge::{Cmd, Frame};
use vst2_bridge::shim::ShimEffect;
use vst2_bridge::vst2::{
    effect_opcodes as op, host_opcodes as am, AEffect, EFFECT_MAGIC, MAX_PROG_NAME_LEN,
};

// ---------------------------------------------------------------------------
// Stub plugin

struct StubState {
    agent: *const HostAgent,
    params: Mutex<[f32; 4]>,
    chunk_out: Vec<u8>,
    chunk_in: Mutex<Vec<u8>>,
}

unsafe impl Send for StubState {}
unsafe impl Sync for StubState {}

unsafe fn stub_state<'a>(effect: *mut AEffect) -> &'a StubState {
    &*((*effect).object as *const StubState)
}

unsafe extern "C" fn stub_dispatcher(
    effect: *mut AEffect,
    opcode: i32,
    _index: i32,
    value: isize,
    ptr: *mut c_void,
    _opt: f32,
) -> isize {
    let state = stub_state(effect);
    match opcode {
        // Mutates the descriptor, then re-enters its host mid-dispatch; the
        // shim must answer the callback inline before this dispatch returns
        op::MAINS_CHANGED => {
            (*effect).initialDelay = 64;
            let agent = &*state.agent;
            agent.audio_master(am::GET_SAMPLE_RATE, 0, 0, ptr::null_mut(), 0.0)
        }

        op::GET_PROGRAM_NAME => {
            let name = b"Init\0";
            ptr::copy_nonoverlapping(name.as_ptr(), ptr as *mut u8, name.len());
            0
        }

        op::GET_CHUNK => {
            *(ptr as *mut *mut c_void) = state.chunk_out.as_ptr() as *mut c_void;
            state.chunk_out.len() as isize
        }

        op::SET_CHUNK => {
            let bytes = slice::from_raw_parts(ptr as *const u8, value as usize);
            *state.chunk_in.lock().unwrap() = bytes.to_vec();
            1
        }

        _ => 0,
    }
}

unsafe extern "C" fn stub_get_parameter(effect: *mut AEffect, index: i32) -> f32 {
    stub_state(effect).params.lock().unwrap()[index as usize]
}

unsafe extern "C" fn stub_set_parameter(effect: *mut AEffect, index: i32, value: f32) {
    stub_state(effect).params.lock().unwrap()[index as usize] = value;
}

// A gain of 0.5 on every channel
unsafe extern "C" fn stub_process(
    effect: *mut AEffect,
    inputs: *const *const f32,
    outputs: *mut *mut f32,
    sample_frames: i32,
) {
    let channels = (*effect).numOutputs as usize;
    let frames = sample_frames as usize;
    for channel in 0..channels {
        let input = slice::from_raw_parts(*inputs.add(channel), frames);
        let output = slice::from_raw_parts_mut(*outputs.add(channel), frames);
        for (out, sample) in output.iter_mut().zip(input) {
            *out = sample * 0.5;
        }
    }
}

unsafe extern "C" fn stub_process_double(
    effect: *mut AEffect,
    inputs: *const *const f64,
    outputs: *mut *mut f64,
    sample_frames: i32,
) {
    let channels = (*effect).numOutputs as usize;
    let frames = sample_frames as usize;
    for channel in 0..channels {
        let input = slice::from_raw_parts(*inputs.add(channel), frames);
        let output = slice::from_raw_parts_mut(*outputs.add(channel), frames);
        for (out, sample) in output.iter_mut().zip(input) {
            *out = sample * 0.5;
        }
    }
}

fn build_stub(
    agent: &'static HostAgent,
    num_inputs: i32,
    num_outputs: i32,
) -> (*mut AEffect, &'static StubState) {
    let state = Box::leak(Box::new(StubState {
        agent,
        params: Mutex::new([0.0, 0.0, 0.375, 0.0]),
        chunk_out: (0..131072).map(|i| (i % 251) as u8).collect(),
        chunk_in: Mutex::new(Vec::new()),
    }));
    let state: &'static StubState = state;

    let effect = Box::leak(Box::new(AEffect {
        magic: EFFECT_MAGIC,
        dispatcher: Some(stub_dispatcher),
        process: None,
        setParameter: Some(stub_set_parameter),
        getParameter: Some(stub_get_parameter),
        numPrograms: 1,
        numParams: 4,
        numInputs: num_inputs,
        numOutputs: num_outputs,
        flags: 0x10,
        resvd1: 0,
        resvd2: 0,
        initialDelay: 0,
        realQualities: 0,
        offQualities: 0,
        ioRatio: 0.0,
        object: state as *const StubState as *mut c_void,
        user: ptr::null_mut(),
        uniqueID: 0x4142_4344,
        version: 0x0001_0000,
        processReplacing: Some(stub_process),
        processDoubleReplacing: Some(stub_process_double),
        future: [0; 56],
    }));

    (effect, state)
}

// ---------------------------------------------------------------------------
// DAW side

unsafe extern "C" fn daw_callback(
    _effect: *mut AEffect,
    opcode: i32,
    _index: i32,
    _value: isize,
    _ptr: *mut c_void,
    _opt: f32,
) -> isize {
    match opcode {
        am::GET_SAMPLE_RATE => 48000,
        am::VERSION => 2400,
        _ => 0,
    }
}

// ---------------------------------------------------------------------------
// Harness

struct Loopback {
    shim: Option<Box<ShimEffect>>,
    stub: &'static StubState,
    main_thread: Option<JoinHandle<()>>,
    audio_thread: Option<JoinHandle<()>>,
}

impl Loopback {
    /// Wire a shim and an in-process agent hosting a fresh stub plugin, and
    /// run the handshake.
    fn start(num_inputs: i32, num_outputs: i32) -> Self {
        let (shim_main, agent_main) = BridgeChannel::pair().unwrap();
        let (shim_rt, agent_rt) = BridgeChannel::pair().unwrap();

        let agent: &'static HostAgent =
            Box::leak(Box::new(HostAgent::new(agent_main, agent_rt)));
        let (effect, stub) = build_stub(agent, num_inputs, num_outputs);
        agent.set_effect(effect);

        let main_thread = std::thread::spawn(move || {
            agent.expect_handshake().unwrap();
            agent.send_initial_plugin_data().unwrap();
            agent.main_loop();
        });
        let audio_thread = std::thread::spawn(move || agent.audio_loop());

        let shim = ShimEffect::new(daw_callback, shim_main, shim_rt, None);
        shim.handshake().unwrap();

        Self {
            shim: Some(shim),
            stub,
            main_thread: Some(main_thread),
            audio_thread: Some(audio_thread),
        }
    }

    fn effect(&self) -> *mut AEffect {
        self.shim.as_ref().unwrap().effect_ptr()
    }

    unsafe fn dispatch(&self, opcode: i32, index: i32, value: isize, ptr: *mut c_void, opt: f32) -> isize {
        let effect = self.effect();
        ((*effect).dispatcher.unwrap())(effect, opcode, index, value, ptr, opt)
    }
}

impl Drop for Loopback {
    fn drop(&mut self) {
        // Closing the shim's channels is the teardown signal; both agent
        // loops must notice within one poll tick and exit
        drop(self.shim.take());
        self.main_thread.take().unwrap().join().unwrap();
        self.audio_thread.take().unwrap().join().unwrap();
    }
}

// ---------------------------------------------------------------------------
// Scenarios

#[test]
fn handshake_populates_the_descriptor() {
    let bridge = Loopback::start(2, 2);
    let effect = unsafe { &*bridge.effect() };

    assert_eq!(effect.magic, EFFECT_MAGIC);
    assert_eq!(effect.numInputs, 2);
    assert_eq!(effect.numOutputs, 2);
    assert_eq!(effect.numParams, 4);
    assert_eq!(effect.numPrograms, 1);
    assert_eq!(effect.flags, 0x10);
    assert_eq!(effect.uniqueID, 0x4142_4344);
    assert_eq!(effect.version, 0x0001_0000);

    assert!(effect.dispatcher.is_some());
    assert!(effect.setParameter.is_some());
    assert!(effect.getParameter.is_some());
    assert!(effect.processReplacing.is_some());
    assert!(effect.processDoubleReplacing.is_some());
}

#[test]
fn parameter_round_trip() {
    let bridge = Loopback::start(2, 2);
    let effect = bridge.effect();

    let value = unsafe { ((*effect).getParameter.unwrap())(effect, 2) };
    assert_relative_eq!(value, 0.375);

    // Fire-and-forget write, observable through the next read
    unsafe { ((*effect).setParameter.unwrap())(effect, 1, 0.75) };
    let value = unsafe { ((*effect).getParameter.unwrap())(effect, 1) };
    assert_relative_eq!(value, 0.75);
}

#[test]
fn process_block_round_trip() {
    let bridge = Loopback::start(1, 1);
    let effect = bridge.effect();

    let input = [1.0f32, 2.0, 3.0, 4.0];
    let mut output = [0.0f32; 4];
    let inputs = [input.as_ptr()];
    let mut outputs = [output.as_mut_ptr()];

    unsafe {
        ((*effect).processReplacing.unwrap())(effect, inputs.as_ptr(), outputs.as_mut_ptr(), 4)
    };

    for (sample, expected) in output.iter().zip([0.5f32, 1.0, 1.5, 2.0]) {
        assert_relative_eq!(*sample, expected);
    }
}

#[test]
fn process_double_block_round_trip() {
    let bridge = Loopback::start(2, 2);
    let effect = bridge.effect();

    let left = [1.0f64, -1.0, 0.25, 8.0];
    let right = [2.0f64, -2.0, 0.5, 16.0];
    let mut out_left = [0.0f64; 4];
    let mut out_right = [0.0f64; 4];
    let inputs = [left.as_ptr(), right.as_ptr()];
    let mut outputs = [out_left.as_mut_ptr(), out_right.as_mut_ptr()];

    unsafe {
        ((*effect).processDoubleReplacing.unwrap())(
            effect,
            inputs.as_ptr(),
            outputs.as_mut_ptr(),
            4,
        )
    };

    for (sample, expected) in out_left.iter().zip([0.5f64, -0.5, 0.125, 4.0]) {
        assert_relative_eq!(*sample, expected);
    }
    for (sample, expected) in out_right.iter().zip([1.0f64, -1.0, 0.25, 8.0]) {
        assert_relative_eq!(*sample, expected);
    }
}

#[test]
fn reentrant_callback_is_answered_inline() {
    let bridge = Loopback::start(2, 2);

    // The stub re-enters audioMasterGetSampleRate while the shim is still
    // awaiting the effMainsChanged response and returns the answer as the
    // dispatch result
    let result = unsafe { bridge.dispatch(op::MAINS_CHANGED, 0, 1, ptr::null_mut(), 0.0) };
    assert_eq!(result, 48000);
}

#[test]
fn descriptor_updates_propagate_to_the_shim() {
    let bridge = Loopback::start(2, 2);

    // The stub bumps its initialDelay during effMainsChanged; the agent
    // detects the divergence and pushes a PLUGIN_DATA frame the shim applies
    unsafe { bridge.dispatch(op::MAINS_CHANGED, 0, 1, ptr::null_mut(), 0.0) };
    // One more round trip guarantees the push has been drained
    unsafe { bridge.dispatch(op::GET_PROGRAM, 0, 0, ptr::null_mut(), 0.0) };

    let effect = unsafe { &*bridge.effect() };
    assert_eq!(effect.initialDelay, 64);
}

#[test]
fn string_opcode_copies_into_the_callers_buffer() {
    let bridge = Loopback::start(2, 2);

    let mut name = [0x7fu8; MAX_PROG_NAME_LEN];
    unsafe {
        bridge.dispatch(
            op::GET_PROGRAM_NAME,
            0,
            0,
            name.as_mut_ptr() as *mut c_void,
            0.0,
        )
    };
    assert_eq!(&name[..5], b"Init\0");
}

#[test]
fn chunk_round_trips_across_multiple_frames() {
    let bridge = Loopback::start(2, 2);

    // 131072 bytes spans several CHUNK_BYTES frames on one tag
    let mut chunk: *mut c_void = ptr::null_mut();
    let total = unsafe {
        bridge.dispatch(
            op::GET_CHUNK,
            0,
            0,
            &mut chunk as *mut *mut c_void as *mut c_void,
            0.0,
        )
    };
    assert_eq!(total, 131072);
    let received = unsafe { slice::from_raw_parts(chunk as *const u8, total as usize) };
    let expected: Vec<u8> = (0..131072).map(|i| (i % 251) as u8).collect();
    assert_eq!(received, &expected[..]);

    // And back the other way
    let outgoing: Vec<u8> = (0..100_000).map(|i| (i % 13) as u8).collect();
    let result = unsafe {
        bridge.dispatch(
            op::SET_CHUNK,
            0,
            outgoing.len() as isize,
            outgoing.as_ptr() as *mut c_void,
            0.0,
        )
    };
    assert_eq!(result, 1);
    assert_eq!(*bridge.stub.chunk_in.lock().unwrap(), outgoing);
}

#[test]
fn chunk_sizes_from_empty_to_several_frames() {
    let bridge = Loopback::start(2, 2);

    // 65536 is the per-frame chunk limit; straddle it in both directions
    for size in [0usize, 1, 65535, 65536, 65537, 131072, 150_001] {
        let outgoing: Vec<u8> = (0..size).map(|i| (i % 241) as u8).collect();
        let result = unsafe {
            bridge.dispatch(
                op::SET_CHUNK,
                0,
                size as isize,
                if outgoing.is_empty() {
                    ptr::null_mut()
                } else {
                    outgoing.as_ptr() as *mut c_void
                },
                0.0,
            )
        };
        assert_eq!(result, 1, "set chunk of {size} bytes");
        assert_eq!(*bridge.stub.chunk_in.lock().unwrap(), outgoing, "{size} bytes");
    }
}

#[test]
fn editor_open_exchanges_a_handle_and_shows_the_window() {
    let bridge = Loopback::start(2, 2);

    // Headless build: the handle exchange degrades to 0, but the dispatch
    // and the SHOW_WINDOW round trip behind it must complete
    let handle = unsafe { bridge.dispatch(op::EDIT_OPEN, 0, 0, ptr::null_mut(), 0.0) };
    assert_eq!(handle, 0);

    let result = unsafe { bridge.dispatch(op::EDIT_CLOSE, 0, 0, ptr::null_mut(), 0.0) };
    assert_eq!(result, 0);
}

#[test]
fn edit_rect_reports_the_clamped_rect() {
    let bridge = Loopback::start(2, 2);

    let mut rect: *mut vst2_bridge::vst2::ERect = ptr::null_mut();
    unsafe {
        bridge.dispatch(
            op::EDIT_GET_RECT,
            0,
            0,
            &mut rect as *mut *mut vst2_bridge::vst2::ERect as *mut c_void,
            0.0,
        )
    };

    // The shim points the caller at its own storage and clamps it to 1x1,
    // preserving the long-observed host workaround
    assert!(!rect.is_null());
    let rect = unsafe { *rect };
    assert_eq!((rect.top, rect.left, rect.bottom, rect.right), (0, 0, 1, 1));
}

#[test]
fn close_is_fire_and_forget_and_destroys_the_shim() {
    // No agent on the other side: a raw peer observes what close puts on
    // the wire while the shim tears itself down without waiting
    let (shim_main, peer_main) = BridgeChannel::pair().unwrap();
    let (shim_rt, _peer_rt) = BridgeChannel::pair().unwrap();

    let shim = Box::into_raw(ShimEffect::new(daw_callback, shim_main, shim_rt, None));
    let effect = unsafe { (*shim).effect_ptr() };

    let result =
        unsafe { ((*effect).dispatcher.unwrap())(effect, op::CLOSE, 0, 0, ptr::null_mut(), 0.0) };
    assert_eq!(result, 0);
    // The shim freed itself after the dispatch unwound; `effect` is gone

    let mut frame = Frame::new();
    peer_main.recv(&mut frame).unwrap();
    assert_eq!(frame.cmd().unwrap(), Cmd::EffectDispatch);
    assert_eq!(frame.call().opcode, op::CLOSE);
    assert_ne!(frame.tag(), 0);

    // The shim's channel ends were closed by the teardown
    let mut next = Frame::new();
    assert!(peer_main.recv(&mut next).is_err());
}
