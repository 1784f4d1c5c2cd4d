//! Serving shim-initiated requests against the real plugin: the mirror image
//! of the shim's translators. Unmarshal the arguments, call the plugin's
//! dispatcher / process / parameter entry points, and answer on the same tag.

use std::mem;
use std::os::raw::c_void;
use std::ptr;
use std::slice;

use super::HostAgent;
use crate::bridge::frame::{walk_midi_records, SchedParam};
use crate::bridge::{BridgeResult, ChannelContext, Cmd, Frame, CHUNK_BYTES};
use crate::util;
use crate::vst2::{
    effect_opcodes as op, ERect, EventsBuffer, MidiKeyName, VstEvent, VstParameterProperties,
    VstPinProperties,
};

/// Upper bound on the audio channel count per direction; the fixed pointer
/// arrays on the processing path are sized by it so serving a block never
/// allocates.
const MAX_CHANNELS: usize = 32;

/// Scratch size for plugin-written strings; generous compared to the ABI
/// maxima since plugins routinely overrun the nominal lengths.
const STRING_SCRATCH: usize = 256;

impl HostAgent {
    unsafe fn call_plugin(
        &self,
        opcode: i32,
        index: i32,
        value: isize,
        ptr: *mut c_void,
        opt: f32,
    ) -> isize {
        match self.effect().and_then(|effect| effect.dispatcher) {
            Some(dispatcher) => dispatcher(self.effect_ptr(), opcode, index, value, ptr, opt),
            None => 0,
        }
    }

    pub(super) fn serve(&self, ctx: &ChannelContext, frame: &mut Frame) -> BridgeResult<()> {
        match frame.cmd()? {
            Cmd::EffectDispatch => self.serve_dispatch(ctx, frame),

            Cmd::GetParameter => {
                let index = frame.param().index;
                let value = match self.effect().and_then(|effect| effect.getParameter) {
                    Some(get_parameter) => unsafe { get_parameter(self.effect_ptr(), index) },
                    None => 0.0,
                };
                frame.param_mut().value = value;
                ctx.send(frame)
            }

            // Fire-and-forget: no response
            Cmd::SetParameter => {
                let param = *frame.param();
                if let Some(set_parameter) = self.effect().and_then(|effect| effect.setParameter)
                {
                    unsafe { set_parameter(self.effect_ptr(), param.index, param.value) };
                }
                Ok(())
            }

            Cmd::Process => self.serve_process_f32(ctx, frame),
            Cmd::ProcessDouble => self.serve_process_f64(ctx, frame),
            Cmd::ShowWindow => self.serve_show_window(ctx, frame),

            // Fire-and-forget scheduling hint for this thread
            Cmd::SetSchedParam => {
                self.apply_sched_param(frame.sched());
                Ok(())
            }

            other => {
                bridge_debug_assert_failure!("unexpected command {:?} on the agent", other);
                Ok(())
            }
        }
    }

    fn serve_dispatch(&self, ctx: &ChannelContext, frame: &mut Frame) -> BridgeResult<()> {
        let call = *frame.call();
        let opcode = call.opcode;
        let index = call.index;
        let value = call.value as isize;
        let opt = call.opt;

        match opcode {
            // Scalar result; the data slot rides along as the pointer
            // argument for the opcodes that take a string (set program name)
            op::OPEN
            | op::SET_PROGRAM
            | op::GET_PROGRAM
            | op::SET_PROGRAM_NAME
            | op::SET_SAMPLE_RATE
            | op::SET_BLOCK_SIZE
            | op::MAINS_CHANGED
            | op::EDIT_IDLE
            | op::IDLE_DEPRECATED
            | op::GET_PLUG_CATEGORY
            | op::GET_VST_VERSION
            | op::GET_VENDOR_VERSION
            | op::BEGIN_SET_PROGRAM
            | op::END_SET_PROGRAM
            | op::START_PROCESS
            | op::STOP_PROCESS
            | op::CONNECT_INPUT_DEPRECATED
            | op::CONNECT_OUTPUT_DEPRECATED
            | op::SET_EDIT_KNOB_MODE
            | op::EDIT_KEY_DOWN
            | op::EDIT_KEY_UP
            | op::CAN_BE_AUTOMATED
            | op::GET_TAIL_SIZE
            | op::SET_TOTAL_SAMPLE_TO_PROCESS
            | op::SET_PAN_LAW
            | op::SET_PROCESS_PRECISION
            | op::GET_NUM_MIDI_INPUT_CHANNELS
            | op::GET_NUM_MIDI_OUTPUT_CHANNELS
            | op::BEGIN_LOAD_BANK => {
                let data = frame.call_data().as_ptr() as *mut c_void;
                let result = unsafe { self.call_plugin(opcode, index, value, data, opt) };
                frame.call_mut().value = result as i64;
                frame.clear_call_data();
                ctx.send(frame)
            }

            op::CLOSE => {
                unsafe { self.call_plugin(opcode, index, value, ptr::null_mut(), opt) };
                bridge_log!("plugin closed, exiting");
                log::logger().flush();
                std::process::exit(0);
            }

            // The plugin writes a string into our scratch buffer
            op::GET_PROGRAM_NAME
            | op::GET_PARAM_LABEL
            | op::GET_PARAM_DISPLAY
            | op::GET_PARAM_NAME
            | op::GET_EFFECT_NAME
            | op::GET_VENDOR_STRING
            | op::GET_PRODUCT_STRING
            | op::GET_PROGRAM_NAME_INDEXED => self.string_call(ctx, frame, opcode, index, value, opt),
            op::VENDOR_SPECIFIC if index == op::GET_PARAM_DISPLAY => {
                self.string_call(ctx, frame, opcode, index, value, opt)
            }

            // The data slot carries the query string; the answer is scalar
            op::CAN_DO => {
                let query = frame.call_data().as_ptr() as *mut c_void;
                let result = unsafe { self.call_plugin(opcode, index, value, query, opt) };
                frame.call_mut().value = result as i64;
                ctx.send(frame)
            }

            op::GET_INPUT_PROPERTIES | op::GET_OUTPUT_PROPERTIES => {
                let mut properties: VstPinProperties = unsafe { mem::zeroed() };
                let result = unsafe {
                    self.call_plugin(
                        opcode,
                        index,
                        value,
                        &mut properties as *mut _ as *mut c_void,
                        opt,
                    )
                };
                frame.call_mut().value = result as i64;
                frame.set_call_data(unsafe { util::as_raw_bytes(&properties) });
                ctx.send(frame)
            }

            op::GET_PARAMETER_PROPERTIES => {
                let mut properties: VstParameterProperties = unsafe { mem::zeroed() };
                let result = unsafe {
                    self.call_plugin(
                        opcode,
                        index,
                        value,
                        &mut properties as *mut _ as *mut c_void,
                        opt,
                    )
                };
                frame.call_mut().value = result as i64;
                frame.set_call_data(unsafe { util::as_raw_bytes(&properties) });
                ctx.send(frame)
            }

            // In-out: the shim sent the host-filled fields, the plugin fills
            // in the name
            op::GET_MIDI_KEY_NAME => {
                let mut key_name: MidiKeyName = unsafe { mem::zeroed() };
                let incoming = frame.call_data();
                let len = incoming.len().min(mem::size_of::<MidiKeyName>());
                unsafe {
                    ptr::copy_nonoverlapping(
                        incoming.as_ptr(),
                        &mut key_name as *mut _ as *mut u8,
                        len,
                    )
                };

                let result = unsafe {
                    self.call_plugin(
                        opcode,
                        index,
                        value,
                        &mut key_name as *mut _ as *mut c_void,
                        opt,
                    )
                };
                frame.call_mut().value = result as i64;
                frame.set_call_data(unsafe { util::as_raw_bytes(&key_name) });
                ctx.send(frame)
            }

            op::EDIT_GET_RECT => {
                let mut rect: *mut ERect = ptr::null_mut();
                let result = unsafe {
                    self.call_plugin(
                        opcode,
                        index,
                        value,
                        &mut rect as *mut _ as *mut c_void,
                        opt,
                    )
                };
                frame.call_mut().value = result as i64;
                if rect.is_null() {
                    frame.clear_call_data();
                } else {
                    frame.set_call_data(unsafe { util::as_raw_bytes(&*rect) });
                }
                ctx.send(frame)
            }

            // Create the foreign-side window and return the handle the
            // compatibility layer associates with it; the plugin's own
            // editor-open runs when SHOW_WINDOW arrives
            op::EDIT_OPEN => {
                let mut rect: *mut ERect = ptr::null_mut();
                unsafe {
                    self.call_plugin(
                        op::EDIT_GET_RECT,
                        0,
                        0,
                        &mut rect as *mut _ as *mut c_void,
                        0.0,
                    )
                };
                let size = if rect.is_null() {
                    None
                } else {
                    Some(unsafe { *rect })
                };

                let handle = self.editor.lock().open(size);
                if handle == 0 {
                    bridge_error!("failed to create the editor window");
                }
                let call = frame.call_mut();
                call.value = 0;
                call.index = handle as i32;
                frame.clear_call_data();
                ctx.send(frame)
            }

            op::EDIT_CLOSE => {
                self.editor.lock().destroy();
                let result =
                    unsafe { self.call_plugin(opcode, index, value, ptr::null_mut(), opt) };
                frame.call_mut().value = result as i64;
                frame.clear_call_data();
                ctx.send(frame)
            }

            // On this side both the value and pointer arguments refer to the
            // arrangement that came over the wire
            op::SET_SPEAKER_ARRANGEMENT => {
                let data = frame.call_data().as_ptr();
                let result = unsafe {
                    self.call_plugin(opcode, index, data as isize, data as *mut c_void, opt)
                };
                frame.call_mut().value = result as i64;
                // The data slot is echoed back; the plugin may have updated
                // the arrangement in place
                ctx.send(frame)
            }

            op::PROCESS_EVENTS => {
                let pointers: Vec<*mut VstEvent> = {
                    let (count, records) = frame.midi_batch();
                    let base = records.as_ptr();
                    walk_midi_records(records, count)
                        .iter()
                        .map(|range| unsafe { base.add(range.start) as *mut VstEvent })
                        .collect()
                };

                let mut events = EventsBuffer::from_pointers(&pointers);
                let result = unsafe {
                    self.call_plugin(opcode, index, value, events.as_events() as *mut c_void, opt)
                };
                frame.call_mut().value = result as i64;
                frame.clear_call_data();
                ctx.send(frame)
            }

            op::GET_CHUNK => self.serve_get_chunk(ctx, frame, opcode, index, value, opt),
            op::SET_CHUNK => self.serve_set_chunk(ctx, frame, opcode, index, opt),

            _ => {
                bridge_error!(
                    "unsupported dispatcher opcode {opcode} (index {index}, value {value}), \
                     answering with a default"
                );
                frame.call_mut().value = 0;
                frame.clear_call_data();
                ctx.send(frame)
            }
        }
    }

    fn string_call(
        &self,
        ctx: &ChannelContext,
        frame: &mut Frame,
        opcode: i32,
        index: i32,
        value: isize,
        opt: f32,
    ) -> BridgeResult<()> {
        let mut buffer = [0u8; STRING_SCRATCH];
        let result = unsafe {
            self.call_plugin(opcode, index, value, buffer.as_mut_ptr() as *mut c_void, opt)
        };
        frame.call_mut().value = result as i64;
        frame.set_call_data(&buffer[..util::cstr_len(&buffer)]);
        ctx.send(frame)
    }

    // The first response carries the total size in `value` and the first
    // chunk; successive responses on the same tag carry the rest.
    fn serve_get_chunk(
        &self,
        ctx: &ChannelContext,
        frame: &mut Frame,
        opcode: i32,
        index: i32,
        value: isize,
        opt: f32,
    ) -> BridgeResult<()> {
        let mut chunk: *mut c_void = ptr::null_mut();
        let total = unsafe {
            self.call_plugin(
                opcode,
                index,
                value,
                &mut chunk as *mut _ as *mut c_void,
                opt,
            )
        }
        .max(0) as usize;

        if total > 0 && chunk.is_null() {
            bridge_error!("plugin reported a {total} byte chunk but returned no pointer");
            frame.call_mut().value = 0;
            frame.clear_call_data();
            return ctx.send(frame);
        }

        frame.call_mut().value = total as i64;
        let bytes = if total == 0 {
            &[][..]
        } else {
            unsafe { slice::from_raw_parts(chunk as *const u8, total) }
        };

        let mut offset = 0;
        loop {
            let step = CHUNK_BYTES.min(total - offset);
            frame.set_call_data(&bytes[offset..offset + step]);
            ctx.send(frame)?;
            offset += step;
            if offset >= total {
                return Ok(());
            }
        }
    }

    // Continuation frames of a transfer share the originating tag, so the
    // wait below hands them to us directly while still dispatching any other
    // traffic that interleaves.
    fn serve_set_chunk(
        &self,
        ctx: &ChannelContext,
        frame: &mut Frame,
        opcode: i32,
        index: i32,
        opt: f32,
    ) -> BridgeResult<()> {
        let total = frame.call().value.max(0) as usize;
        let tag = frame.tag();

        let mut data = Vec::new();
        if data.try_reserve_exact(total).is_err() {
            bridge_error!("cannot stage a {total} byte chunk, answering failure");
            frame.call_mut().value = 0;
            frame.clear_call_data();
            return ctx.send(frame);
        }

        loop {
            let incoming = frame.call_data();
            let step = incoming.len().min(total - data.len());
            data.extend_from_slice(&incoming[..step]);
            if data.len() >= total {
                break;
            }
            if step == 0 {
                bridge_error!(
                    "empty chunk frame at offset {} of {total}, giving up",
                    data.len()
                );
                break;
            }
            ctx.wait(tag, frame, self)?;
        }

        let result = unsafe {
            self.call_plugin(
                opcode,
                index,
                data.len() as isize,
                data.as_mut_ptr() as *mut c_void,
                opt,
            )
        };
        frame.call_mut().value = result as i64;
        frame.clear_call_data();
        ctx.send(frame)
    }

    fn serve_process_f32(&self, ctx: &ChannelContext, frame: &mut Frame) -> BridgeResult<()> {
        let Some(effect) = self.effect() else {
            bridge_debug_assert_failure!("process request before the plugin is up");
            return ctx.send(frame);
        };

        let nframes = frame.audio().nframes as usize;
        let num_inputs = effect.numInputs.clamp(0, MAX_CHANNELS as i32) as usize;
        let num_outputs = effect.numOutputs.clamp(0, MAX_CHANNELS as i32) as usize;

        let mut inputs = [ptr::null::<f32>(); MAX_CHANNELS];
        let in_samples = frame.samples_f32(num_inputs * nframes);
        for channel in 0..num_inputs {
            inputs[channel] = in_samples[channel * nframes..].as_ptr();
        }

        let mut response = Frame::request(Cmd::Process);
        response.set_tag(frame.tag());
        response.set_nframes(nframes as u32);
        let mut outputs = [ptr::null_mut::<f32>(); MAX_CHANNELS];
        let out_samples = response.samples_f32_mut(num_outputs * nframes);
        for channel in 0..num_outputs {
            outputs[channel] = out_samples[channel * nframes..].as_mut_ptr();
        }

        if let Some(process) = effect.processReplacing {
            unsafe {
                process(
                    self.effect_ptr(),
                    inputs.as_ptr(),
                    outputs.as_mut_ptr(),
                    nframes as i32,
                )
            };
        }

        ctx.send(&response)
    }

    fn serve_process_f64(&self, ctx: &ChannelContext, frame: &mut Frame) -> BridgeResult<()> {
        let Some(effect) = self.effect() else {
            bridge_debug_assert_failure!("process request before the plugin is up");
            return ctx.send(frame);
        };

        let nframes = frame.audio().nframes as usize;
        let num_inputs = effect.numInputs.clamp(0, MAX_CHANNELS as i32) as usize;
        let num_outputs = effect.numOutputs.clamp(0, MAX_CHANNELS as i32) as usize;

        let mut inputs = [ptr::null::<f64>(); MAX_CHANNELS];
        let in_samples = frame.samples_f64(num_inputs * nframes);
        for channel in 0..num_inputs {
            inputs[channel] = in_samples[channel * nframes..].as_ptr();
        }

        let mut response = Frame::request(Cmd::ProcessDouble);
        response.set_tag(frame.tag());
        response.set_nframes(nframes as u32);
        let mut outputs = [ptr::null_mut::<f64>(); MAX_CHANNELS];
        let out_samples = response.samples_f64_mut(num_outputs * nframes);
        for channel in 0..num_outputs {
            outputs[channel] = out_samples[channel * nframes..].as_mut_ptr();
        }

        if let Some(process) = effect.processDoubleReplacing {
            unsafe {
                process(
                    self.effect_ptr(),
                    inputs.as_ptr(),
                    outputs.as_mut_ptr(),
                    nframes as i32,
                )
            };
        }

        ctx.send(&response)
    }

    // The window was created while serving effEditOpen; this runs the
    // plugin's own editor-open against it and makes it visible.
    fn serve_show_window(&self, ctx: &ChannelContext, frame: &mut Frame) -> BridgeResult<()> {
        let native = self.editor.lock().native_handle();
        unsafe { self.call_plugin(op::EDIT_OPEN, 0, 0, native, 0.0) };
        self.editor.lock().show();

        frame.set_payload_len(0);
        ctx.send(frame)
    }

    fn apply_sched_param(&self, sched: SchedParam) {
        #[cfg(unix)]
        {
            let mut param: libc::sched_param = unsafe { mem::zeroed() };
            param.sched_priority = sched.priority;
            let result = unsafe {
                libc::pthread_setschedparam(libc::pthread_self(), sched.policy, &param)
            };
            if result == 0 {
                bridge_log!(
                    "applied realtime scheduling: policy {}, priority {}",
                    sched.policy,
                    sched.priority
                );
            } else {
                bridge_error!(
                    "pthread_setschedparam(policy {}, priority {}) failed: {}",
                    sched.policy,
                    sched.priority,
                    std::io::Error::from_raw_os_error(result)
                );
            }
        }
        #[cfg(not(unix))]
        {
            let _ = sched;
        }
    }
}
