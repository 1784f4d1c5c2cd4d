//! The host callback handed to the real plugin. Every invocation is turned
//! into an `AUDIO_MASTER_CALLBACK` frame on the context matching the calling
//! thread and its response awaited with the usual multiplexing rules, so the
//! shim can keep calling us while we block.

use std::os::raw::{c_char, c_void};
use std::ptr;

use super::{HostAgent, AGENT};
use crate::bridge::{ChannelContext, Cmd, Frame};
use crate::util;
use crate::vst2::{
    host_opcodes as am, AEffect, VstEvents, VstTimeInfo, EVENT_SIZE_PREFIX, MAX_VENDOR_STR_LEN,
    VST_VERSION,
};

/// `canDo` feature identifiers are short; bound the copy of an unterminated
/// plugin string.
const MAX_CAN_DO_LEN: usize = 256;

/// The function pointer passed to the plugin's entry point. Plain C, no
/// closure context: the endpoint is recovered through the process-wide slot,
/// which is installed before the plugin library is even loaded.
pub(super) unsafe extern "C" fn agent_audio_master(
    _effect: *mut AEffect,
    opcode: i32,
    index: i32,
    value: isize,
    ptr: *mut c_void,
    opt: f32,
) -> isize {
    match AGENT.get() {
        Some(agent) => agent.audio_master(opcode, index, value, ptr, opt),
        // Only reachable when a plugin calls back outside any agent run;
        // answer the version query and nothing else
        None => {
            if opcode == am::VERSION {
                VST_VERSION as isize
            } else {
                0
            }
        }
    }
}

impl HostAgent {
    /// Translate one host callback into bridge traffic. Public so an
    /// in-process stub plugin can drive it the way a loaded binary would.
    pub fn audio_master(
        &self,
        opcode: i32,
        index: i32,
        value: isize,
        ptr: *mut c_void,
        opt: f32,
    ) -> isize {
        let ctx = self.current_context();

        // A callback is a point where the plugin may just have mutated its
        // descriptor; reconcile on the way in and out
        self.check_plugin_data(ctx);
        let result = self.forward_audio_master(ctx, opcode, index, value, ptr, opt);
        self.check_plugin_data(ctx);
        result
    }

    fn callback_frame(&self, opcode: i32, index: i32, value: isize, opt: f32) -> Frame {
        let mut frame = Frame::request(Cmd::AudioMasterCallback);
        let call = frame.call_mut();
        call.opcode = opcode;
        call.index = index;
        call.value = value as i64;
        call.opt = opt;
        frame
    }

    fn forward_audio_master(
        &self,
        ctx: &ChannelContext,
        opcode: i32,
        index: i32,
        value: isize,
        ptr: *mut c_void,
        opt: f32,
    ) -> isize {
        match opcode {
            // No additional data in either direction
            am::AUTOMATE
            | am::VERSION
            | am::CURRENT_ID
            | am::IDLE
            | am::PIN_CONNECTED_DEPRECATED
            | am::WANT_MIDI_DEPRECATED
            | am::TEMPO_AT_DEPRECATED
            | am::IO_CHANGED
            | am::NEED_IDLE_DEPRECATED
            | am::SIZE_WINDOW
            | am::GET_SAMPLE_RATE
            | am::GET_BLOCK_SIZE
            | am::GET_INPUT_LATENCY
            | am::GET_OUTPUT_LATENCY
            | am::GET_CURRENT_PROCESS_LEVEL
            | am::GET_AUTOMATION_STATE
            | am::GET_VENDOR_VERSION
            | am::BEGIN_EDIT
            | am::END_EDIT => {
                let mut frame = self.callback_frame(opcode, index, value, opt);
                match self.roundtrip(ctx, &mut frame) {
                    Ok(()) => frame.call().value as isize,
                    Err(err) => {
                        bridge_error!("audio master callback {opcode} failed: {err}");
                        0
                    }
                }
            }

            // Quirks kept from the observed behavior: answered locally,
            // never put on the wire
            am::UPDATE_DISPLAY => 1,
            am::OPEN_FILE_SELECTOR => 0,

            am::CAN_DO => {
                let mut frame = self.callback_frame(opcode, index, value, opt);
                frame.set_call_data(unsafe { util::cstr_in(ptr as *const c_char, MAX_CAN_DO_LEN) });
                match self.roundtrip(ctx, &mut frame) {
                    Ok(()) => frame.call().value as isize,
                    Err(err) => {
                        bridge_error!("audioMasterCanDo failed: {err}");
                        0
                    }
                }
            }

            am::GET_VENDOR_STRING | am::GET_PRODUCT_STRING => {
                if ptr.is_null() {
                    return 0;
                }
                let mut frame = self.callback_frame(opcode, index, value, opt);
                match self.roundtrip(ctx, &mut frame) {
                    Ok(()) => {
                        unsafe {
                            util::copy_cstr_out(
                                ptr as *mut c_char,
                                frame.call_data(),
                                MAX_VENDOR_STR_LEN,
                            )
                        };
                        frame.call().value as isize
                    }
                    Err(err) => {
                        bridge_error!("audio master callback {opcode} failed: {err}");
                        0
                    }
                }
            }

            // The response's `value` flags whether time info exists; the
            // struct itself rides in the data slot and is parked in
            // agent-owned storage, valid until the next query per the ABI
            am::GET_TIME => {
                let mut frame = self.callback_frame(opcode, index, value, opt);
                match self.roundtrip(ctx, &mut frame) {
                    Ok(()) if frame.call().value != 0 => {
                        let data = frame.call_data();
                        if data.len() < std::mem::size_of::<VstTimeInfo>() {
                            bridge_debug_assert_failure!("short time info payload");
                            return 0;
                        }
                        unsafe {
                            ptr::copy_nonoverlapping(
                                data.as_ptr(),
                                self.time_info.get() as *mut u8,
                                std::mem::size_of::<VstTimeInfo>(),
                            );
                            self.time_info.get() as isize
                        }
                    }
                    Ok(()) => 0,
                    Err(err) => {
                        bridge_error!("audioMasterGetTime failed: {err}");
                        0
                    }
                }
            }

            // Pack the plugin's event batch densely, the shim rebuilds the
            // pointer view for the DAW
            am::PROCESS_EVENTS => {
                if ptr.is_null() {
                    return 0;
                }

                let mut frame = self.callback_frame(opcode, index, value, opt);
                frame.begin_midi_batch();
                unsafe {
                    let events = &*(ptr as *const VstEvents);
                    for &event in events.events_raw() {
                        if event.is_null() {
                            continue;
                        }
                        let byte_size = (*event).byteSize.max(0) as usize;
                        let record = std::slice::from_raw_parts(
                            event as *const u8,
                            EVENT_SIZE_PREFIX + byte_size,
                        );
                        frame.push_midi_record(record);
                    }
                }

                match self.roundtrip(ctx, &mut frame) {
                    Ok(()) => frame.call().value as isize,
                    Err(err) => {
                        bridge_error!("audioMasterProcessEvents failed: {err}");
                        0
                    }
                }
            }

            _ => {
                bridge_error!(
                    "unsupported audio master opcode {opcode} (index {index}, value {value})"
                );
                0
            }
        }
    }
}
