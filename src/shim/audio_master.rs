//! Inline dispatch of host callbacks arriving from the helper. These frames
//! show up while the shim is blocked in a `wait()` (the plugin called back
//! into its host mid-dispatch) and on no particular schedule otherwise; both
//! paths end up here, answer on the same context the call arrived on, and
//! return so the interrupted wait can resume.

use std::os::raw::c_void;
use std::ptr;

use super::ShimEffect;
use crate::bridge::frame::walk_midi_records;
use crate::bridge::{BridgeResult, ChannelContext, Frame};
use crate::util;
use crate::vst2::{
    host_opcodes as am, EventsBuffer, VstEvent, VstTimeInfo, MAX_VENDOR_STR_LEN,
};

impl ShimEffect {
    fn call_host(&self, opcode: i32, index: i32, value: isize, ptr: *mut c_void, opt: f32) -> isize {
        unsafe { (self.host_callback)(self.effect_ptr(), opcode, index, value, ptr, opt) }
    }

    pub(super) fn handle_audio_master(
        &self,
        ctx: &ChannelContext,
        frame: &mut Frame,
    ) -> BridgeResult<()> {
        let call = *frame.call();
        let opcode = call.opcode;
        let index = call.index;
        let value = call.value as isize;
        let opt = call.opt;

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
                let result = self.call_host(opcode, index, value, ptr::null_mut(), opt);
                frame.call_mut().value = result as i64;
                frame.clear_call_data();
            }

            // The data slot carries the feature string the plugin asked about
            am::CAN_DO => {
                let query = frame.call_data().as_ptr() as *mut c_void;
                let result = self.call_host(opcode, index, value, query, opt);
                frame.call_mut().value = result as i64;
                frame.clear_call_data();
            }

            // The DAW writes a string into the buffer we pass it
            am::GET_VENDOR_STRING | am::GET_PRODUCT_STRING => {
                let mut buffer = [0u8; MAX_VENDOR_STR_LEN];
                let result = self.call_host(
                    opcode,
                    index,
                    value,
                    buffer.as_mut_ptr() as *mut c_void,
                    opt,
                );
                frame.call_mut().value = result as i64;
                frame.set_call_data(&buffer[..util::cstr_len(&buffer)]);
            }

            // The DAW returns a pointer to its time info, or null; marshal
            // the struct behind a presence flag in `value`
            am::GET_TIME => {
                let result = self.call_host(opcode, index, value, ptr::null_mut(), opt);
                if result == 0 {
                    frame.call_mut().value = 0;
                    frame.clear_call_data();
                } else {
                    let time_info = unsafe { *(result as *const VstTimeInfo) };
                    frame.call_mut().value = 1;
                    unsafe {
                        frame.set_call_data(util::as_raw_bytes(&time_info));
                    }
                }
            }

            // Rebuild the array-of-pointers view over the packed records
            // before handing the batch to the DAW
            am::PROCESS_EVENTS => {
                let pointers: Vec<*mut VstEvent> = {
                    let (count, records) = frame.midi_batch();
                    let base = records.as_ptr();
                    walk_midi_records(records, count)
                        .iter()
                        .map(|range| unsafe { base.add(range.start) as *mut VstEvent })
                        .collect()
                };

                let mut events = EventsBuffer::from_pointers(&pointers);
                let result = self.call_host(
                    opcode,
                    index,
                    value,
                    events.as_events() as *mut c_void,
                    opt,
                );
                frame.call_mut().value = result as i64;
                frame.clear_call_data();
            }

            _ => {
                bridge_error!(
                    "unhandled audio master opcode {opcode} (index {index}, value {value})"
                );
                frame.call_mut().value = 0;
                frame.clear_call_data();
            }
        }

        ctx.send(frame)
    }
}
