//! Per-opcode translators behind the shim's dispatcher entry point. Each one
//! marshals the host's arguments into a request frame, round-trips it on the
//! MainContext, and copies outputs back into host-visible buffers.

use std::mem;
use std::os::raw::{c_char, c_void};
use std::slice;
use std::sync::atomic::Ordering;

use super::ShimEffect;
use crate::bridge::{Cmd, Frame, CHUNK_BYTES};
use crate::util;
use crate::vst2::{
    effect_opcodes as op, ERect, MidiKeyName, VstEvents, VstSpeakerArrangement,
    VstSpeakerProperties, EVENT_SIZE_PREFIX, MAX_EFFECT_NAME_LEN, MAX_LABEL_LEN,
    MAX_PARAM_STR_LEN, MAX_PROG_NAME_LEN, MAX_PRODUCT_STR_LEN, MAX_VENDOR_STR_LEN,
    SPEAKER_ARRANGEMENT_HEADER,
};

/// `canDo` queries are short feature identifiers; this bounds the copy of an
/// unterminated host string.
const MAX_CAN_DO_LEN: usize = 256;

impl ShimEffect {
    pub(super) fn dispatch(
        &self,
        opcode: i32,
        index: i32,
        value: isize,
        ptr: *mut c_void,
        opt: f32,
    ) -> isize {
        match opcode {
            // Scalar in, scalar out
            op::OPEN
            | op::SET_PROGRAM
            | op::GET_PROGRAM
            | op::SET_SAMPLE_RATE
            | op::SET_BLOCK_SIZE
            | op::MAINS_CHANGED
            | op::EDIT_IDLE
            | op::EDIT_CLOSE
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
            | op::IDLE_DEPRECATED
            | op::SET_TOTAL_SAMPLE_TO_PROCESS
            | op::SET_PAN_LAW
            | op::SET_PROCESS_PRECISION
            | op::GET_NUM_MIDI_INPUT_CHANNELS
            | op::GET_NUM_MIDI_OUTPUT_CHANNELS
            | op::BEGIN_LOAD_BANK => self.scalar_call(opcode, index, value, opt),

            op::CLOSE => self.close(opcode, index, value, opt),

            // String returned through the caller's buffer
            op::GET_PROGRAM_NAME | op::GET_PROGRAM_NAME_INDEXED => {
                self.string_result(opcode, index, value, ptr, opt, MAX_PROG_NAME_LEN)
            }
            op::GET_PARAM_LABEL | op::GET_PARAM_DISPLAY | op::GET_PARAM_NAME => {
                self.string_result(opcode, index, value, ptr, opt, MAX_PARAM_STR_LEN)
            }
            op::GET_EFFECT_NAME => {
                self.string_result(opcode, index, value, ptr, opt, MAX_EFFECT_NAME_LEN)
            }
            op::GET_VENDOR_STRING => {
                self.string_result(opcode, index, value, ptr, opt, MAX_VENDOR_STR_LEN)
            }
            op::GET_PRODUCT_STRING => {
                self.string_result(opcode, index, value, ptr, opt, MAX_PRODUCT_STR_LEN)
            }
            // Parameter display through the vendor-specific extension; hosts
            // that use it pass a label-sized buffer
            op::VENDOR_SPECIFIC if index == op::GET_PARAM_DISPLAY => {
                self.string_result(opcode, index, value, ptr, opt, MAX_LABEL_LEN)
            }

            // String taken from the caller's buffer
            op::SET_PROGRAM_NAME => {
                self.string_argument(opcode, index, value, ptr, opt, MAX_PROG_NAME_LEN)
            }
            op::CAN_DO => self.string_argument(opcode, index, value, ptr, opt, MAX_CAN_DO_LEN),

            // Struct returned through the caller's pointer
            op::GET_INPUT_PROPERTIES | op::GET_OUTPUT_PROPERTIES => {
                self.struct_result::<crate::vst2::VstPinProperties>(opcode, index, value, ptr, opt)
            }
            op::GET_PARAMETER_PROPERTIES => self
                .struct_result::<crate::vst2::VstParameterProperties>(
                    opcode, index, value, ptr, opt,
                ),
            op::GET_MIDI_KEY_NAME => self.midi_key_name(opcode, index, value, ptr, opt),

            op::EDIT_GET_RECT => self.edit_get_rect(opcode, index, value, ptr, opt),
            op::EDIT_OPEN => self.edit_open(opcode, index, value, opt),

            op::SET_SPEAKER_ARRANGEMENT => {
                self.set_speaker_arrangement(opcode, index, value, ptr, opt)
            }
            op::PROCESS_EVENTS => self.process_events(opcode, index, value, ptr, opt),
            op::GET_CHUNK => self.get_chunk(opcode, index, value, ptr, opt),
            op::SET_CHUNK => self.set_chunk(opcode, index, value, ptr, opt),

            _ => {
                bridge_error!(
                    "unhandled dispatcher opcode {opcode} (index {index}, value {value})"
                );
                0
            }
        }
    }

    fn call_frame(&self, opcode: i32, index: i32, value: isize, opt: f32) -> Frame {
        let mut frame = Frame::request(Cmd::EffectDispatch);
        let call = frame.call_mut();
        call.opcode = opcode;
        call.index = index;
        call.value = value as i64;
        call.opt = opt;
        frame
    }

    fn scalar_call(&self, opcode: i32, index: i32, value: isize, opt: f32) -> isize {
        let mut frame = self.call_frame(opcode, index, value, opt);
        match self.roundtrip(&self.main, &mut frame) {
            Ok(()) => frame.call().value as isize,
            Err(err) => {
                bridge_error!("dispatch({opcode}) failed: {err}");
                0
            }
        }
    }

    fn close(&self, opcode: i32, index: i32, value: isize, opt: f32) -> isize {
        let mut frame = self.call_frame(opcode, index, value, opt);
        // Send and do not wait; the helper runs the plugin's close routine
        // and exits. Destruction happens after this dispatch unwinds.
        if let Err(err) = self.main.send_request(&mut frame) {
            bridge_error!("failed to forward effClose: {err}");
        }
        self.closing.store(true, Ordering::Release);
        0
    }

    fn string_result(
        &self,
        opcode: i32,
        index: i32,
        value: isize,
        ptr: *mut c_void,
        opt: f32,
        cap: usize,
    ) -> isize {
        if ptr.is_null() {
            bridge_debug_assert_failure!("null string buffer for opcode {}", opcode);
            return 0;
        }

        let mut frame = self.call_frame(opcode, index, value, opt);
        match self.roundtrip(&self.main, &mut frame) {
            Ok(()) => {
                unsafe { util::copy_cstr_out(ptr as *mut c_char, frame.call_data(), cap) };
                frame.call().value as isize
            }
            Err(err) => {
                bridge_error!("dispatch({opcode}) failed: {err}");
                0
            }
        }
    }

    fn string_argument(
        &self,
        opcode: i32,
        index: i32,
        value: isize,
        ptr: *mut c_void,
        opt: f32,
        cap: usize,
    ) -> isize {
        let mut frame = self.call_frame(opcode, index, value, opt);
        let argument = unsafe { util::cstr_in(ptr as *const c_char, cap) };
        frame.set_call_data(argument);

        match self.roundtrip(&self.main, &mut frame) {
            Ok(()) => frame.call().value as isize,
            Err(err) => {
                bridge_error!("dispatch({opcode}) failed: {err}");
                0
            }
        }
    }

    fn struct_result<T>(
        &self,
        opcode: i32,
        index: i32,
        value: isize,
        ptr: *mut c_void,
        opt: f32,
    ) -> isize {
        if ptr.is_null() {
            bridge_debug_assert_failure!("null struct pointer for opcode {}", opcode);
            return 0;
        }

        let mut frame = self.call_frame(opcode, index, value, opt);
        match self.roundtrip(&self.main, &mut frame) {
            Ok(()) => {
                let data = frame.call_data();
                let len = data.len().min(mem::size_of::<T>());
                unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, len) };
                frame.call().value as isize
            }
            Err(err) => {
                bridge_error!("dispatch({opcode}) failed: {err}");
                0
            }
        }
    }

    // `effGetMidiKeyName` is in-out: the host fills in the program and key
    // number, the plugin fills in the name.
    fn midi_key_name(
        &self,
        opcode: i32,
        index: i32,
        value: isize,
        ptr: *mut c_void,
        opt: f32,
    ) -> isize {
        if ptr.is_null() {
            return 0;
        }

        let size = mem::size_of::<MidiKeyName>();
        let mut frame = self.call_frame(opcode, index, value, opt);
        unsafe {
            std::ptr::copy_nonoverlapping(
                ptr as *const u8,
                frame.call_data_mut(size).as_mut_ptr(),
                size,
            )
        };

        match self.roundtrip(&self.main, &mut frame) {
            Ok(()) => {
                let data = frame.call_data();
                let len = data.len().min(size);
                unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, len) };
                frame.call().value as isize
            }
            Err(err) => {
                bridge_error!("dispatch({opcode}) failed: {err}");
                0
            }
        }
    }

    fn edit_get_rect(
        &self,
        opcode: i32,
        index: i32,
        value: isize,
        ptr: *mut c_void,
        opt: f32,
    ) -> isize {
        if ptr.is_null() {
            return 0;
        }

        let _guard = self.main.lock();
        let mut frame = self.call_frame(opcode, index, value, opt);
        match self.roundtrip(&self.main, &mut frame) {
            Ok(()) => {
                let data = frame.call_data();
                unsafe {
                    let rect = &mut *self.rect.get();
                    if data.len() >= mem::size_of::<ERect>() {
                        std::ptr::copy_nonoverlapping(
                            data.as_ptr(),
                            rect as *mut ERect as *mut u8,
                            mem::size_of::<ERect>(),
                        );
                    }
                    *(ptr as *mut *mut ERect) = rect;

                    // Quirk kept from the original bridge: after handing out
                    // the rect pointer, the stored rect is clamped to 1x1.
                    rect.top = 0;
                    rect.bottom = 1;
                    rect.left = 0;
                    rect.right = 1;
                }
                frame.call().value as isize
            }
            Err(err) => {
                bridge_error!("effEditGetRect failed: {err}");
                0
            }
        }
    }

    // The helper creates the foreign-side window when serving the dispatch
    // and resolves the handle the compatibility layer associates with it;
    // `SHOW_WINDOW` then runs the plugin's own editor-open and makes the
    // window visible.
    fn edit_open(&self, opcode: i32, index: i32, value: isize, opt: f32) -> isize {
        let _guard = self.main.lock();

        let mut frame = self.call_frame(opcode, index, value, opt);
        let handle = match self.roundtrip(&self.main, &mut frame) {
            Ok(()) => frame.call().index as isize,
            Err(err) => {
                bridge_error!("effEditOpen failed: {err}");
                return 0;
            }
        };

        let mut show = Frame::request(Cmd::ShowWindow);
        if let Err(err) = self.roundtrip(&self.main, &mut show) {
            bridge_error!("failed to show the editor window: {err}");
        }

        handle
    }

    // Only the meaningful prefix of the nominal 8 entry speaker array crosses
    // the wire. `value` carries a host-side pointer which is meaningless to
    // the peer; it is forwarded untouched and replaced by the helper.
    fn set_speaker_arrangement(
        &self,
        opcode: i32,
        index: i32,
        value: isize,
        ptr: *mut c_void,
        opt: f32,
    ) -> isize {
        if value == 0 || ptr.is_null() {
            return 0;
        }

        let channels = unsafe { (*(value as *const VstSpeakerArrangement)).numChannels };
        let channels = channels.clamp(0, 8) as usize;
        let len =
            SPEAKER_ARRANGEMENT_HEADER + channels * mem::size_of::<VstSpeakerProperties>();

        let mut frame = self.call_frame(opcode, index, value, opt);
        unsafe {
            std::ptr::copy_nonoverlapping(
                ptr as *const u8,
                frame.call_data_mut(len).as_mut_ptr(),
                len,
            )
        };

        match self.roundtrip(&self.main, &mut frame) {
            Ok(()) => {
                let data = frame.call_data();
                let copy_back = data.len().min(len);
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, copy_back)
                };
                frame.call().value as isize
            }
            Err(err) => {
                bridge_error!("effSetSpeakerArrangement failed: {err}");
                0
            }
        }
    }

    // Walk the host's array-of-pointers and pack each event record densely;
    // the helper rebuilds the pointer view on its side.
    fn process_events(
        &self,
        opcode: i32,
        index: i32,
        value: isize,
        ptr: *mut c_void,
        opt: f32,
    ) -> isize {
        if ptr.is_null() {
            return 0;
        }

        let mut frame = self.call_frame(opcode, index, value, opt);
        frame.begin_midi_batch();
        unsafe {
            let events = &*(ptr as *const VstEvents);
            for &event in events.events_raw() {
                if event.is_null() {
                    continue;
                }
                let byte_size = (*event).byteSize.max(0) as usize;
                let record =
                    slice::from_raw_parts(event as *const u8, EVENT_SIZE_PREFIX + byte_size);
                frame.push_midi_record(record);
            }
        }

        match self.roundtrip(&self.main, &mut frame) {
            Ok(()) => frame.call().value as isize,
            Err(err) => {
                bridge_error!("effProcessEvents failed: {err}");
                0
            }
        }
    }

    // The first response declares the total size; successive responses on
    // the same tag each carry at most CHUNK_BYTES of the payload.
    fn get_chunk(&self, opcode: i32, index: i32, value: isize, ptr: *mut c_void, opt: f32) -> isize {
        if ptr.is_null() {
            return 0;
        }

        let _guard = self.main.lock();
        let mut frame = self.call_frame(opcode, index, value, opt);
        let tag = match self.main.send_request(&mut frame) {
            Ok(tag) => tag,
            Err(err) => {
                bridge_error!("effGetChunk failed: {err}");
                return 0;
            }
        };
        if let Err(err) = self.main.wait(tag, &mut frame, self) {
            bridge_error!("effGetChunk failed: {err}");
            return 0;
        }

        let total = frame.call().value.max(0) as usize;
        let chunk = unsafe { &mut *self.chunk.get() };
        chunk.clear();
        chunk.resize(total, 0);

        let mut offset = 0;
        while offset < total {
            let data = frame.call_data();
            let step = data.len().min(total - offset);
            if step == 0 {
                bridge_error!("empty chunk frame at offset {offset} of {total}");
                return 0;
            }
            chunk[offset..offset + step].copy_from_slice(&data[..step]);
            offset += step;

            if offset < total {
                if let Err(err) = self.main.wait(tag, &mut frame, self) {
                    bridge_error!("effGetChunk failed at offset {offset}: {err}");
                    return 0;
                }
            }
        }

        unsafe { *(ptr as *mut *mut c_void) = chunk.as_mut_ptr() as *mut c_void };
        total as isize
    }

    // All request frames of one transfer share a single tag; the peer
    // responds once, after the final chunk.
    fn set_chunk(&self, opcode: i32, index: i32, value: isize, ptr: *mut c_void, opt: f32) -> isize {
        let total = value.max(0) as usize;
        if ptr.is_null() && total > 0 {
            return 0;
        }

        let _guard = self.main.lock();
        let mut frame = self.call_frame(opcode, index, value, opt);

        let bytes = if total == 0 {
            &[][..]
        } else {
            unsafe { slice::from_raw_parts(ptr as *const u8, total) }
        };

        let mut offset = 0;
        let mut tag = None;
        loop {
            let step = CHUNK_BYTES.min(total - offset);
            frame.set_call_data(&bytes[offset..offset + step]);

            let sent = match tag {
                None => {
                    let allocated = self.main.send_request(&mut frame);
                    tag = allocated.as_ref().ok().copied();
                    allocated.map(|_| ())
                }
                Some(_) => self.main.send(&frame),
            };
            if let Err(err) = sent {
                bridge_error!("effSetChunk failed at offset {offset}: {err}");
                return 0;
            }

            offset += step;
            if offset >= total {
                break;
            }
        }

        let tag = tag.expect("at least one chunk frame is always sent");
        match self.main.wait(tag, &mut frame, self) {
            Ok(()) => frame.call().value as isize,
            Err(err) => {
                bridge_error!("effSetChunk failed: {err}");
                0
            }
        }
    }
}
