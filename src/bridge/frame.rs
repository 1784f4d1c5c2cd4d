//! The wire format: one fixed-capacity frame per channel message.
//!
//! A frame starts with a little-endian `{tag: u32, cmd: u32}` header followed
//! by a payload whose layout is selected by `cmd`. The frame's total length is
//! the channel message length; variable-size payloads use the trailing bytes
//! with no explicit length field of their own.

use std::alloc::{self, Layout};
use std::mem;
use std::ops::Range;
use std::slice;

use super::{BridgeError, BridgeResult};

/// The `{tag, cmd}` prefix of every frame.
pub const HEADER_LEN: usize = 8;

/// Maximum payload bytes in one frame. Sized for a double precision block of
/// 2048 frames across 8 channels plus the audio payload header, while staying
/// under the default unix-socket buffer limits so a full frame is always a
/// single deliverable message.
pub const MAX_PAYLOAD: usize = 128 * 1024 + 64;

/// Total capacity of a frame's backing buffer.
pub const FRAME_CAPACITY: usize = HEADER_LEN + MAX_PAYLOAD;

/// How many payload bytes a single frame of a chunked transfer carries. A
/// `get`/`set` chunk larger than this spans multiple frames sharing one tag.
pub const CHUNK_BYTES: usize = 64 * 1024;

/// The command kind of a frame. This is a closed set; values outside it are
/// answered with [`BridgeError::UnknownCmd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Cmd {
    /// Handshake. The shim's request carries no payload, the host agent's
    /// response carries the initial [`PluginData`]. Always tag 0.
    PluginMain = 0,
    /// Unsolicited descriptor update, host agent to shim. Always tag 0.
    PluginData = 1,
    /// A forward call on the plugin's dispatcher, shim to host agent.
    EffectDispatch = 2,
    /// A forward call on the host callback, host agent to shim.
    AudioMasterCallback = 3,
    GetParameter = 4,
    /// Fire-and-forget: a tag is allocated but the peer never responds.
    SetParameter = 5,
    /// Single precision audio block on the realtime context.
    Process = 6,
    /// Double precision audio block on the realtime context.
    ProcessDouble = 7,
    /// Make the editor window visible.
    ShowWindow = 8,
    /// Fire-and-forget realtime scheduling hint for the peer's audio thread.
    SetSchedParam = 9,
}

impl TryFrom<u32> for Cmd {
    type Error = BridgeError;

    fn try_from(value: u32) -> BridgeResult<Self> {
        match value {
            0 => Ok(Cmd::PluginMain),
            1 => Ok(Cmd::PluginData),
            2 => Ok(Cmd::EffectDispatch),
            3 => Ok(Cmd::AudioMasterCallback),
            4 => Ok(Cmd::GetParameter),
            5 => Ok(Cmd::SetParameter),
            6 => Ok(Cmd::Process),
            7 => Ok(Cmd::ProcessDouble),
            8 => Ok(Cmd::ShowWindow),
            9 => Ok(Cmd::SetSchedParam),
            other => Err(BridgeError::UnknownCmd(other)),
        }
    }
}

/// Payload of [`Cmd::EffectDispatch`] and [`Cmd::AudioMasterCallback`]:
/// the dispatcher argument tuple. `value` is fixed at 64 bits on the wire so
/// both word sizes agree on the layout; trailing data bytes follow directly
/// after this header for the opcodes that use them.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CallRequest {
    pub opcode: i32,
    pub index: i32,
    pub value: i64,
    pub opt: f32,
    _pad: u32,
}

/// Fixed part of a call payload preceding its data slot.
pub const CALL_HEADER: usize = mem::size_of::<CallRequest>();

/// Payload of [`Cmd::GetParameter`] / [`Cmd::SetParameter`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ParameterRequest {
    pub index: i32,
    pub value: f32,
}

pub const PARAMETER_LEN: usize = mem::size_of::<ParameterRequest>();

/// Fixed part of an audio payload: the frame count, followed by
/// channel-major samples.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct AudioHeader {
    pub nframes: u32,
    _pad: u32,
}

pub const AUDIO_HEADER: usize = mem::size_of::<AudioHeader>();

/// Fixed part of a MIDI batch in a call payload's data slot: the event
/// count, followed by densely packed event records.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MidiBatchHeader {
    pub count: u32,
    _pad: u32,
}

pub const MIDI_BATCH_HEADER: usize = mem::size_of::<MidiBatchHeader>();

/// The number of leading bytes of an event record not counted by its
/// `byteSize` field, i.e. the `type` and `byteSize` fields themselves.
pub const MIDI_RECORD_PREFIX: usize = 8;

/// Payload of [`Cmd::SetSchedParam`]: POSIX scheduling values for the peer's
/// realtime thread.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedParam {
    pub policy: i32,
    pub priority: i32,
}

pub const SCHED_PARAM_LEN: usize = mem::size_of::<SchedParam>();

/// Snapshot of the mutable descriptor fields of the bridged plugin, exchanged
/// in the handshake and in unsolicited [`Cmd::PluginData`] pushes. A false
/// capability boolean makes the shim null out the corresponding descriptor
/// function pointer.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PluginData {
    pub has_set_parameter: bool,
    pub has_get_parameter: bool,
    pub has_process_replacing: bool,
    pub has_process_double_replacing: bool,
    pub num_programs: i32,
    pub num_params: i32,
    pub num_inputs: i32,
    pub num_outputs: i32,
    pub flags: i32,
    pub initial_delay: i32,
    pub unique_id: i32,
    pub version: i32,
}

pub const PLUGIN_DATA_LEN: usize = mem::size_of::<PluginData>();

// The payload views below cast into this buffer at fixed offsets, so it must
// be at least as aligned as the widest field they contain.
#[repr(C, align(8))]
struct FrameBuf([u8; FRAME_CAPACITY]);

/// A single message on the bridge channel, used for both requests and
/// responses. The backing buffer lives on the heap; moving a `Frame` in and
/// out of a pending queue moves only the box.
pub struct Frame {
    /// Total message length, header included.
    len: usize,
    buf: Box<FrameBuf>,
}

impl Frame {
    /// An empty frame with a zeroed header. Allocates the backing buffer;
    /// this is the one allocation the realtime path is allowed to make.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        // alloc_zeroed so untouched payload bytes read back as zero instead
        // of leaking heap contents to the peer. Zero pages also keep the
        // allocation cheap compared to a memset through `Box::new`.
        let layout = Layout::new::<FrameBuf>();
        let buf = unsafe {
            let ptr = alloc::alloc_zeroed(layout) as *mut FrameBuf;
            if ptr.is_null() {
                alloc::handle_alloc_error(layout);
            }
            Box::from_raw(ptr)
        };

        Self {
            len: HEADER_LEN,
            buf,
        }
    }

    /// A fresh request frame for `cmd` with tag 0 and an empty payload.
    pub fn request(cmd: Cmd) -> Self {
        let mut frame = Self::new();
        frame.set_cmd(cmd);
        frame
    }

    pub fn tag(&self) -> u32 {
        u32::from_le_bytes(self.buf.0[0..4].try_into().unwrap())
    }

    pub fn set_tag(&mut self, tag: u32) {
        self.buf.0[0..4].copy_from_slice(&tag.to_le_bytes());
    }

    pub fn raw_cmd(&self) -> u32 {
        u32::from_le_bytes(self.buf.0[4..8].try_into().unwrap())
    }

    pub fn cmd(&self) -> BridgeResult<Cmd> {
        Cmd::try_from(self.raw_cmd())
    }

    pub fn set_cmd(&mut self, cmd: Cmd) {
        self.buf.0[4..8].copy_from_slice(&(cmd as u32).to_le_bytes());
    }

    /// Total message length, header included.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len <= HEADER_LEN
    }

    pub fn payload_len(&self) -> usize {
        self.len - HEADER_LEN
    }

    pub fn set_payload_len(&mut self, len: usize) {
        assert!(len <= MAX_PAYLOAD, "frame payload overflow: {len}");
        self.len = HEADER_LEN + len;
    }

    /// The bytes to put on the wire.
    pub fn bytes(&self) -> &[u8] {
        &self.buf.0[..self.len]
    }

    /// The whole backing buffer, for the channel to read a message into.
    /// After a successful read the channel records the message length through
    /// [`Frame::commit_read`].
    pub(crate) fn recv_buf(&mut self) -> &mut [u8] {
        &mut self.buf.0
    }

    pub(crate) fn commit_read(&mut self, len: usize) -> BridgeResult<()> {
        if len < HEADER_LEN {
            return Err(BridgeError::BadFrame("message shorter than its header"));
        }
        self.len = len;
        Ok(())
    }

    fn payload(&self) -> &[u8] {
        &self.buf.0[HEADER_LEN..self.len]
    }

    fn payload_ptr(&self) -> *const u8 {
        unsafe { self.buf.0.as_ptr().add(HEADER_LEN) }
    }

    fn payload_ptr_mut(&mut self) -> *mut u8 {
        unsafe { self.buf.0.as_mut_ptr().add(HEADER_LEN) }
    }

    fn ensure_payload(&mut self, len: usize) {
        if self.payload_len() < len {
            self.set_payload_len(len);
        }
    }

    // Typed payload views. The buffer is 8-byte aligned and the view structs
    // are `#[repr(C)]` with no padding requirements beyond that, so the casts
    // below are always in bounds and aligned.

    pub fn call(&self) -> &CallRequest {
        bridge_debug_assert!(self.payload_len() >= CALL_HEADER);
        unsafe { &*(self.payload_ptr() as *const CallRequest) }
    }

    pub fn call_mut(&mut self) -> &mut CallRequest {
        self.ensure_payload(CALL_HEADER);
        unsafe { &mut *(self.payload_ptr_mut() as *mut CallRequest) }
    }

    /// The trailing data bytes of a call payload.
    pub fn call_data(&self) -> &[u8] {
        &self.payload()[CALL_HEADER.min(self.payload_len())..]
    }

    /// Replace the call payload's data slot, adjusting the frame length.
    pub fn set_call_data(&mut self, data: &[u8]) {
        self.set_payload_len(CALL_HEADER + data.len());
        let offset = HEADER_LEN + CALL_HEADER;
        self.buf.0[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Shrink the call payload to just its fixed header.
    pub fn clear_call_data(&mut self) {
        self.set_payload_len(CALL_HEADER);
    }

    /// A writable data slot of `len` bytes following the call header.
    pub fn call_data_mut(&mut self, len: usize) -> &mut [u8] {
        self.set_payload_len(CALL_HEADER + len);
        let offset = HEADER_LEN + CALL_HEADER;
        &mut self.buf.0[offset..offset + len]
    }

    pub fn param(&self) -> &ParameterRequest {
        bridge_debug_assert!(self.payload_len() >= PARAMETER_LEN);
        unsafe { &*(self.payload_ptr() as *const ParameterRequest) }
    }

    pub fn param_mut(&mut self) -> &mut ParameterRequest {
        self.ensure_payload(PARAMETER_LEN);
        unsafe { &mut *(self.payload_ptr_mut() as *mut ParameterRequest) }
    }

    pub fn audio(&self) -> &AudioHeader {
        bridge_debug_assert!(self.payload_len() >= AUDIO_HEADER);
        unsafe { &*(self.payload_ptr() as *const AudioHeader) }
    }

    pub fn set_nframes(&mut self, nframes: u32) {
        self.ensure_payload(AUDIO_HEADER);
        unsafe { (*(self.payload_ptr_mut() as *mut AudioHeader)).nframes = nframes };
    }

    /// The sample area of an audio payload as `count` single precision
    /// samples, channel-major.
    pub fn samples_f32(&self, count: usize) -> &[f32] {
        bridge_debug_assert!(self.payload_len() >= AUDIO_HEADER + count * mem::size_of::<f32>());
        unsafe { slice::from_raw_parts(self.payload_ptr().add(AUDIO_HEADER) as *const f32, count) }
    }

    /// A writable sample area for `count` single precision samples; sets the
    /// payload length accordingly.
    pub fn samples_f32_mut(&mut self, count: usize) -> &mut [f32] {
        self.set_payload_len(AUDIO_HEADER + count * mem::size_of::<f32>());
        unsafe {
            slice::from_raw_parts_mut(self.payload_ptr_mut().add(AUDIO_HEADER) as *mut f32, count)
        }
    }

    pub fn samples_f64(&self, count: usize) -> &[f64] {
        bridge_debug_assert!(self.payload_len() >= AUDIO_HEADER + count * mem::size_of::<f64>());
        unsafe { slice::from_raw_parts(self.payload_ptr().add(AUDIO_HEADER) as *const f64, count) }
    }

    pub fn samples_f64_mut(&mut self, count: usize) -> &mut [f64] {
        self.set_payload_len(AUDIO_HEADER + count * mem::size_of::<f64>());
        unsafe {
            slice::from_raw_parts_mut(self.payload_ptr_mut().add(AUDIO_HEADER) as *mut f64, count)
        }
    }

    pub fn plugin_data(&self) -> PluginData {
        bridge_debug_assert!(self.payload_len() >= PLUGIN_DATA_LEN);
        unsafe { *(self.payload_ptr() as *const PluginData) }
    }

    pub fn set_plugin_data(&mut self, data: &PluginData) {
        self.set_payload_len(PLUGIN_DATA_LEN);
        unsafe { *(self.payload_ptr_mut() as *mut PluginData) = *data };
    }

    pub fn sched(&self) -> SchedParam {
        bridge_debug_assert!(self.payload_len() >= SCHED_PARAM_LEN);
        unsafe { *(self.payload_ptr() as *const SchedParam) }
    }

    pub fn set_sched(&mut self, sched: SchedParam) {
        self.set_payload_len(SCHED_PARAM_LEN);
        unsafe { *(self.payload_ptr_mut() as *mut SchedParam) = sched };
    }

    // MIDI batches ride in a call payload's data slot: a count header
    // followed by densely packed records.

    /// Start an empty MIDI batch in the data slot.
    pub fn begin_midi_batch(&mut self) {
        self.set_payload_len(CALL_HEADER + MIDI_BATCH_HEADER);
        let offset = HEADER_LEN + CALL_HEADER;
        self.buf.0[offset..offset + MIDI_BATCH_HEADER].fill(0);
    }

    /// Append one event record to the MIDI batch and bump its count. The
    /// record must be a full event image, `8 + byteSize` bytes.
    pub fn push_midi_record(&mut self, record: &[u8]) {
        let end = self.len;
        self.set_payload_len(self.payload_len() + record.len());
        self.buf.0[end..end + record.len()].copy_from_slice(record);

        let count_offset = HEADER_LEN + CALL_HEADER;
        let count = u32::from_le_bytes(
            self.buf.0[count_offset..count_offset + 4].try_into().unwrap(),
        );
        self.buf.0[count_offset..count_offset + 4].copy_from_slice(&(count + 1).to_le_bytes());
    }

    /// The event count and packed record bytes of a MIDI batch payload.
    pub fn midi_batch(&self) -> (usize, &[u8]) {
        let data = self.call_data();
        if data.len() < MIDI_BATCH_HEADER {
            bridge_debug_assert_failure!("truncated MIDI batch payload");
            return (0, &[]);
        }

        let count = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        (count, &data[MIDI_BATCH_HEADER..])
    }
}

/// Walk `count` densely packed event records in `data`, yielding each
/// record's byte range. Stops early if a record's declared size runs past the
/// buffer, which can only happen with a corrupted or truncated frame.
pub fn walk_midi_records(data: &[u8], count: usize) -> Vec<Range<usize>> {
    let mut records = Vec::with_capacity(count);
    let mut offset = 0;

    for _ in 0..count {
        if offset + MIDI_RECORD_PREFIX > data.len() {
            bridge_debug_assert_failure!("MIDI batch count overruns its payload");
            break;
        }

        let byte_size =
            i32::from_le_bytes(data[offset + 4..offset + 8].try_into().unwrap()) as usize;
        let end = offset + MIDI_RECORD_PREFIX + byte_size;
        if end > data.len() {
            bridge_debug_assert_failure!("MIDI record overruns its payload");
            break;
        }

        records.push(offset..end);
        offset = end;
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_little_endian_at_fixed_offsets() {
        let mut frame = Frame::request(Cmd::EffectDispatch);
        frame.set_tag(0x0403_0201);

        let bytes = frame.bytes();
        assert_eq!(&bytes[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[4..8], &[Cmd::EffectDispatch as u8, 0, 0, 0]);
        assert_eq!(frame.tag(), 0x0403_0201);
        assert_eq!(frame.cmd().unwrap(), Cmd::EffectDispatch);
    }

    #[test]
    fn unknown_cmd_is_rejected() {
        let mut frame = Frame::new();
        frame.buf.0[4..8].copy_from_slice(&999u32.to_le_bytes());
        assert!(matches!(frame.cmd(), Err(BridgeError::UnknownCmd(999))));
    }

    #[test]
    fn call_payload_round_trip() {
        let mut frame = Frame::request(Cmd::EffectDispatch);
        {
            let call = frame.call_mut();
            call.opcode = 12;
            call.index = -1;
            call.value = 0x1_0000_0001;
            call.opt = 0.5;
        }
        frame.set_call_data(b"hello\0");

        assert_eq!(frame.payload_len(), CALL_HEADER + 6);
        assert_eq!(frame.call().opcode, 12);
        assert_eq!(frame.call().value, 0x1_0000_0001);
        assert_eq!(frame.call_data(), b"hello\0");
    }

    #[test]
    fn audio_payload_round_trip() {
        let mut frame = Frame::request(Cmd::Process);
        frame.set_nframes(4);
        frame
            .samples_f32_mut(8)
            .copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);

        assert_eq!(frame.audio().nframes, 4);
        assert_eq!(frame.payload_len(), AUDIO_HEADER + 8 * 4);
        assert_eq!(frame.samples_f32(8)[6], 7.0);
    }

    #[test]
    fn plugin_data_round_trip() {
        let data = PluginData {
            has_set_parameter: true,
            has_get_parameter: true,
            has_process_replacing: true,
            has_process_double_replacing: false,
            num_programs: 1,
            num_params: 4,
            num_inputs: 2,
            num_outputs: 2,
            flags: 0x10,
            initial_delay: 0,
            unique_id: 0x4142_4344,
            version: 0x0001_0000,
        };

        let mut frame = Frame::request(Cmd::PluginData);
        frame.set_plugin_data(&data);
        assert_eq!(frame.plugin_data(), data);
    }

    #[test]
    fn midi_batch_packs_and_walks() {
        let mut frame = Frame::request(Cmd::EffectDispatch);
        frame.begin_midi_batch();

        // Two records: 8 byte prefix + declared remainder
        let mut first = vec![0u8; 16];
        first[0..4].copy_from_slice(&1i32.to_le_bytes());
        first[4..8].copy_from_slice(&8i32.to_le_bytes());
        let mut second = vec![0u8; 32];
        second[0..4].copy_from_slice(&1i32.to_le_bytes());
        second[4..8].copy_from_slice(&24i32.to_le_bytes());

        frame.push_midi_record(&first);
        frame.push_midi_record(&second);

        let (count, records) = frame.midi_batch();
        assert_eq!(count, 2);

        let ranges = walk_midi_records(records, count);
        assert_eq!(ranges, vec![0..16, 16..48]);
    }

    #[test]
    fn midi_walk_stops_at_truncation() {
        let mut record = vec![0u8; 16];
        record[4..8].copy_from_slice(&100i32.to_le_bytes());
        assert!(walk_midi_records(&record, 1).is_empty());
        assert!(walk_midi_records(&record[..4], 1).is_empty());
    }

    #[test]
    fn chunk_constant_spans_frames() {
        // The chunk transfer logic assumes a chunk always fits one frame.
        assert!(CHUNK_BYTES + CALL_HEADER <= MAX_PAYLOAD);
    }
}
