//! Structures and constants for interfacing with the VST 2.4 ABI.
//!
//! This is the surface the shim presents to the DAW and the host agent
//! consumes from the real plugin. Everything here is `#[repr(C)]` and
//! bit-exact with the third-party specification; the bridge only forwards
//! these values and never interprets them beyond what marshalling requires.

use std::os::raw::{c_char, c_void};

/// VST plugins are identified by this magic number in [`AEffect::magic`].
/// Corresponds to `'VstP'`.
pub const EFFECT_MAGIC: i32 =
    (b'V' as i32) << 24 | (b's' as i32) << 16 | (b't' as i32) << 8 | b'P' as i32;

/// The VST version the shim reports through `effGetVstVersion`.
pub const VST_VERSION: i32 = 2400;

pub const MAX_PROG_NAME_LEN: usize = 24;
pub const MAX_PARAM_STR_LEN: usize = 8;
pub const MAX_LABEL_LEN: usize = 64;
pub const MAX_SHORT_LABEL_LEN: usize = 8;
pub const MAX_CATEG_LABEL_LEN: usize = 24;
pub const MAX_EFFECT_NAME_LEN: usize = 32;
pub const MAX_VENDOR_STR_LEN: usize = 64;
pub const MAX_PRODUCT_STR_LEN: usize = 64;

/// Host to plug-in dispatcher function.
pub type DispatcherProc = unsafe extern "C" fn(
    effect: *mut AEffect,
    opcode: i32,
    index: i32,
    value: isize,
    ptr: *mut c_void,
    opt: f32,
) -> isize;

/// Plug-in to host callback function, passed to `VSTPluginMain`.
pub type AudioMasterCallback = unsafe extern "C" fn(
    effect: *mut AEffect,
    opcode: i32,
    index: i32,
    value: isize,
    ptr: *mut c_void,
    opt: f32,
) -> isize;

/// 32 bit floating point block processing function.
pub type ProcessProc = unsafe extern "C" fn(
    effect: *mut AEffect,
    inputs: *const *const f32,
    outputs: *mut *mut f32,
    sample_frames: i32,
);

/// 64 bit floating point block processing function.
pub type ProcessDoubleProc = unsafe extern "C" fn(
    effect: *mut AEffect,
    inputs: *const *const f64,
    outputs: *mut *mut f64,
    sample_frames: i32,
);

pub type SetParameterProc = unsafe extern "C" fn(effect: *mut AEffect, index: i32, value: f32);
pub type GetParameterProc = unsafe extern "C" fn(effect: *mut AEffect, index: i32) -> f32;

/// The signature of a plugin library's `VSTPluginMain` (or legacy `main`)
/// entry point.
pub type PluginMainProc =
    unsafe extern "C" fn(audio_master: Option<AudioMasterCallback>) -> *mut AEffect;

/// The plugin descriptor exchanged between host and plugin. The function
/// pointers are nullable on the wire of the ABI itself; a `None` entry tells
/// the host the capability is absent.
#[allow(non_snake_case)]
#[repr(C)]
pub struct AEffect {
    /// Must be [`EFFECT_MAGIC`].
    pub magic: i32,

    pub dispatcher: Option<DispatcherProc>,
    /// Accumulating process, deprecated in VST 2.4.
    pub process: Option<ProcessProc>,
    pub setParameter: Option<SetParameterProc>,
    pub getParameter: Option<GetParameterProc>,

    pub numPrograms: i32,
    pub numParams: i32,
    pub numInputs: i32,
    pub numOutputs: i32,

    /// Bitmask, see [`PluginFlags`].
    pub flags: i32,

    /// Reserved for the host, must be 0.
    pub resvd1: isize,
    /// Reserved for the host, must be 0.
    pub resvd2: isize,

    /// Group delay / latency in samples.
    pub initialDelay: i32,

    pub realQualities: i32,
    pub offQualities: i32,
    pub ioRatio: f32,

    /// Object pointer, owned by whoever built this struct.
    pub object: *mut c_void,
    /// User defined pointer.
    pub user: *mut c_void,

    pub uniqueID: i32,
    pub version: i32,

    pub processReplacing: Option<ProcessProc>,
    pub processDoubleReplacing: Option<ProcessDoubleProc>,

    /// Reserved for future use, zeroed.
    pub future: [u8; 56],
}

bitflags::bitflags! {
    /// Values for [`AEffect::flags`].
    pub struct PluginFlags: i32 {
        /// Plugin has an editor.
        const HAS_EDITOR = 1 << 0;
        /// Plugin can process 32 bit audio, mandatory in VST 2.4.
        const CAN_REPLACING = 1 << 4;
        /// Preset data is handled in formatless chunks.
        const PROGRAM_CHUNKS = 1 << 5;
        /// Plugin is a synth.
        const IS_SYNTH = 1 << 8;
        /// Plugin does not produce sound when all input is silence.
        const NO_SOUND_IN_STOP = 1 << 9;
        /// Supports 64 bit audio processing.
        const CAN_DOUBLE_REPLACING = 1 << 12;
    }
}

/// Editor rectangle returned through `effEditGetRect`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ERect {
    pub top: i16,
    pub left: i16,
    pub bottom: i16,
    pub right: i16,
}

/// Pin properties returned through `effGetInputProperties` /
/// `effGetOutputProperties`.
#[allow(non_snake_case)]
#[repr(C)]
pub struct VstPinProperties {
    pub label: [c_char; MAX_LABEL_LEN],
    pub flags: i32,
    pub arrangementType: i32,
    pub shortLabel: [c_char; MAX_SHORT_LABEL_LEN],
    pub future: [u8; 48],
}

/// Parameter properties returned through `effGetParameterProperties`.
#[allow(non_snake_case)]
#[repr(C)]
pub struct VstParameterProperties {
    pub stepFloat: f32,
    pub smallStepFloat: f32,
    pub largeStepFloat: f32,
    pub label: [c_char; MAX_LABEL_LEN],
    pub flags: i32,
    pub minInteger: i32,
    pub maxInteger: i32,
    pub stepInteger: i32,
    pub largeStepInteger: i32,
    pub shortLabel: [c_char; MAX_SHORT_LABEL_LEN],
    pub displayIndex: i16,
    pub category: i16,
    pub numParametersInCategory: i16,
    pub reserved: i16,
    pub categoryLabel: [c_char; MAX_CATEG_LABEL_LEN],
    pub future: [u8; 16],
}

/// MIDI key name returned through `effGetMidiKeyName`.
#[allow(non_snake_case)]
#[repr(C)]
pub struct MidiKeyName {
    pub thisProgramIndex: i32,
    pub thisKeyNumber: i32,
    pub keyName: [c_char; MAX_LABEL_LEN],
    pub reserved: i32,
    pub flags: i32,
}

/// One speaker of a [`VstSpeakerArrangement`].
#[allow(non_snake_case)]
#[repr(C)]
pub struct VstSpeakerProperties {
    pub azimuth: f32,
    pub elevation: f32,
    pub radius: f32,
    pub reserved: f32,
    pub name: [c_char; MAX_LABEL_LEN],
    pub r#type: i32,
    pub future: [u8; 28],
}

/// Speaker arrangement exchanged through `effSetSpeakerArrangement`. The ABI
/// declares a nominal 8 entry array; the meaningful prefix is `numChannels`
/// entries and that is all the bridge puts on the wire.
#[allow(non_snake_case)]
#[repr(C)]
pub struct VstSpeakerArrangement {
    pub r#type: i32,
    pub numChannels: i32,
    pub speakers: [VstSpeakerProperties; 8],
}

/// The fixed-size header shared by the speaker arrangement variants: the
/// `type` and `numChannels` fields preceding the speaker array.
pub const SPEAKER_ARRANGEMENT_HEADER: usize = 8;

/// Time info returned by the host through `audioMasterGetTime`.
#[allow(non_snake_case)]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VstTimeInfo {
    pub samplePos: f64,
    pub sampleRate: f64,
    pub nanoSeconds: f64,
    pub ppqPos: f64,
    pub tempo: f64,
    pub barStartPos: f64,
    pub cycleStartPos: f64,
    pub cycleEndPos: f64,
    pub timeSigNumerator: i32,
    pub timeSigDenominator: i32,
    pub smpteOffset: i32,
    pub smpteFrameRate: i32,
    pub samplesToNextClock: i32,
    pub flags: i32,
}

/// A generic VST event. `byteSize` counts the bytes following the `type` and
/// `byteSize` fields, so a full event record occupies `8 + byteSize` bytes.
#[allow(non_snake_case)]
#[repr(C)]
#[derive(Clone, Copy)]
pub struct VstEvent {
    pub r#type: i32,
    pub byteSize: i32,
    pub deltaFrames: i32,
    pub flags: i32,
    pub data: [u8; 16],
}

/// The number of bytes of a [`VstEvent`] not counted by its `byteSize` field.
pub const EVENT_SIZE_PREFIX: usize = 8;

pub const EVENT_TYPE_MIDI: i32 = 1;
pub const EVENT_TYPE_SYSEX: i32 = 6;

/// A MIDI event, `type == EVENT_TYPE_MIDI`.
#[allow(non_snake_case)]
#[repr(C)]
#[derive(Clone, Copy)]
pub struct VstMidiEvent {
    pub r#type: i32,
    pub byteSize: i32,
    pub deltaFrames: i32,
    pub flags: i32,
    pub noteLength: i32,
    pub noteOffset: i32,
    pub midiData: [u8; 3],
    pub midiReserved: u8,
    pub detune: i8,
    pub noteOffVelocity: u8,
    pub reserved1: u8,
    pub reserved2: u8,
}

/// The event batch passed through `effProcessEvents` and
/// `audioMasterProcessEvents`: a counted array of pointers to variable-length
/// event records. The nominal array size is 2; larger batches over-allocate
/// the trailing array exactly like the C ABI does.
#[allow(non_snake_case)]
#[repr(C)]
pub struct VstEvents {
    pub numEvents: i32,
    pub reserved: isize,
    pub events: [*mut VstEvent; 2],
}

impl VstEvents {
    /// View the pointer array at its declared length.
    ///
    /// # Safety
    ///
    /// `numEvents` must describe the actual allocation, as the ABI requires.
    pub unsafe fn events_raw(&self) -> &[*mut VstEvent] {
        std::slice::from_raw_parts(self.events.as_ptr(), self.numEvents as usize)
    }
}

/// Scratch storage for a [`VstEvents`] batch with more than the nominal two
/// entries. The backing array is pointer-sized slots, which lines up with the
/// `{numEvents, reserved, events[]}` layout on both 32 and 64 bit targets;
/// the first slot holds the count, the second the reserved field.
pub struct EventsBuffer {
    storage: Vec<*mut VstEvent>,
}

impl EventsBuffer {
    pub fn from_pointers(pointers: &[*mut VstEvent]) -> Self {
        let mut storage = Vec::with_capacity(pointers.len() + 2);
        storage.push(pointers.len() as *mut VstEvent);
        storage.push(std::ptr::null_mut());
        storage.extend_from_slice(pointers);
        Self { storage }
    }

    /// The batch in the shape the ABI expects. Valid for as long as this
    /// buffer and the pointed-to records are.
    pub fn as_events(&mut self) -> *mut VstEvents {
        self.storage.as_mut_ptr() as *mut VstEvents
    }
}

/// Plugin-side opcodes, passed to [`AEffect::dispatcher`]. Identifiers are
/// reused from the third-party specification unchanged.
pub mod effect_opcodes {
    pub const OPEN: i32 = 0;
    pub const CLOSE: i32 = 1;
    pub const SET_PROGRAM: i32 = 2;
    pub const GET_PROGRAM: i32 = 3;
    pub const SET_PROGRAM_NAME: i32 = 4;
    pub const GET_PROGRAM_NAME: i32 = 5;
    pub const GET_PARAM_LABEL: i32 = 6;
    pub const GET_PARAM_DISPLAY: i32 = 7;
    pub const GET_PARAM_NAME: i32 = 8;
    pub const SET_SAMPLE_RATE: i32 = 10;
    pub const SET_BLOCK_SIZE: i32 = 11;
    pub const MAINS_CHANGED: i32 = 12;
    pub const EDIT_GET_RECT: i32 = 13;
    pub const EDIT_OPEN: i32 = 14;
    pub const EDIT_CLOSE: i32 = 15;
    pub const EDIT_IDLE: i32 = 19;
    pub const GET_CHUNK: i32 = 23;
    pub const SET_CHUNK: i32 = 24;
    pub const PROCESS_EVENTS: i32 = 25;
    pub const CAN_BE_AUTOMATED: i32 = 26;
    pub const GET_PROGRAM_NAME_INDEXED: i32 = 29;
    pub const CONNECT_INPUT_DEPRECATED: i32 = 31;
    pub const CONNECT_OUTPUT_DEPRECATED: i32 = 32;
    pub const GET_INPUT_PROPERTIES: i32 = 33;
    pub const GET_OUTPUT_PROPERTIES: i32 = 34;
    pub const GET_PLUG_CATEGORY: i32 = 35;
    pub const SET_SPEAKER_ARRANGEMENT: i32 = 42;
    pub const GET_EFFECT_NAME: i32 = 45;
    pub const GET_VENDOR_STRING: i32 = 47;
    pub const GET_PRODUCT_STRING: i32 = 48;
    pub const GET_VENDOR_VERSION: i32 = 49;
    pub const VENDOR_SPECIFIC: i32 = 50;
    pub const CAN_DO: i32 = 51;
    pub const GET_TAIL_SIZE: i32 = 52;
    pub const IDLE_DEPRECATED: i32 = 53;
    pub const GET_PARAMETER_PROPERTIES: i32 = 56;
    pub const GET_VST_VERSION: i32 = 58;
    pub const EDIT_KEY_DOWN: i32 = 59;
    pub const EDIT_KEY_UP: i32 = 60;
    pub const SET_EDIT_KNOB_MODE: i32 = 61;
    pub const GET_MIDI_KEY_NAME: i32 = 66;
    pub const BEGIN_SET_PROGRAM: i32 = 67;
    pub const END_SET_PROGRAM: i32 = 68;
    pub const START_PROCESS: i32 = 71;
    pub const STOP_PROCESS: i32 = 72;
    pub const SET_TOTAL_SAMPLE_TO_PROCESS: i32 = 73;
    pub const SET_PAN_LAW: i32 = 74;
    pub const BEGIN_LOAD_BANK: i32 = 75;
    pub const SET_PROCESS_PRECISION: i32 = 77;
    pub const GET_NUM_MIDI_INPUT_CHANNELS: i32 = 78;
    pub const GET_NUM_MIDI_OUTPUT_CHANNELS: i32 = 79;
}

/// Host-side opcodes, passed to the [`AudioMasterCallback`].
pub mod host_opcodes {
    pub const AUTOMATE: i32 = 0;
    pub const VERSION: i32 = 1;
    pub const CURRENT_ID: i32 = 2;
    pub const IDLE: i32 = 3;
    pub const PIN_CONNECTED_DEPRECATED: i32 = 4;
    pub const WANT_MIDI_DEPRECATED: i32 = 6;
    pub const GET_TIME: i32 = 7;
    pub const PROCESS_EVENTS: i32 = 8;
    pub const TEMPO_AT_DEPRECATED: i32 = 10;
    pub const IO_CHANGED: i32 = 13;
    pub const NEED_IDLE_DEPRECATED: i32 = 14;
    pub const SIZE_WINDOW: i32 = 15;
    pub const GET_SAMPLE_RATE: i32 = 16;
    pub const GET_BLOCK_SIZE: i32 = 17;
    pub const GET_INPUT_LATENCY: i32 = 18;
    pub const GET_OUTPUT_LATENCY: i32 = 19;
    pub const GET_CURRENT_PROCESS_LEVEL: i32 = 23;
    pub const GET_AUTOMATION_STATE: i32 = 24;
    pub const GET_VENDOR_STRING: i32 = 32;
    pub const GET_PRODUCT_STRING: i32 = 33;
    pub const GET_VENDOR_VERSION: i32 = 34;
    pub const CAN_DO: i32 = 37;
    pub const UPDATE_DISPLAY: i32 = 42;
    pub const BEGIN_EDIT: i32 = 43;
    pub const END_EDIT: i32 = 44;
    pub const OPEN_FILE_SELECTOR: i32 = 45;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;
    use std::os::raw::c_void;

    #[test]
    fn effect_magic_spells_vstp() {
        assert_eq!(EFFECT_MAGIC, 0x5673_7450);
    }

    #[test]
    fn abi_struct_sizes() {
        // These sizes are fixed by the third-party specification; a mismatch
        // means the bridge would be exchanging garbage with real binaries.
        assert_eq!(mem::size_of::<ERect>(), 8);
        assert_eq!(mem::size_of::<VstPinProperties>(), 128);
        assert_eq!(mem::size_of::<VstMidiEvent>(), 32);
        assert_eq!(mem::size_of::<VstEvent>(), 32);
        assert_eq!(mem::size_of::<VstTimeInfo>(), 88);
        assert_eq!(
            mem::size_of::<VstSpeakerArrangement>(),
            SPEAKER_ARRANGEMENT_HEADER + 8 * mem::size_of::<VstSpeakerProperties>()
        );
        assert_eq!(mem::size_of::<VstSpeakerProperties>(), 112);
    }

    #[test]
    fn midi_event_record_length_matches_byte_size_convention() {
        // A packed record is `8 + byteSize` bytes, so a correctly formed MIDI
        // event declares its own struct size minus the two leading fields.
        assert_eq!(
            mem::size_of::<VstMidiEvent>() - EVENT_SIZE_PREFIX,
            24
        );
    }

    #[test]
    fn null_capability_is_null_pointer() {
        // Capability nulling in the shim stores `None` into the descriptor's
        // function pointer slots; the host must observe an actual null.
        let none: Option<GetParameterProc> = None;
        let as_ptr: *const c_void = unsafe { mem::transmute(none) };
        assert!(as_ptr.is_null());
    }
}
