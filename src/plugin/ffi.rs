//! C ABI structures for the plugin standard that `lv2_raw` does not cover:
//! descriptor table, worker extension, options, state and inline display.
//! Layouts match the reference headers (lv2core/lv2.h, worker/worker.h,
//! options/options.h, state/state.h).

use std::ffi::{c_char, c_void};

use crate::urid::Urid;

// ── Core descriptor ──

pub const LV2_DESCRIPTOR_SYMBOL: &std::ffi::CStr = c"lv2_descriptor";

#[allow(non_camel_case_types)]
pub type LV2_Handle = *mut c_void;

#[repr(C)]
pub struct LV2Descriptor {
    pub uri: *const c_char,
    pub instantiate: unsafe extern "C" fn(
        descriptor: *const LV2Descriptor,
        sample_rate: f64,
        bundle_path: *const c_char,
        features: *const *const lv2_raw::core::LV2Feature,
    ) -> LV2_Handle,
    pub connect_port: unsafe extern "C" fn(instance: LV2_Handle, port: u32, data_location: *mut c_void),
    pub activate: Option<unsafe extern "C" fn(instance: LV2_Handle)>,
    pub run: unsafe extern "C" fn(instance: LV2_Handle, sample_count: u32),
    pub deactivate: Option<unsafe extern "C" fn(instance: LV2_Handle)>,
    pub cleanup: unsafe extern "C" fn(instance: LV2_Handle),
    pub extension_data: Option<unsafe extern "C" fn(uri: *const c_char) -> *const c_void>,
}

/// `lv2_descriptor` entry point resolved from the shared object.
#[allow(non_camel_case_types)]
pub type LV2_Descriptor_Function = unsafe extern "C" fn(index: u32) -> *const LV2Descriptor;

// ── Worker extension ──

pub const LV2_WORKER_SCHEDULE_URI: &std::ffi::CStr = c"http://lv2plug.in/ns/ext/worker#schedule";
pub const LV2_WORKER_INTERFACE_URI: &std::ffi::CStr = c"http://lv2plug.in/ns/ext/worker#interface";

#[allow(non_camel_case_types)]
pub type LV2_Worker_Status = u32;
pub const LV2_WORKER_SUCCESS: LV2_Worker_Status = 0;
pub const LV2_WORKER_ERR_UNKNOWN: LV2_Worker_Status = 1;
pub const LV2_WORKER_ERR_NO_SPACE: LV2_Worker_Status = 2;

#[allow(non_camel_case_types)]
pub type LV2_Worker_Respond_Handle = *mut c_void;
#[allow(non_camel_case_types)]
pub type LV2_Worker_Respond_Function = unsafe extern "C" fn(
    handle: LV2_Worker_Respond_Handle,
    size: u32,
    data: *const c_void,
) -> LV2_Worker_Status;

#[allow(non_camel_case_types)]
pub type LV2_Worker_Schedule_Handle = *mut c_void;

/// The host-provided feature struct passed to the plugin.
#[repr(C)]
#[allow(non_camel_case_types)]
pub struct LV2_Worker_Schedule {
    pub handle: LV2_Worker_Schedule_Handle,
    pub schedule_work: unsafe extern "C" fn(
        handle: LV2_Worker_Schedule_Handle,
        size: u32,
        data: *const c_void,
    ) -> LV2_Worker_Status,
}

/// Plugin-provided interface retrieved via `extension_data`.
#[repr(C)]
#[allow(non_camel_case_types)]
pub struct LV2_Worker_Interface {
    pub work: unsafe extern "C" fn(
        instance: LV2_Handle,
        respond: LV2_Worker_Respond_Function,
        handle: LV2_Worker_Respond_Handle,
        size: u32,
        data: *const c_void,
    ) -> LV2_Worker_Status,
    pub work_response: unsafe extern "C" fn(
        instance: LV2_Handle,
        size: u32,
        body: *const c_void,
    ) -> LV2_Worker_Status,
    pub end_run: Option<unsafe extern "C" fn(instance: LV2_Handle) -> LV2_Worker_Status>,
}

// ── Options ──

pub const LV2_OPTIONS_URI: &std::ffi::CStr = c"http://lv2plug.in/ns/ext/options#options";

#[repr(C)]
#[allow(non_camel_case_types)]
pub struct LV2_Options_Option {
    /// 0 = instance context.
    pub context: u32,
    pub subject: u32,
    pub key: Urid,
    pub size: u32,
    pub type_: Urid,
    pub value: *const c_void,
}

// ── State extension ──

pub const LV2_STATE_INTERFACE_URI: &std::ffi::CStr = c"http://lv2plug.in/ns/ext/state#interface";
pub const LV2_STATE_THREAD_SAFE_RESTORE_URI: &std::ffi::CStr =
    c"http://lv2plug.in/ns/ext/state#threadSafeRestore";

#[allow(non_camel_case_types)]
pub type LV2_State_Handle = *mut c_void;
#[allow(non_camel_case_types)]
pub type LV2_State_Status = u32;
pub const LV2_STATE_SUCCESS: LV2_State_Status = 0;
pub const LV2_STATE_ERR_UNKNOWN: LV2_State_Status = 1;

/// Values must be POD and portable across instances.
pub const LV2_STATE_IS_POD: u32 = 1;
pub const LV2_STATE_IS_PORTABLE: u32 = 2;

#[allow(non_camel_case_types)]
pub type LV2_State_Store_Function = unsafe extern "C" fn(
    handle: LV2_State_Handle,
    key: u32,
    value: *const c_void,
    size: usize,
    type_: u32,
    flags: u32,
) -> LV2_State_Status;

#[allow(non_camel_case_types)]
pub type LV2_State_Retrieve_Function = unsafe extern "C" fn(
    handle: LV2_State_Handle,
    key: u32,
    size: *mut usize,
    type_: *mut u32,
    flags: *mut u32,
) -> *const c_void;

#[repr(C)]
#[allow(non_camel_case_types)]
pub struct LV2_State_Interface {
    pub save: unsafe extern "C" fn(
        instance: LV2_Handle,
        store: LV2_State_Store_Function,
        handle: LV2_State_Handle,
        flags: u32,
        features: *const *const lv2_raw::core::LV2Feature,
    ) -> LV2_State_Status,
    pub restore: unsafe extern "C" fn(
        instance: LV2_Handle,
        retrieve: LV2_State_Retrieve_Function,
        handle: LV2_State_Handle,
        flags: u32,
        features: *const *const lv2_raw::core::LV2Feature,
    ) -> LV2_State_Status,
}

// ── Inline display (idisp) ──

pub const LV2_INLINE_DISPLAY_URI: &std::ffi::CStr =
    c"http://harrisonconsoles.com/lv2/inlinedisplay#queue_draw";
pub const LV2_INLINE_DISPLAY_INTERFACE_URI: &std::ffi::CStr =
    c"http://harrisonconsoles.com/lv2/inlinedisplay#interface";

#[repr(C)]
#[allow(non_camel_case_types)]
pub struct LV2_Inline_Display_Image_Surface {
    /// ARGB32 pixels, `stride` bytes per row.
    pub data: *mut u8,
    pub width: i32,
    pub height: i32,
    pub stride: i32,
}

#[repr(C)]
#[allow(non_camel_case_types)]
pub struct LV2_Inline_Display {
    pub handle: *mut c_void,
    pub queue_draw: unsafe extern "C" fn(handle: *mut c_void),
}

#[repr(C)]
#[allow(non_camel_case_types)]
pub struct LV2_Inline_Display_Interface {
    pub render: unsafe extern "C" fn(
        instance: LV2_Handle,
        w: u32,
        h: u32,
    ) -> *mut LV2_Inline_Display_Image_Surface,
}
