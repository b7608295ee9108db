//! C bindings for frame channels
//!
//! The host owns a registry handle and passes it to every call that creates
//! or drops channels. Channel and frame pointers stay valid until
//! `fc_delete_block` / `fc_delete_frame` (or `fc_registry_free`).

use crate::channel::{Channel, Status, FRAMEWORK_DELETED, NO_NEW_FRAME, SUCCESS};
use crate::frame::{Frame, FrameShape};
use crate::registry::ChannelRegistry;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::slice;
use std::sync::Arc;
use tracing::error;

/// Read or write succeeded
#[no_mangle]
pub static FC_SUCCESS: c_int = SUCCESS;

/// No frame newer than the one passed in
#[no_mangle]
pub static FC_NO_NEW_FRAME: c_int = NO_NEW_FRAME;

/// Channel was deleted by its creator
#[no_mangle]
pub static FC_DELETED: c_int = FRAMEWORK_DELETED;

/// The call failed; details are logged
#[no_mangle]
pub static FC_ERROR: c_int = -1;

/// NUL-terminated copy of [`crate::config::BLOCK_STUB`]
static BLOCK_STUB_C: &[u8] = b"/dev/shm/auv_visiond_\0";

/// Frame header as seen by foreign callers
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct FcFrameInfo {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub element_size: usize,
    pub acquisition_time: u64,
    pub uid: u64,
}

unsafe fn name_from_ptr<'a>(name: *const c_char) -> Option<&'a str> {
    if name.is_null() {
        return None;
    }
    CStr::from_ptr(name).to_str().ok()
}

fn status_code(result: crate::error::Result<Status>) -> c_int {
    match result {
        Ok(status) => status.code(),
        Err(e) => {
            error!(error = %e, "frame channel call failed");
            FC_ERROR
        }
    }
}

/// Path prefix every channel name is appended to
#[no_mangle]
pub extern "C" fn fc_block_stub() -> *const c_char {
    BLOCK_STUB_C.as_ptr().cast()
}

/// Create a registry with the default configuration
#[no_mangle]
pub extern "C" fn fc_registry_new() -> *mut ChannelRegistry {
    Box::into_raw(Box::new(ChannelRegistry::default()))
}

/// Free a registry, detaching every channel it holds
///
/// # Safety
/// `registry` must come from `fc_registry_new` and not be used afterwards
#[no_mangle]
pub unsafe extern "C" fn fc_registry_free(registry: *mut ChannelRegistry) {
    if !registry.is_null() {
        drop(Box::from_raw(registry));
    }
}

/// Create a channel, or open it if it exists with the same entry size
///
/// Returns null on failure.
///
/// # Safety
/// `registry` must be live; `name` must be a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn fc_create_block(
    registry: *mut ChannelRegistry,
    name: *const c_char,
    max_entry_size_bytes: usize,
) -> *const Channel {
    let Some(name) = name_from_ptr(name) else {
        return ptr::null();
    };
    if registry.is_null() {
        return ptr::null();
    }

    match (*registry).create(name, max_entry_size_bytes) {
        Ok(channel) => Arc::as_ptr(&channel),
        Err(e) => {
            error!(channel = name, error = %e, "create failed");
            ptr::null()
        }
    }
}

/// Open an existing channel
///
/// Returns null if it does not exist or cannot be opened.
///
/// # Safety
/// `registry` must be live; `name` must be a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn fc_open_block(
    registry: *mut ChannelRegistry,
    name: *const c_char,
) -> *const Channel {
    let Some(name) = name_from_ptr(name) else {
        return ptr::null();
    };
    if registry.is_null() {
        return ptr::null();
    }

    match (*registry).open(name) {
        Ok(channel) => Arc::as_ptr(&channel),
        Err(e) => {
            tracing::debug!(channel = name, error = %e, "open failed");
            ptr::null()
        }
    }
}

/// Detach a channel handed out by this registry
///
/// # Safety
/// `registry` must be live; `block` must come from the same registry and not
/// be used afterwards
#[no_mangle]
pub unsafe extern "C" fn fc_delete_block(registry: *mut ChannelRegistry, block: *const Channel) {
    if registry.is_null() || block.is_null() {
        return;
    }
    let name = (*block).name().to_string();
    (*registry).remove(&name);
}

/// Publish one frame
///
/// # Safety
/// `block` must be live; `data` must be valid for
/// `width * height * depth * element_size` bytes
#[no_mangle]
pub unsafe extern "C" fn fc_write_frame(
    block: *const Channel,
    acquisition_time: u64,
    width: usize,
    height: usize,
    depth: usize,
    element_size: usize,
    data: *const u8,
) -> c_int {
    if block.is_null() {
        return FC_ERROR;
    }
    let shape = FrameShape::new(width, height, depth, element_size);
    let len = shape.byte_len().unwrap_or(usize::MAX);
    if len > (*block).max_entry_size() {
        // Let publish report the size error without building a bogus slice
        return status_code((*block).publish(acquisition_time, shape, &[]));
    }
    if data.is_null() && len > 0 {
        return FC_ERROR;
    }
    let bytes = if len == 0 {
        &[][..]
    } else {
        slice::from_raw_parts(data, len)
    };
    status_code((*block).publish(acquisition_time, shape, bytes))
}

/// Read the newest frame into `frame`
///
/// # Safety
/// `block` and `frame` must be live
#[no_mangle]
pub unsafe extern "C" fn fc_read_frame(
    block: *const Channel,
    frame: *mut Frame,
    block_thread: bool,
) -> c_int {
    if block.is_null() || frame.is_null() {
        return FC_ERROR;
    }
    status_code((*block).consume(&mut *frame, block_thread))
}

/// Allocate an empty frame
#[no_mangle]
pub extern "C" fn fc_create_frame() -> *mut Frame {
    Box::into_raw(Box::new(Frame::new()))
}

/// Free a frame
///
/// # Safety
/// `frame` must come from `fc_create_frame` and not be used afterwards
#[no_mangle]
pub unsafe extern "C" fn fc_delete_frame(frame: *mut Frame) {
    if !frame.is_null() {
        drop(Box::from_raw(frame));
    }
}

/// Number of valid bytes in a frame
///
/// # Safety
/// `frame` must be live
#[no_mangle]
pub unsafe extern "C" fn fc_frame_size(frame: *const Frame) -> u64 {
    if frame.is_null() {
        return 0;
    }
    (*frame).size() as u64
}

/// Copy a frame's header into `out`
///
/// # Safety
/// `frame` must be live and `out` valid for writes
#[no_mangle]
pub unsafe extern "C" fn fc_frame_info(frame: *const Frame, out: *mut FcFrameInfo) -> c_int {
    if frame.is_null() || out.is_null() {
        return FC_ERROR;
    }
    let frame = &*frame;
    out.write(FcFrameInfo {
        width: frame.width(),
        height: frame.height(),
        depth: frame.depth(),
        element_size: frame.element_size(),
        acquisition_time: frame.acquisition_time(),
        uid: frame.uid(),
    });
    FC_SUCCESS
}

/// Pointer to a frame's valid bytes, good until the next read into it
///
/// # Safety
/// `frame` must be live
#[no_mangle]
pub unsafe extern "C" fn fc_frame_data(frame: *const Frame) -> *const u8 {
    if frame.is_null() {
        return ptr::null();
    }
    (*frame).data().as_ptr()
}
