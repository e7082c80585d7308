//! C ABI shim.
//!
//! A thin `extern "C"` adapter over the safe Rust API, giving this crate
//! the same public surface the original shared library exposed in
//! `rdpmux.h`, so it can be loaded directly into a VMM written in C.
//! Panics are caught at the boundary: an unwind escaping into foreign code
//! is undefined behavior.

use std::ffi::{c_char, CStr};
use std::os::raw::c_int;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;

use crate::{FrameSurface, Handle};

/// Opaque session handle returned to C callers.
pub struct MuxDisplay {
    handle: Handle,
}

type KbCallback = unsafe extern "C" fn(keycode: u32, flags: u32);
type MouseCallback = unsafe extern "C" fn(x: i32, y: i32, flags: u32);

/// Matches the original `InputEventCallbacks` struct layout.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct InputEventCallbacks {
    pub mux_receive_kb: KbCallback,
    pub mux_receive_mouse: MouseCallback,
}

/// Matches the original `pixman_image_t`-derived surface description: a
/// plain descriptor of a framebuffer the caller still owns.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MuxSurface {
    pub data: *const u8,
    pub len: usize,
    pub width: c_int,
    pub height: c_int,
    pub format: u32,
    pub stride: c_int,
    pub bpp: c_int,
}

/// # Safety
///
/// `uuid` must be a valid, NUL-terminated C string for the duration of this
/// call. Returns null if `uuid` is malformed, not valid UTF-8, or not
/// exactly 36 bytes.
#[no_mangle]
pub unsafe extern "C" fn rdpmux_init(uuid: *const c_char) -> *mut MuxDisplay {
    if uuid.is_null() {
        return ptr::null_mut();
    }
    let Ok(uuid) = (unsafe { CStr::from_ptr(uuid) }).to_str() else {
        return ptr::null_mut();
    };

    match catch_unwind(|| crate::init(uuid)) {
        Ok(Ok(handle)) => Box::into_raw(Box::new(MuxDisplay { handle })),
        Ok(Err(e)) => {
            tracing::error!("rdpmux_init failed: {e}");
            ptr::null_mut()
        }
        Err(_) => ptr::null_mut(),
    }
}

/// # Safety
///
/// `display` must be a live pointer returned by [`rdpmux_init`] and not yet
/// passed to [`rdpmux_cleanup`].
#[no_mangle]
pub unsafe extern "C" fn rdpmux_register_callbacks(
    display: *mut MuxDisplay,
    callbacks: InputEventCallbacks,
) {
    let Some(display) = (unsafe { display.as_ref() }) else {
        return;
    };
    let kb = callbacks.mux_receive_kb;
    let mouse = callbacks.mux_receive_mouse;
    crate::register_callbacks(
        &display.handle,
        move |keycode, flags| unsafe { kb(keycode, flags) },
        move |x, y, flags| unsafe { mouse(x, y, flags) },
    );
}

/// # Safety
///
/// `display` must be a live pointer from [`rdpmux_init`]; `path` must be a
/// valid, NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn rdpmux_connect(
    display: *mut MuxDisplay,
    path: *const c_char,
    vm_id: c_int,
) -> bool {
    let Some(display) = (unsafe { display.as_ref() }) else {
        return false;
    };
    if path.is_null() {
        return false;
    }
    let Ok(path) = (unsafe { CStr::from_ptr(path) }).to_str() else {
        return false;
    };

    match catch_unwind(AssertUnwindSafe(|| crate::connect(&display.handle, path, vm_id))) {
        Ok(Ok(())) => {
            crate::spawn_threads(&display.handle);
            true
        }
        Ok(Err(e)) => {
            tracing::error!("rdpmux_connect failed: {e}");
            false
        }
        Err(_) => false,
    }
}

/// # Safety
///
/// `display` must be a live pointer from [`rdpmux_init`].
#[no_mangle]
pub unsafe extern "C" fn rdpmux_display_update(
    display: *mut MuxDisplay,
    x: c_int,
    y: c_int,
    w: c_int,
    h: c_int,
) {
    let Some(display) = (unsafe { display.as_ref() }) else {
        return;
    };
    crate::display_update(&display.handle, x, y, w, h);
}

/// # Safety
///
/// `display` must be a live pointer from [`rdpmux_init`]. `surface.data`
/// must point to at least `surface.len` readable bytes for the duration of
/// this call.
#[no_mangle]
pub unsafe extern "C" fn rdpmux_display_switch(display: *mut MuxDisplay, surface: MuxSurface) -> bool {
    let Some(display) = (unsafe { display.as_ref() }) else {
        return false;
    };

    let surface = FrameSurface {
        data: surface.data,
        len: surface.len,
        width: surface.width,
        height: surface.height,
        format: surface.format,
        stride: surface.stride,
        bpp: surface.bpp,
    };

    match catch_unwind(AssertUnwindSafe(|| crate::display_switch(&display.handle, surface))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::error!("rdpmux_display_switch failed: {e}");
            false
        }
        Err(_) => false,
    }
}

/// # Safety
///
/// `display` must be a live pointer from [`rdpmux_init`].
#[no_mangle]
pub unsafe extern "C" fn rdpmux_display_refresh(display: *mut MuxDisplay) {
    let Some(display) = (unsafe { display.as_ref() }) else {
        return;
    };
    let _ = catch_unwind(AssertUnwindSafe(|| crate::display_refresh(&display.handle)));
}

/// # Safety
///
/// `display` must be a pointer returned by [`rdpmux_init`] and must not be
/// used again after this call.
#[no_mangle]
pub unsafe extern "C" fn rdpmux_cleanup(display: *mut MuxDisplay) {
    if display.is_null() {
        return;
    }
    let boxed = unsafe { Box::from_raw(display) };
    let _ = catch_unwind(AssertUnwindSafe(|| crate::cleanup(&boxed.handle)));
}
