//! FFI bindings for Alivio Sensory
//!
//! C-compatible entry points for mobile hosts. Plans and profiles cross the
//! boundary as JSON strings; the visual synchronizer is exposed as an opaque
//! handle the host ticks from its own frame callback. Returned strings must be
//! freed by the caller using `alivio_free_string`.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;

use crate::config::{SchedulerSettings, SessionConfig};
use crate::error::SensoryError;
use crate::plan::build_session_plan;
use crate::profile;
use crate::types::{AgeGroup, Site};
use crate::visual::{self, VisualInputs};

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Turn a JSON result into an owned C string, recording the error otherwise.
fn respond(result: Result<String, SensoryError>) -> *mut c_char {
    match result {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

// ============================================================================
// Planning
// ============================================================================

/// Build a session plan from a `SessionConfig` JSON object.
///
/// # Safety
/// - `config_json` must be a valid null-terminated C string.
/// - Returns a newly allocated string that must be freed with `alivio_free_string`.
/// - Returns NULL on error; call `alivio_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn alivio_build_session_plan(config_json: *const c_char) -> *mut c_char {
    clear_last_error();

    let Some(json) = cstr_to_string(config_json) else {
        set_last_error("Invalid config string pointer");
        return ptr::null_mut();
    };

    respond(SessionConfig::from_json(&json).and_then(|config| {
        build_session_plan(
            config.site,
            config.age_group,
            config.duration_sec(),
            &config.plan_options(),
        )
        .to_json()
    }))
}

/// Resolve the cadence profile for a site and age group.
///
/// Unknown names resolve to the default profile.
///
/// # Safety
/// - `site` and `age_group` must be valid null-terminated C strings.
/// - Returns a newly allocated string that must be freed with `alivio_free_string`.
#[no_mangle]
pub unsafe extern "C" fn alivio_site_profile(
    site: *const c_char,
    age_group: *const c_char,
) -> *mut c_char {
    clear_last_error();

    let Some(site) = cstr_to_string(site) else {
        set_last_error("Invalid site string pointer");
        return ptr::null_mut();
    };
    let age_group = cstr_to_string(age_group).unwrap_or_default();

    let site: Site = match site.parse() {
        Ok(s) => s,
        Err(never) => match never {},
    };
    let age_group: AgeGroup = match age_group.parse() {
        Ok(a) => a,
        Err(never) => match never {},
    };

    respond(serde_json::to_string(&profile::resolve(site, age_group)).map_err(SensoryError::from))
}

// ============================================================================
// Visual synchronizer
// ============================================================================

/// Opaque handle holding the visual inputs and beat clock.
pub struct AlivioVisualHandle {
    inputs: VisualInputs,
    beat_period_ms: f64,
}

/// Create a visual handle.
///
/// # Safety
/// - `inputs_json` must be a valid null-terminated C string.
/// - `settings_json` may be NULL to use default scheduler settings.
/// - Must be freed with `alivio_visual_free`. Returns NULL on error.
#[no_mangle]
pub unsafe extern "C" fn alivio_visual_new(
    inputs_json: *const c_char,
    settings_json: *const c_char,
) -> *mut AlivioVisualHandle {
    clear_last_error();

    let Some(json) = cstr_to_string(inputs_json) else {
        set_last_error("Invalid inputs string pointer");
        return ptr::null_mut();
    };
    let inputs: VisualInputs = match serde_json::from_str(&json) {
        Ok(i) => i,
        Err(e) => {
            set_last_error(&SensoryError::from(e).to_string());
            return ptr::null_mut();
        }
    };
    let settings = match cstr_to_string(settings_json) {
        Some(s) => match SchedulerSettings::from_json(&s) {
            Ok(settings) => settings,
            Err(e) => {
                set_last_error(&e.to_string());
                return ptr::null_mut();
            }
        },
        None => SchedulerSettings::default(),
    };

    Box::into_raw(Box::new(AlivioVisualHandle {
        inputs,
        beat_period_ms: settings.beat_period_ms(),
    }))
}

/// Replace the inputs of a visual handle.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `alivio_visual_new`.
/// - `inputs_json` must be a valid null-terminated C string.
/// - Returns 0 on success, -1 on error.
#[no_mangle]
pub unsafe extern "C" fn alivio_visual_set_inputs(
    handle: *mut AlivioVisualHandle,
    inputs_json: *const c_char,
) -> i32 {
    clear_last_error();

    if handle.is_null() {
        set_last_error("Null visual handle");
        return -1;
    }
    let handle = &mut *handle;

    let Some(json) = cstr_to_string(inputs_json) else {
        set_last_error("Invalid inputs string pointer");
        return -1;
    };
    match serde_json::from_str::<VisualInputs>(&json) {
        Ok(inputs) => {
            handle.inputs = inputs;
            0
        }
        Err(e) => {
            set_last_error(&SensoryError::from(e).to_string());
            -1
        }
    }
}

/// Compute the frame at `elapsed_ms` as JSON.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `alivio_visual_new`.
/// - Returns a newly allocated string that must be freed with `alivio_free_string`.
#[no_mangle]
pub unsafe extern "C" fn alivio_visual_frame(
    handle: *const AlivioVisualHandle,
    elapsed_ms: f64,
) -> *mut c_char {
    clear_last_error();

    if handle.is_null() {
        set_last_error("Null visual handle");
        return ptr::null_mut();
    }
    let handle = &*handle;
    let frame = visual::frame(&handle.inputs, elapsed_ms, handle.beat_period_ms);
    respond(serde_json::to_string(&frame).map_err(SensoryError::from))
}

/// Free a visual handle.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `alivio_visual_new`, or NULL.
#[no_mangle]
pub unsafe extern "C" fn alivio_visual_free(handle: *mut AlivioVisualHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

// ============================================================================
// Memory Management
// ============================================================================

/// Free a string returned by Alivio functions.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by an Alivio function, or NULL.
#[no_mangle]
pub unsafe extern "C" fn alivio_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Get the last error message.
///
/// # Safety
/// - The returned pointer is valid until the next Alivio call on this thread.
/// - Do NOT free the returned pointer. Returns NULL if no error occurred.
#[no_mangle]
pub unsafe extern "C" fn alivio_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

/// Get the library version. Static string, do NOT free.
#[no_mangle]
pub extern "C" fn alivio_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}
