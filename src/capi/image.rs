//! `accel_image_*`: decode and normalize an image file into a float tensor.

use std::ffi::{c_char, c_void};
use std::path::Path;
use std::ptr;

use super::{guard, owned_str, status_of, submit, UserData};
use crate::error::{Error, Status};
use crate::preprocess::{Layout, Normalization, Preprocessor};

pub type AccelImageCallback =
    Option<unsafe extern "C" fn(status: Status, data: *mut f32, len: usize, user_data: *mut c_void)>;

unsafe fn triple(ptr: *const f32, default: f32) -> [f32; 3] {
    if ptr.is_null() {
        [default; 3]
    } else {
        [*ptr, *ptr.add(1), *ptr.add(2)]
    }
}

unsafe fn preprocessor(
    width: u32,
    height: u32,
    means: *const f32,
    stds: *const f32,
    layout: u32,
) -> Result<Preprocessor, Error> {
    let norm = Normalization::new(triple(means, 0.0), triple(stds, 1.0))?;
    Ok(Preprocessor::new(width, height)?
        .normalization(norm)
        .layout(Layout::from_raw(layout)?))
}

fn into_buffer(data: Vec<f32>) -> (*mut f32, usize) {
    let len = data.len();
    (Box::into_raw(data.into_boxed_slice()) as *mut f32, len)
}

/// Letterbox `path` to `width` x `height` and normalize it. `means` and
/// `stds` point to three floats each or are null (0 and 1). `layout`: 0 =
/// HWC, 1 = CHW. Returns null on failure; free the buffer with
/// `accel_image_buffer_free`.
///
/// # Safety
///
/// `path` must be NUL-terminated; `means` and `stds` null or three floats;
/// `out_len` writable.
#[no_mangle]
pub unsafe extern "C" fn accel_image_preprocess(
    path: *const c_char,
    width: u32,
    height: u32,
    means: *const f32,
    stds: *const f32,
    layout: u32,
    out_len: *mut usize,
) -> *mut f32 {
    const NAME: &str = "accel_image_preprocess";
    guard(NAME, ptr::null_mut(), || {
        if out_len.is_null() {
            return ptr::null_mut();
        }
        let result = owned_str(path, "image path").and_then(|p| {
            preprocessor(width, height, means, stds, layout)?.run_file(Path::new(&p))
        });
        status_of(NAME, &result);
        match result {
            Ok(data) => {
                let (buf, len) = into_buffer(data);
                *out_len = len;
                buf
            }
            Err(_) => ptr::null_mut(),
        }
    })
}

/// # Safety
///
/// Same as [`accel_image_preprocess`]; all arguments are copied before
/// this returns.
#[no_mangle]
pub unsafe extern "C" fn accel_image_preprocess_async(
    path: *const c_char,
    width: u32,
    height: u32,
    means: *const f32,
    stds: *const f32,
    layout: u32,
    callback: AccelImageCallback,
    user_data: *mut c_void,
) -> Status {
    const NAME: &str = "accel_image_preprocess_async";
    guard(NAME, Status::Failure, || {
        let Some(cb) = callback else {
            return status_of::<()>(NAME, &Err(Error::InvalidArgument("callback is null".into())));
        };
        let args = owned_str(path, "image path")
            .and_then(|p| Ok((p, preprocessor(width, height, means, stds, layout)?)));
        let (path, pre) = match args {
            Ok(a) => a,
            Err(e) => return status_of::<()>(NAME, &Err(e)),
        };
        let user_data = UserData::new(user_data);
        submit(NAME, move || {
            let result = guard(NAME, Err(Error::InvalidState("panic")), || {
                pre.run_file(Path::new(&path))
            });
            let status = status_of(NAME, &result);
            let (buf, len) = match result {
                Ok(data) => into_buffer(data),
                Err(_) => (ptr::null_mut(), 0),
            };
            cb(status, buf, len, user_data.get());
        })
    })
}

/// Release a buffer returned by `accel_image_preprocess`.
///
/// # Safety
///
/// `data` and `len` must be exactly what the library returned.
#[no_mangle]
pub unsafe extern "C" fn accel_image_buffer_free(data: *mut f32, len: usize) {
    if !data.is_null() {
        drop(Box::from_raw(ptr::slice_from_raw_parts_mut(data, len)));
    }
}
