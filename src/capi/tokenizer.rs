//! `accel_tokenizer_*`: text tokenization over the C ABI.
//!
//! Functions return a [`TokenizerStatus`]; the message of the last failure
//! on the calling thread is available from `accel_tokenizer_last_error`.

use std::cell::RefCell;
use std::ffi::{c_char, c_void, CString};
use std::path::Path;
use std::ptr;
use std::slice;

use super::{guard, owned_str, submit, UserData};
use crate::error::{Error, ErrorKind, Status};
use crate::tokenizer::{Tokenizer, TokenizerFormat};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerStatus {
    Ok = 0,
    Error = 1,
    InvalidArgument = 2,
    OutOfMemory = 3,
}

/// Opaque tokenizer handle, released with `accel_tokenizer_free`.
pub struct AccelTokenizer(Tokenizer);

pub type AccelTokenizerCallback = Option<
    unsafe extern "C" fn(status: TokenizerStatus, tokenizer: *mut AccelTokenizer, user_data: *mut c_void),
>;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(message: &str) {
    let c = CString::new(message.replace('\0', " ")).ok();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = c);
}

fn fail(e: Error) -> TokenizerStatus {
    set_last_error(&e.to_string());
    match e.kind() {
        ErrorKind::InvalidArgument => TokenizerStatus::InvalidArgument,
        ErrorKind::OutOfMemory => TokenizerStatus::OutOfMemory,
        _ => TokenizerStatus::Error,
    }
}

fn finish(result: Result<(), Error>) -> TokenizerStatus {
    match result {
        Ok(()) => TokenizerStatus::Ok,
        Err(e) => fail(e),
    }
}

fn invalid(what: &str) -> Error {
    Error::InvalidArgument(what.to_string())
}

fn queued(status: Status) -> TokenizerStatus {
    if status == Status::Success {
        TokenizerStatus::Ok
    } else {
        set_last_error("could not queue the request");
        TokenizerStatus::Error
    }
}

unsafe fn tokenizer<'a>(handle: *const AccelTokenizer) -> Result<&'a Tokenizer, Error> {
    handle
        .as_ref()
        .map(|t| &t.0)
        .ok_or_else(|| invalid("tokenizer is null"))
}

unsafe fn blob<'a>(data: *const u8, size: usize) -> Result<&'a [u8], Error> {
    if data.is_null() || size == 0 {
        return Err(invalid("tokenizer blob is empty"));
    }
    Ok(slice::from_raw_parts(data, size))
}

fn into_handle(t: Tokenizer) -> *mut AccelTokenizer {
    Box::into_raw(Box::new(AccelTokenizer(t)))
}

unsafe fn store(out: *mut *mut AccelTokenizer, result: Result<Tokenizer, Error>) -> TokenizerStatus {
    match result {
        Ok(t) => {
            *out = into_handle(t);
            TokenizerStatus::Ok
        }
        Err(e) => fail(e),
    }
}

/// Message of the last failed call on this thread, or null. Valid until the
/// next tokenizer call on the same thread.
#[no_mangle]
pub extern "C" fn accel_tokenizer_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| slot.borrow().as_ref().map_or(ptr::null(), |c| c.as_ptr()))
}

/// Load a tokenizer; the format follows the extension (`.json`, `.model`,
/// anything else is a word-per-line vocabulary).
///
/// # Safety
///
/// `path` must be null or NUL-terminated; `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn accel_tokenizer_create_from_file(
    path: *const c_char,
    out: *mut *mut AccelTokenizer,
) -> TokenizerStatus {
    guard("accel_tokenizer_create_from_file", TokenizerStatus::Error, || {
        if out.is_null() {
            return fail(invalid("out is null"));
        }
        let result = owned_str(path, "tokenizer path").and_then(|p| Tokenizer::from_file(Path::new(&p)));
        store(out, result)
    })
}

/// Build a tokenizer from memory. `format`: 0 = tokenizer JSON,
/// 1 = SentencePiece model, 2 = word-per-line vocabulary.
///
/// # Safety
///
/// `data` must point to `size` readable bytes; `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn accel_tokenizer_create_from_blob(
    data: *const u8,
    size: usize,
    format: u32,
    out: *mut *mut AccelTokenizer,
) -> TokenizerStatus {
    guard("accel_tokenizer_create_from_blob", TokenizerStatus::Error, || {
        if out.is_null() {
            return fail(invalid("out is null"));
        }
        let result = TokenizerFormat::from_raw(format)
            .and_then(|f| Tokenizer::from_blob(blob(data, size)?, f));
        store(out, result)
    })
}

fn deliver(
    name: &'static str,
    callback: unsafe extern "C" fn(TokenizerStatus, *mut AccelTokenizer, *mut c_void),
    user_data: UserData,
    build: impl FnOnce() -> Result<Tokenizer, Error> + Send + 'static,
) -> TokenizerStatus {
    queued(submit(name, move || {
        let (status, handle) = match guard(name, Err(Error::InvalidState("panic")), build) {
            Ok(t) => (TokenizerStatus::Ok, into_handle(t)),
            Err(e) => (fail(e), ptr::null_mut()),
        };
        // SAFETY: the caller registered `callback` for this result.
        unsafe { callback(status, handle, user_data.get()) };
    }))
}

/// # Safety
///
/// `path` must be null or NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn accel_tokenizer_create_from_file_async(
    path: *const c_char,
    callback: AccelTokenizerCallback,
    user_data: *mut c_void,
) -> TokenizerStatus {
    const NAME: &str = "accel_tokenizer_create_from_file_async";
    guard(NAME, TokenizerStatus::Error, || {
        let Some(cb) = callback else {
            return fail(invalid("callback is null"));
        };
        match owned_str(path, "tokenizer path") {
            Ok(p) => deliver(NAME, cb, UserData::new(user_data), move || {
                Tokenizer::from_file(Path::new(&p))
            }),
            Err(e) => fail(e),
        }
    })
}

/// The blob is copied before this returns.
///
/// # Safety
///
/// `data` must point to `size` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn accel_tokenizer_create_from_blob_async(
    data: *const u8,
    size: usize,
    format: u32,
    callback: AccelTokenizerCallback,
    user_data: *mut c_void,
) -> TokenizerStatus {
    const NAME: &str = "accel_tokenizer_create_from_blob_async";
    guard(NAME, TokenizerStatus::Error, || {
        let Some(cb) = callback else {
            return fail(invalid("callback is null"));
        };
        let args = TokenizerFormat::from_raw(format).and_then(|f| Ok((f, blob(data, size)?.to_vec())));
        match args {
            Ok((format, bytes)) => deliver(NAME, cb, UserData::new(user_data), move || {
                Tokenizer::from_blob(&bytes, format)
            }),
            Err(e) => fail(e),
        }
    })
}

/// # Safety
///
/// `handle` must be null or a live tokenizer; it is invalid afterwards.
#[no_mangle]
pub unsafe extern "C" fn accel_tokenizer_free(handle: *mut AccelTokenizer) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Encode `text` into `tokens`, which holds `max_tokens` entries. On success
/// or when the buffer is too small, `*num_tokens` is the number of ids the
/// text needs.
///
/// # Safety
///
/// `tokens` must have room for `max_tokens` ids; `num_tokens` must be
/// writable; `text` NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn accel_tokenizer_encode(
    handle: *const AccelTokenizer,
    text: *const c_char,
    tokens: *mut i32,
    num_tokens: *mut usize,
    max_tokens: usize,
) -> TokenizerStatus {
    guard("accel_tokenizer_encode", TokenizerStatus::Error, || {
        finish((|| {
            if num_tokens.is_null() {
                return Err(invalid("num_tokens is null"));
            }
            let text = owned_str(text, "text")?;
            let ids = tokenizer(handle)?.encode(&text)?;
            *num_tokens = ids.len();
            if ids.len() > max_tokens || (!ids.is_empty() && tokens.is_null()) {
                return Err(Error::InvalidArgument(format!(
                    "{} tokens do not fit in a buffer of {max_tokens}",
                    ids.len()
                )));
            }
            for (i, id) in ids.iter().enumerate() {
                let id = i32::try_from(*id).map_err(|_| invalid("token id exceeds i32"))?;
                *tokens.add(i) = id;
            }
            Ok(())
        })())
    })
}

/// Copy `s` plus a NUL into `text`. With a null `text` only the required
/// size is reported; `*text_len` always ends up holding it.
unsafe fn write_text(s: &str, text: *mut c_char, text_len: *mut usize) -> Result<(), Error> {
    if text_len.is_null() {
        return Err(invalid("text_len is null"));
    }
    let needed = s.len() + 1;
    let available = *text_len;
    *text_len = needed;
    if text.is_null() {
        return Ok(());
    }
    if available < needed {
        return Err(Error::InvalidArgument(format!(
            "text needs {needed} bytes, buffer holds {available}"
        )));
    }
    ptr::copy_nonoverlapping(s.as_ptr(), text as *mut u8, s.len());
    *text.add(s.len()) = 0;
    Ok(())
}

/// Decode ids to text. Call once with a null `text` to learn the size, then
/// again with a buffer of `*text_len` bytes.
///
/// # Safety
///
/// `tokens` must hold `num_tokens` ids; `text` must be null or hold
/// `*text_len` bytes.
#[no_mangle]
pub unsafe extern "C" fn accel_tokenizer_decode(
    handle: *const AccelTokenizer,
    tokens: *const i32,
    num_tokens: usize,
    text: *mut c_char,
    text_len: *mut usize,
) -> TokenizerStatus {
    guard("accel_tokenizer_decode", TokenizerStatus::Error, || {
        finish((|| {
            let ids: Vec<u32> = if num_tokens == 0 {
                Vec::new()
            } else if tokens.is_null() {
                return Err(invalid("tokens is null"));
            } else {
                slice::from_raw_parts(tokens, num_tokens)
                    .iter()
                    .map(|&id| u32::try_from(id).map_err(|_| Error::InvalidArgument(format!("token id {id}"))))
                    .collect::<Result<_, _>>()?
            };
            let decoded = tokenizer(handle)?.decode(&ids)?;
            write_text(&decoded, text, text_len)
        })())
    })
}

/// Text of one id, with the same two-call protocol as
/// `accel_tokenizer_decode`.
///
/// # Safety
///
/// `text` must be null or hold `*text_len` bytes.
#[no_mangle]
pub unsafe extern "C" fn accel_tokenizer_id_to_token(
    handle: *const AccelTokenizer,
    id: i32,
    text: *mut c_char,
    text_len: *mut usize,
) -> TokenizerStatus {
    guard("accel_tokenizer_id_to_token", TokenizerStatus::Error, || {
        finish((|| {
            let token = u32::try_from(id)
                .ok()
                .and_then(|id| tokenizer(handle).map(|t| t.id_to_token(id)).transpose())
                .transpose()?
                .ok_or_else(|| Error::InvalidArgument(format!("no token with id {id}")))?;
            write_text(&token, text, text_len)
        })())
    })
}

/// Id of `token`, or -1 if it is not in the vocabulary.
///
/// # Safety
///
/// `token` must be null or NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn accel_tokenizer_token_to_id(
    handle: *const AccelTokenizer,
    token: *const c_char,
) -> i32 {
    guard("accel_tokenizer_token_to_id", -1, || {
        let found = owned_str(token, "token")
            .and_then(|t| Ok(tokenizer(handle)?.token_to_id(&t)));
        match found {
            Ok(Some(id)) => i32::try_from(id).unwrap_or(-1),
            Ok(None) => -1,
            Err(e) => {
                fail(e);
                -1
            }
        }
    })
}

/// Vocabulary size including added tokens, or 0 for a null handle.
///
/// # Safety
///
/// `handle` must be null or a live tokenizer.
#[no_mangle]
pub unsafe extern "C" fn accel_tokenizer_vocab_size(handle: *const AccelTokenizer) -> usize {
    guard("accel_tokenizer_vocab_size", 0, || {
        tokenizer(handle).map(Tokenizer::vocab_size).unwrap_or(0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capi::testing::Inbox;
    use std::ffi::CStr;

    const VOCAB: &[u8] = b"[UNK]\nhello\nworld\n";

    fn word_level() -> *mut AccelTokenizer {
        let mut handle = ptr::null_mut();
        let status = unsafe {
            accel_tokenizer_create_from_blob(VOCAB.as_ptr(), VOCAB.len(), 2, &mut handle)
        };
        assert_eq!(status, TokenizerStatus::Ok);
        handle
    }

    unsafe extern "C" fn on_tokenizer(status: TokenizerStatus, t: *mut AccelTokenizer, user_data: *mut c_void) {
        Inbox::<(TokenizerStatus, usize)>::post(user_data, (status, t as usize));
    }

    #[test]
    fn encode_respects_buffer_size() {
        let t = word_level();
        let text = CString::new("hello world").unwrap();
        let mut tokens = [0i32; 4];
        let mut n = 0usize;
        unsafe {
            let status = accel_tokenizer_encode(t, text.as_ptr(), tokens.as_mut_ptr(), &mut n, 4);
            assert_eq!(status, TokenizerStatus::Ok);
            assert_eq!(&tokens[..n], &[1, 2]);

            let status = accel_tokenizer_encode(t, text.as_ptr(), tokens.as_mut_ptr(), &mut n, 1);
            assert_eq!(status, TokenizerStatus::InvalidArgument);
            assert_eq!(n, 2);
            assert!(!accel_tokenizer_last_error().is_null());

            accel_tokenizer_free(t);
        }
    }

    #[test]
    fn decode_two_call_protocol() {
        let t = word_level();
        let ids = [1i32, 2];
        let mut len = 0usize;
        unsafe {
            let status = accel_tokenizer_decode(t, ids.as_ptr(), 2, ptr::null_mut(), &mut len);
            assert_eq!(status, TokenizerStatus::Ok);
            assert_eq!(len, "hello world".len() + 1);

            let mut short = vec![0 as c_char; 4];
            let mut short_len = short.len();
            let status = accel_tokenizer_decode(t, ids.as_ptr(), 2, short.as_mut_ptr(), &mut short_len);
            assert_eq!(status, TokenizerStatus::InvalidArgument);
            assert_eq!(short_len, len);

            let mut buf = vec![0 as c_char; len];
            let status = accel_tokenizer_decode(t, ids.as_ptr(), 2, buf.as_mut_ptr(), &mut len);
            assert_eq!(status, TokenizerStatus::Ok);
            assert_eq!(CStr::from_ptr(buf.as_ptr()).to_str().unwrap(), "hello world");

            accel_tokenizer_free(t);
        }
    }

    #[test]
    fn vocabulary_lookups() {
        let t = word_level();
        unsafe {
            assert_eq!(accel_tokenizer_vocab_size(t), 3);
            let world = CString::new("world").unwrap();
            assert_eq!(accel_tokenizer_token_to_id(t, world.as_ptr()), 2);
            let missing = CString::new("nope").unwrap();
            assert_eq!(accel_tokenizer_token_to_id(t, missing.as_ptr()), -1);

            let mut buf = [0 as c_char; 16];
            let mut len = buf.len();
            assert_eq!(
                accel_tokenizer_id_to_token(t, 1, buf.as_mut_ptr(), &mut len),
                TokenizerStatus::Ok
            );
            assert_eq!(CStr::from_ptr(buf.as_ptr()).to_str().unwrap(), "hello");
            let mut len = buf.len();
            assert_eq!(
                accel_tokenizer_id_to_token(t, 99, buf.as_mut_ptr(), &mut len),
                TokenizerStatus::InvalidArgument
            );
            assert_eq!(accel_tokenizer_vocab_size(ptr::null()), 0);
            accel_tokenizer_free(t);
        }
    }

    #[test]
    fn bad_arguments() {
        let mut handle = ptr::null_mut();
        unsafe {
            assert_eq!(
                accel_tokenizer_create_from_blob(ptr::null(), 0, 2, &mut handle),
                TokenizerStatus::InvalidArgument
            );
            assert_eq!(
                accel_tokenizer_create_from_blob(VOCAB.as_ptr(), VOCAB.len(), 9, &mut handle),
                TokenizerStatus::InvalidArgument
            );
            let missing = CString::new("/nonexistent/vocab.txt").unwrap();
            assert_eq!(
                accel_tokenizer_create_from_file(missing.as_ptr(), &mut handle),
                TokenizerStatus::Error
            );
            let msg = CStr::from_ptr(accel_tokenizer_last_error());
            assert!(msg.to_str().unwrap().contains("I/O"));
            assert!(handle.is_null());
        }
    }

    #[test]
    fn async_creation() {
        let inbox = Inbox::<(TokenizerStatus, usize)>::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.txt");
        std::fs::write(&path, VOCAB).unwrap();
        let c_path = CString::new(path.to_str().unwrap()).unwrap();
        unsafe {
            let status = accel_tokenizer_create_from_file_async(c_path.as_ptr(), Some(on_tokenizer), inbox.user_data());
            assert_eq!(status, TokenizerStatus::Ok);
            let (status, t) = inbox.recv();
            assert_eq!(status, TokenizerStatus::Ok);
            assert_eq!(accel_tokenizer_vocab_size(t as *const AccelTokenizer), 3);
            accel_tokenizer_free(t as *mut AccelTokenizer);

            let owned = VOCAB.to_vec();
            let status = accel_tokenizer_create_from_blob_async(
                owned.as_ptr(),
                owned.len(),
                2,
                Some(on_tokenizer),
                inbox.user_data(),
            );
            drop(owned);
            assert_eq!(status, TokenizerStatus::Ok);
            let (status, t) = inbox.recv();
            assert_eq!(status, TokenizerStatus::Ok);
            accel_tokenizer_free(t as *mut AccelTokenizer);

            let bad = b"\x0a\x05";
            accel_tokenizer_create_from_blob_async(bad.as_ptr(), bad.len(), 1, Some(on_tokenizer), inbox.user_data());
            let (status, t) = inbox.recv();
            assert_ne!(status, TokenizerStatus::Ok);
            assert_eq!(t, 0);
        }
    }
}
