use core::ffi::{CStr, c_char, c_int, c_void};
use core::ptr::null;
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::error::Result;

/// Status returned by `load` once a resultset is in place.
pub const CURSOR_LOADED: c_int = 1;
/// Status returned by `load` when no resultset could be produced.
pub const CURSOR_NOT_LOADED: c_int = 0;

/// Row cursor as handed to the native cursor factory.
///
/// Field order follows the factory's argument order and is part of the
/// native contract. Every callback receives `ctx` as its first argument;
/// `ctx` alone identifies the concrete cursor.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CursorCallbacks {
    /// Opaque cursor state.
    pub ctx: *mut c_void,
    /// Release the cursor. Called exactly once by whoever owns it.
    pub destructor: unsafe extern "C" fn(*mut c_void),
    /// Value of a column in the current row, or null.
    pub get: unsafe extern "C" fn(*mut c_void, c_int) -> *const c_char,
    /// Run a query and replace the resultset. Returns 1 on success, 0 otherwise.
    pub load: unsafe extern "C" fn(*mut c_void, *const c_char) -> c_int,
    /// Advance one row. Returns 1 when the cursor moved.
    pub next: unsafe extern "C" fn(*mut c_void) -> c_int,
    /// Index of a column by case-insensitive name, or -1.
    pub column_index: unsafe extern "C" fn(*mut c_void, *const c_char) -> c_int,
    /// Release the current resultset.
    pub clear: unsafe extern "C" fn(*mut c_void),
    /// Rows in the current resultset, -1 when nothing is loaded.
    pub row_count: unsafe extern "C" fn(*mut c_void) -> c_int,
}

/// Row iteration the native library drives through [`CursorCallbacks`].
///
/// Dropping the implementation is the `destructor` operation.
pub trait RowCursor: Send {
    /// Replace the current resultset with the result of `query`.
    fn load(&mut self, query: &CStr) -> Result<()>;
    /// Advance one row; returns whether the position moved.
    fn next(&mut self) -> bool;
    /// Value at `col` in the current row.
    fn get(&self, col: i32) -> Option<&CStr>;
    /// Case-insensitive column lookup; -1 when absent.
    fn column_index(&self, name: &CStr) -> i32;
    /// Release the current resultset.
    fn clear(&mut self);
    /// Rows in the current resultset; -1 when nothing is loaded.
    fn row_count(&self) -> i32;
}

unsafe fn cursor_mut<'a, C: RowCursor>(ctx: *mut c_void) -> Option<&'a mut C> {
    unsafe { (ctx as *mut C).as_mut() }
}

extern "C" fn x_load<C: RowCursor>(ctx: *mut c_void, query: *const c_char) -> c_int {
    let Some(cursor) = (unsafe { cursor_mut::<C>(ctx) }) else {
        return CURSOR_NOT_LOADED;
    };
    if query.is_null() {
        return CURSOR_NOT_LOADED;
    }
    let query = unsafe { CStr::from_ptr(query) };
    match catch_unwind(AssertUnwindSafe(|| cursor.load(query))) {
        Ok(Ok(())) => CURSOR_LOADED,
        _ => CURSOR_NOT_LOADED,
    }
}

extern "C" fn x_next<C: RowCursor>(ctx: *mut c_void) -> c_int {
    let Some(cursor) = (unsafe { cursor_mut::<C>(ctx) }) else {
        return 0;
    };
    match catch_unwind(AssertUnwindSafe(|| cursor.next())) {
        Ok(true) => 1,
        _ => 0,
    }
}

extern "C" fn x_get<C: RowCursor>(ctx: *mut c_void, col: c_int) -> *const c_char {
    let Some(cursor) = (unsafe { cursor_mut::<C>(ctx) }) else {
        return null();
    };
    catch_unwind(AssertUnwindSafe(|| cursor.get(col).map_or(null(), CStr::as_ptr))).unwrap_or(null())
}

extern "C" fn x_column_index<C: RowCursor>(ctx: *mut c_void, name: *const c_char) -> c_int {
    let Some(cursor) = (unsafe { cursor_mut::<C>(ctx) }) else {
        return -1;
    };
    if name.is_null() {
        return -1;
    }
    let name = unsafe { CStr::from_ptr(name) };
    catch_unwind(AssertUnwindSafe(|| cursor.column_index(name))).unwrap_or(-1)
}

extern "C" fn x_clear<C: RowCursor>(ctx: *mut c_void) {
    if let Some(cursor) = unsafe { cursor_mut::<C>(ctx) } {
        let _ = catch_unwind(AssertUnwindSafe(|| cursor.clear()));
    }
}

extern "C" fn x_row_count<C: RowCursor>(ctx: *mut c_void) -> c_int {
    let Some(cursor) = (unsafe { cursor_mut::<C>(ctx) }) else {
        return -1;
    };
    catch_unwind(AssertUnwindSafe(|| cursor.row_count())).unwrap_or(-1)
}

extern "C" fn x_destructor<C: RowCursor>(ctx: *mut c_void) {
    if ctx.is_null() {
        return;
    }
    let cursor = unsafe { Box::from_raw(ctx as *mut C) };
    let _ = catch_unwind(AssertUnwindSafe(move || drop(cursor)));
}

fn callbacks<C: RowCursor>(ctx: *mut c_void) -> CursorCallbacks {
    CursorCallbacks {
        ctx,
        destructor: x_destructor::<C>,
        get: x_get::<C>,
        load: x_load::<C>,
        next: x_next::<C>,
        column_index: x_column_index::<C>,
        clear: x_clear::<C>,
        row_count: x_row_count::<C>,
    }
}

/// A boxed cursor exposed through [`CursorCallbacks`].
///
/// Dropping an `ExportedCursor` destroys the cursor. Once ownership moves to
/// the native library through [`ExportedCursor::into_callbacks`], the native
/// side must invoke the destructor exactly once.
pub struct ExportedCursor {
    callbacks: CursorCallbacks,
}

unsafe impl Send for ExportedCursor {}

impl ExportedCursor {
    /// Box `cursor` and expose it through callbacks.
    pub fn new<C: RowCursor + 'static>(cursor: C) -> Self {
        let ctx = Box::into_raw(Box::new(cursor)) as *mut c_void;
        Self {
            callbacks: callbacks::<C>(ctx),
        }
    }

    /// Callbacks of the cursor, still owned by `self`.
    pub fn callbacks(&self) -> &CursorCallbacks {
        &self.callbacks
    }

    /// Transfer ownership: the receiver must call the destructor exactly once.
    pub fn into_callbacks(self) -> CursorCallbacks {
        let callbacks = self.callbacks;
        core::mem::forget(self);
        callbacks
    }
}

impl Drop for ExportedCursor {
    fn drop(&mut self) {
        unsafe { (self.callbacks.destructor)(self.callbacks.ctx) };
    }
}

/// Drives [`CursorCallbacks`] the way the native library does.
///
/// Used by native-side shims and tests. It never owns the cursor unless
/// [`CursorCalls::destroy`] is called.
#[derive(Clone, Copy)]
pub struct CursorCalls {
    callbacks: CursorCallbacks,
}

impl CursorCalls {
    /// # Safety
    /// `callbacks.ctx` must be a live cursor matching the callbacks, or null.
    pub unsafe fn new(callbacks: CursorCallbacks) -> Self {
        Self { callbacks }
    }

    /// Invoke `load`; returns the raw status.
    pub fn load(&self, query: &CStr) -> i32 {
        unsafe { (self.callbacks.load)(self.callbacks.ctx, query.as_ptr()) }
    }

    /// Invoke `next`.
    pub fn next(&self) -> bool {
        unsafe { (self.callbacks.next)(self.callbacks.ctx) != 0 }
    }

    /// Invoke `get` and copy the value out.
    pub fn get(&self, col: i32) -> Option<String> {
        let ptr = unsafe { (self.callbacks.get)(self.callbacks.ctx, col) };
        if ptr.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }

    /// Invoke `column_index`.
    pub fn column_index(&self, name: &CStr) -> i32 {
        unsafe { (self.callbacks.column_index)(self.callbacks.ctx, name.as_ptr()) }
    }

    /// Invoke `clear`.
    pub fn clear(&self) {
        unsafe { (self.callbacks.clear)(self.callbacks.ctx) }
    }

    /// Invoke `row_count`.
    pub fn row_count(&self) -> i32 {
        unsafe { (self.callbacks.row_count)(self.callbacks.ctx) }
    }

    /// Invoke the destructor.
    ///
    /// # Safety
    /// Must be called at most once per cursor, and no other call may follow.
    pub unsafe fn destroy(self) {
        unsafe { (self.callbacks.destructor)(self.callbacks.ctx) }
    }
}
