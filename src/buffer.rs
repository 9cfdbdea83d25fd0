use core::ffi::c_void;
use core::fmt;
use core::ptr::NonNull;

/// Release function paired with every buffer that crosses the library boundary.
pub type ReleaseFn = unsafe extern "C" fn(*mut c_void);

/// Borrowed view over bytes owned by the native library.
#[derive(Clone, Copy, Debug)]
pub struct RawBytes {
    /// Pointer to library-owned bytes.
    pub ptr: *const u8,
    /// Byte length of `ptr`.
    pub len: usize,
}

impl RawBytes {
    /// Empty byte view.
    pub const fn empty() -> Self {
        Self {
            ptr: core::ptr::null(),
            len: 0,
        }
    }

    /// # Safety
    /// Caller must ensure the pointer/length remain valid for the returned slice.
    pub unsafe fn as_slice<'a>(self) -> &'a [u8] {
        if self.ptr.is_null() {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// # Safety
    /// Caller must ensure the bytes remain valid for `'a`.
    pub unsafe fn as_str<'a>(self) -> Option<&'a str> {
        core::str::from_utf8(unsafe { self.as_slice() }).ok()
    }
}

/// Heap buffer handed over by the native library.
///
/// The buffer is released exactly once through the release function that came
/// with it, either on drop or by whoever takes it back with [`OwnedBuffer::into_raw`].
pub struct OwnedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    release: ReleaseFn,
}

unsafe impl Send for OwnedBuffer {}

impl OwnedBuffer {
    /// Take ownership of `len` bytes at `ptr`.
    ///
    /// Returns `None` for a null pointer.
    ///
    /// # Safety
    /// `ptr` must be valid for `len` bytes, not owned by anyone else, and
    /// releasable with `release`.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize, release: ReleaseFn) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr, len, release })
    }

    /// Byte length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow the bytes.
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Borrow the bytes as UTF-8, when valid.
    pub fn as_str(&self) -> Option<&str> {
        core::str::from_utf8(self.as_bytes()).ok()
    }

    /// Give up ownership; the caller becomes responsible for calling `release`.
    pub fn into_raw(self) -> (NonNull<u8>, usize, ReleaseFn) {
        let parts = (self.ptr, self.len, self.release);
        core::mem::forget(self);
        parts
    }
}

impl Drop for OwnedBuffer {
    fn drop(&mut self) {
        unsafe { (self.release)(self.ptr.as_ptr() as *mut c_void) };
    }
}

impl fmt::Debug for OwnedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedBuffer").field("len", &self.len).finish()
    }
}
