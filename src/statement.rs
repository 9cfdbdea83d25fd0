use core::ffi::{CStr, c_char, c_int};
use core::ptr::NonNull;

use crate::connection::Bound;
use crate::error::{Error, ErrorCode, Result};
use crate::provider::ClientLogicApi;

/// One extended-protocol parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Param<'a> {
    /// Value bytes; `None` is SQL NULL.
    pub value: Option<&'a [u8]>,
    /// Whether the value uses the binary wire format.
    pub binary: bool,
}

impl<'a> Param<'a> {
    /// Text-format value.
    pub fn text(value: &'a [u8]) -> Self {
        Self { value: Some(value), binary: false }
    }

    /// Binary-format value.
    pub fn binary(value: &'a [u8]) -> Self {
        Self { value: Some(value), binary: true }
    }

    /// SQL NULL.
    pub fn null() -> Self {
        Self { value: None, binary: false }
    }
}

/// Parameters laid out as the C arrays a native statement record reads.
///
/// Each value is copied with a trailing NUL that its length excludes. The
/// arrays point into heap storage owned here, so they stay valid while the
/// buffers live, even if the struct itself moves.
#[derive(Debug, Default)]
pub struct ParamBuffers {
    storage: Vec<Option<Box<[u8]>>>,
    values: Vec<*const c_char>,
    lengths: Vec<c_int>,
    formats: Vec<c_int>,
}

unsafe impl Send for ParamBuffers {}

impl ParamBuffers {
    /// Copy `params` into C layout.
    pub fn new(params: &[Param<'_>]) -> Result<Self> {
        if params.len() > c_int::MAX as usize {
            return Err(Error::with_message(ErrorCode::Misuse, "too many parameters"));
        }
        let mut storage = Vec::with_capacity(params.len());
        let mut lengths = Vec::with_capacity(params.len());
        for param in params {
            match param.value {
                Some(bytes) => {
                    let len = c_int::try_from(bytes.len()).map_err(|_| {
                        Error::with_message(ErrorCode::Misuse, "parameter value too long")
                    })?;
                    let mut owned = Vec::with_capacity(bytes.len() + 1);
                    owned.extend_from_slice(bytes);
                    owned.push(0);
                    storage.push(Some(owned.into_boxed_slice()));
                    lengths.push(len);
                }
                None => {
                    storage.push(None);
                    lengths.push(0);
                }
            }
        }
        let values = storage
            .iter()
            .map(|slot| match slot {
                Some(bytes) => bytes.as_ptr() as *const c_char,
                None => core::ptr::null(),
            })
            .collect();
        let formats = params.iter().map(|p| c_int::from(p.binary)).collect();
        Ok(Self { storage, values, lengths, formats })
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Whether there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Value bytes of parameter `idx`, without the trailing NUL.
    pub fn value(&self, idx: usize) -> Option<&[u8]> {
        let bytes = self.storage.get(idx)?.as_deref()?;
        Some(&bytes[..bytes.len() - 1])
    }

    /// Whether parameter `idx` is binary.
    pub fn is_binary(&self, idx: usize) -> bool {
        self.formats.get(idx).is_some_and(|f| *f != 0)
    }

    /// `const char* const*` array; null when empty.
    pub fn values_ptr(&self) -> *const *const c_char {
        if self.values.is_empty() { core::ptr::null() } else { self.values.as_ptr() }
    }

    /// `const int*` lengths; null when empty.
    pub fn lengths_ptr(&self) -> *const c_int {
        if self.lengths.is_empty() { core::ptr::null() } else { self.lengths.as_ptr() }
    }

    /// `const int*` formats; null when empty.
    pub fn formats_ptr(&self) -> *const c_int {
        if self.formats.is_empty() { core::ptr::null() } else { self.formats.as_ptr() }
    }
}

/// Pending statement record; freed on drop, before the parameter arrays it reads.
pub(crate) struct Statement<'c, 'p, P: ClientLogicApi> {
    bound: &'c Bound<'p, P>,
    stmt: NonNull<P::Stmt>,
    _params: ParamBuffers,
}

impl<'c, 'p, P: ClientLogicApi> Statement<'c, 'p, P> {
    pub(crate) fn new(
        bound: &'c Bound<'p, P>,
        name: &CStr,
        query: Option<&CStr>,
        params: ParamBuffers,
    ) -> Option<Self> {
        let stmt = unsafe { bound.api.stmt_new(bound.conn, name, query, &params, false)? };
        Some(Self { bound, stmt, _params: params })
    }

    pub(crate) fn run_pre_query(&self) -> bool {
        unsafe { self.bound.api.run_pre_query(self.stmt, false) }
    }

    pub(crate) fn run_pre_exec(&self) -> bool {
        unsafe { self.bound.api.run_pre_exec(self.stmt) }
    }

    pub(crate) fn query(&self) -> &[u8] {
        unsafe { self.bound.api.stmt_query(self.stmt).as_slice() }
    }

    pub(crate) fn params(&self) -> Vec<Option<Vec<u8>>> {
        let count = unsafe { self.bound.api.stmt_param_count(self.stmt) };
        (0..count)
            .map(|idx| {
                let raw = unsafe { self.bound.api.stmt_param(self.stmt, idx)? };
                Some(unsafe { raw.as_slice() }.to_vec())
            })
            .collect()
    }
}

impl<'c, 'p, P: ClientLogicApi> Drop for Statement<'c, 'p, P> {
    fn drop(&mut self) {
        unsafe { self.bound.api.stmt_free(self.stmt) };
    }
}

#[cfg(test)]
mod tests {
    use super::{Param, ParamBuffers};
    use core::ffi::CStr;

    #[test]
    fn buffers_are_nul_terminated_c_arrays() {
        let params = [Param::text(b"42"), Param::null(), Param::binary(&[0, 1])];
        let buffers = ParamBuffers::new(&params).unwrap();
        assert_eq!(buffers.len(), 3);
        assert_eq!(buffers.value(0), Some(&b"42"[..]));
        assert_eq!(buffers.value(1), None);
        assert_eq!(buffers.value(2), Some(&[0u8, 1][..]));
        assert!(buffers.is_binary(2));
        assert!(!buffers.is_binary(0));
        unsafe {
            let values = core::slice::from_raw_parts(buffers.values_ptr(), 3);
            assert_eq!(CStr::from_ptr(values[0]).to_bytes(), b"42");
            assert!(values[1].is_null());
            assert_eq!(core::slice::from_raw_parts(buffers.lengths_ptr(), 3), &[2, 0, 2]);
            assert_eq!(core::slice::from_raw_parts(buffers.formats_ptr(), 3), &[0, 0, 1]);
        }
    }

    #[test]
    fn empty_buffers_pass_null_arrays() {
        let buffers = ParamBuffers::default();
        assert!(buffers.is_empty());
        assert!(buffers.values_ptr().is_null());
        assert!(buffers.lengths_ptr().is_null());
        assert!(buffers.formats_ptr().is_null());
    }

    #[test]
    fn arrays_survive_a_move() {
        let buffers = ParamBuffers::new(&[Param::text(b"abc")]).unwrap();
        let before = unsafe { *buffers.values_ptr() };
        let moved = buffers;
        assert_eq!(unsafe { *moved.values_ptr() }, before);
        assert_eq!(moved.value(0), Some(&b"abc"[..]));
    }
}
