use core::ptr::NonNull;

use crate::buffer::OwnedBuffer;
use crate::connection::Bound;
use crate::provider::ClientLogicApi;

/// Named constants the library resolves at runtime.
pub(crate) const VALUE_RAW: &core::ffi::CStr = c"Deprocess::VALUE_RAW";
pub(crate) const FORMAT_BINARY: &core::ffi::CStr = c"Deprocess::FORMAT_TYPE_BINARY";
pub(crate) const FORMAT_TEXT: &core::ffi::CStr = c"Deprocess::FORMAT_TYPE_TEXT";

/// Enum values the decoder is configured with, resolved once per connection.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DeprocessFormats {
    pub(crate) value_raw: i32,
    pub(crate) binary: i32,
    pub(crate) text: i32,
}

impl DeprocessFormats {
    pub(crate) fn resolve<P: ClientLogicApi>(api: &P) -> Self {
        unsafe {
            Self {
                value_raw: api.enum_value(VALUE_RAW),
                binary: api.enum_value(FORMAT_BINARY),
                text: api.enum_value(FORMAT_TEXT),
            }
        }
    }

    pub(crate) fn format(&self, binary: bool) -> i32 {
        if binary { self.binary } else { self.text }
    }
}

/// Value decoder attached to one connection.
///
/// One decoder can serve every value of a resultset. Freed on drop.
pub struct Deprocessor<'c, 'p, P: ClientLogicApi> {
    bound: &'c Bound<'p, P>,
    handle: NonNull<P::Deprocess>,
}

impl<'c, 'p, P: ClientLogicApi> Deprocessor<'c, 'p, P> {
    /// Protected values always arrive in binary form; only the output format varies.
    pub(crate) fn new(bound: &'c Bound<'p, P>, output_binary: bool) -> Option<Self> {
        let formats = &bound.formats;
        let handle = unsafe {
            bound
                .api
                .deprocess_new(formats.value_raw, formats.binary, formats.format(output_binary))?
        };
        unsafe { bound.api.deprocess_set_conn(handle, bound.conn) };
        Some(Self { bound, handle })
    }

    /// Decode one value declared as `type_oid`.
    ///
    /// `None` means "use the raw value": the input was empty or the library
    /// did not decode it.
    pub fn decode(&self, processed: &[u8], type_oid: u32) -> Option<OwnedBuffer> {
        if processed.is_empty() {
            return None;
        }
        unsafe { self.bound.api.deprocess(self.handle, processed, type_oid) }
    }
}

impl<'c, 'p, P: ClientLogicApi> Drop for Deprocessor<'c, 'p, P> {
    fn drop(&mut self) {
        unsafe { self.bound.api.deprocess_free(self.handle) };
    }
}
