use core::ffi::CStr;
use core::ptr::NonNull;
use std::ffi::CString;
use std::sync::Arc;

use crate::bridge::{CursorBridge, ForeignConnection};
use crate::buffer::OwnedBuffer;
use crate::cursor::ExportedCursor;
use crate::deprocess::{DeprocessFormats, Deprocessor};
use crate::error::{Error, ErrorCode, Result};
use crate::provider::{CachedCek, ClientLogicApi, ConnectParams, CopyChunk};
use crate::statement::{Param, ParamBuffers, Statement};

/// Connection status reported with every `ReadyForQuery`; the session is
/// always established by then.
const CONNECTION_ESTABLISHED: i32 = 0;

const CLIENT_ERROR: &str = "Encountered a client error";
const UNREPORTED_ERROR: &str = "encountered a unreport client error";

/// Result of an operation that depends on client-side protection.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome<T> {
    /// Protection is off; the caller proceeds with the unprotected value.
    Disabled,
    /// The native library handled the request.
    Applied(T),
}

impl<T> Outcome<T> {
    /// Whether protection was off.
    pub fn is_disabled(&self) -> bool {
        matches!(self, Outcome::Disabled)
    }

    /// The applied value, if any.
    pub fn applied(self) -> Option<T> {
        match self {
            Outcome::Applied(value) => Some(value),
            Outcome::Disabled => None,
        }
    }

    /// The applied value, or `default` when protection was off.
    pub fn unwrap_or(self, default: T) -> T {
        self.applied().unwrap_or(default)
    }

    /// Map the applied value.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Outcome::Applied(value) => Outcome::Applied(f(value)),
            Outcome::Disabled => Outcome::Disabled,
        }
    }
}

pub(crate) struct Bound<'p, P: ClientLogicApi> {
    pub(crate) api: &'p P,
    pub(crate) conn: NonNull<P::Conn>,
    pub(crate) formats: DeprocessFormats,
}

impl<'p, P: ClientLogicApi> Bound<'p, P> {
    fn errmsg(&self) -> Option<String> {
        unsafe { self.api.errmsg(self.conn) }
    }

    fn is_process_query(&self) -> bool {
        unsafe { self.api.is_process_query(self.conn) }
    }
}

/// Scratch state of one server error, freed when the error is fully read.
struct RefreshParams<'c, 'p, P: ClientLogicApi> {
    bound: &'c Bound<'p, P>,
    params: NonNull<P::RefreshParams>,
}

impl<'c, 'p, P: ClientLogicApi> RefreshParams<'c, 'p, P> {
    fn new(bound: &'c Bound<'p, P>) -> Option<Self> {
        let params = unsafe { bound.api.new_refresh_params()? };
        Some(Self { bound, params })
    }

    fn read(&self, field: u8, value: &CStr) {
        unsafe { self.bound.api.read_error_field(self.bound.conn, self.params, field, value) };
    }
}

impl<'c, 'p, P: ClientLogicApi> Drop for RefreshParams<'c, 'p, P> {
    fn drop(&mut self) {
        unsafe { self.bound.api.free_refresh_params(self.params) };
    }
}

/// Clears resend state on every exit path once the pre-check ran.
struct ResendGuard<'c, 'p, P: ClientLogicApi>(&'c Bound<'p, P>);

impl<'c, 'p, P: ClientLogicApi> Drop for ResendGuard<'c, 'p, P> {
    fn drop(&mut self) {
        unsafe { self.0.api.post_check_resend(self.0.conn) };
    }
}

/// Parse `major.minor.patch` into `major * 10000 + minor * 100 + patch`.
///
/// Parsing stops at the first component that is not a number; missing
/// components count as zero.
pub fn parse_server_version(text: &str) -> i32 {
    let mut parts = [0i32; 3];
    for (slot, part) in parts.iter_mut().zip(text.trim().split('.')) {
        let end = part.find(|c: char| !c.is_ascii_digit()).unwrap_or(part.len());
        match part[..end].parse() {
            Ok(value) => *slot = value,
            Err(_) => break,
        }
        if end != part.len() {
            break;
        }
    }
    parts[0]
        .saturating_mul(10000)
        .saturating_add(parts[1].saturating_mul(100))
        .saturating_add(parts[2])
}

/// Per-connection entry point for client-side protection.
///
/// Either bound to a native connection or disabled; every operation on a
/// disabled instance returns [`Outcome::Disabled`] without touching the
/// native library.
pub struct ClientLogic<'p, P: ClientLogicApi> {
    bound: Option<Bound<'p, P>>,
}

impl<'p, P: ClientLogicApi> ClientLogic<'p, P> {
    /// A connection with protection turned off.
    pub fn disabled() -> Self {
        Self { bound: None }
    }

    /// Bind a native connection to `foreign`.
    ///
    /// `api` is `None` when the library failed to load; the result is then
    /// disabled.
    pub fn connect<F>(api: Option<&'p P>, foreign: &Arc<F>, params: &ConnectParams) -> Result<Self>
    where
        F: ForeignConnection + 'static,
    {
        let Some(api) = api else {
            tracing::debug!("client logic library unavailable; protection disabled");
            return Ok(Self::disabled());
        };
        let exported = ExportedCursor::new(CursorBridge::new(foreign));
        let Some((cursor, deallocator)) = (unsafe { api.new_cursor(exported.callbacks()) }) else {
            return Err(Error::with_message(ErrorCode::Native, "cannot create client logic cursor"));
        };
        // The native cursor owns the context from here on.
        let _ = exported.into_callbacks();
        let Some(conn) = (unsafe { api.conn_init(params, cursor, deallocator) }) else {
            return Err(Error::with_message(
                ErrorCode::Native,
                "tried to use client logic and failed",
            ));
        };
        let formats = DeprocessFormats::resolve(api);
        tracing::debug!(
            backend = api.backend_name(),
            user = %params.user,
            database = %params.database,
            "client logic connection ready"
        );
        Ok(Self { bound: Some(Bound { api, conn, formats }) })
    }

    /// Whether protection is active.
    pub fn is_enabled(&self) -> bool {
        self.bound.is_some()
    }

    /// Last error message recorded by the native connection.
    pub fn last_error(&self) -> Option<Error> {
        let message = self.bound.as_ref()?.errmsg()?;
        Some(Error::with_message(ErrorCode::Native, message))
    }

    fn native_error(b: &Bound<'p, P>, code: ErrorCode, context: &str) -> Error {
        let cause = b.errmsg().filter(|m| !m.is_empty());
        let cause = cause.as_deref().unwrap_or(UNREPORTED_ERROR);
        Error::with_message(code, format!("{context}, {cause}"))
    }

    /// Report the server version number.
    pub fn set_server_version(&self, version: i32) -> Outcome<()> {
        match &self.bound {
            Some(b) => {
                unsafe { b.api.set_server_version(b.conn, version) };
                Outcome::Applied(())
            }
            None => Outcome::Disabled,
        }
    }

    /// Report the string-literal escaping mode.
    pub fn set_standard_conforming_strings(&self, on: bool) -> Outcome<()> {
        match &self.bound {
            Some(b) => {
                unsafe { b.api.set_std_strings(b.conn, on) };
                Outcome::Applied(())
            }
            None => Outcome::Disabled,
        }
    }

    /// Forward a `ParameterStatus` message; parameters the library does not
    /// track are ignored.
    pub fn apply_parameter_status(&self, name: &str, value: &str) -> Outcome<()> {
        match name {
            "server_version" => self.set_server_version(parse_server_version(value)),
            "standard_conforming_strings" => self.set_standard_conforming_strings(value == "on"),
            _ => self.bound.as_ref().map_or(Outcome::Disabled, |_| Outcome::Applied(())),
        }
    }

    /// Drop session state kept by the native connection.
    pub fn reset(&self) -> Outcome<()> {
        match &self.bound {
            Some(b) => {
                unsafe { b.api.conn_reset(b.conn) };
                Outcome::Applied(())
            }
            None => Outcome::Disabled,
        }
    }

    /// Release scratch memory held for the message just sent.
    pub fn free_mem_manager(&self) -> Outcome<()> {
        match &self.bound {
            Some(b) => {
                unsafe { b.api.free_mem_manager() };
                Outcome::Applied(())
            }
            None => Outcome::Disabled,
        }
    }

    /// Rewrite a query before it is sent as `stmt_name`.
    ///
    /// Returns the original bytes when the library does not process queries
    /// on this connection.
    pub fn pre_query(&self, stmt_name: &CStr, query: &CStr) -> Result<Outcome<Vec<u8>>> {
        let Some(b) = &self.bound else {
            return Ok(Outcome::Disabled);
        };
        let original = query.to_bytes().to_vec();
        if !b.is_process_query() {
            return Ok(Outcome::Applied(original));
        }
        let Some(stmt) = Statement::new(b, stmt_name, Some(query), ParamBuffers::default()) else {
            return Ok(Outcome::Applied(original));
        };
        if !stmt.run_pre_query() {
            return Err(Error::from_native(ErrorCode::ClientSide, b.errmsg(), CLIENT_ERROR));
        }
        let rewritten = stmt.query();
        if rewritten.is_empty() {
            return Ok(Outcome::Applied(original));
        }
        tracing::trace!(stmt = ?stmt_name, "query rewritten");
        Ok(Outcome::Applied(rewritten.to_vec()))
    }

    /// Rewrite the parameters of `stmt_name` before execution.
    ///
    /// `None` entries in the result are SQL NULL.
    pub fn pre_exec(&self, stmt_name: &CStr, params: &[Param<'_>]) -> Result<Outcome<Vec<Option<Vec<u8>>>>> {
        let Some(b) = &self.bound else {
            return Ok(Outcome::Disabled);
        };
        let original = || params.iter().map(|p| p.value.map(<[u8]>::to_vec)).collect();
        if !b.is_process_query() {
            return Ok(Outcome::Applied(original()));
        }
        let buffers = ParamBuffers::new(params)?;
        let Some(stmt) = Statement::new(b, stmt_name, None, buffers) else {
            return Ok(Outcome::Applied(original()));
        };
        if !stmt.run_pre_exec() {
            return Err(Error::from_native(ErrorCode::ClientSide, b.errmsg(), CLIENT_ERROR));
        }
        Ok(Outcome::Applied(stmt.params()))
    }

    /// Confirm statements recorded since the last sync.
    pub fn accept_pending_statements(&self) -> Result<Outcome<()>> {
        let Some(b) = &self.bound else {
            return Ok(Outcome::Disabled);
        };
        if b.is_process_query() && !unsafe { b.api.accept_pending_statements(b.conn, true) } {
            return Err(Error::from_native(
                ErrorCode::Native,
                b.errmsg(),
                "cannot accept pending statements",
            ));
        }
        Ok(Outcome::Applied(()))
    }

    /// Handle `ReadyForQuery`; `refresh_type` is the byte following the
    /// transaction status.
    pub fn ready_for_query(&self, refresh_type: u8) -> Result<Outcome<()>> {
        let Some(b) = &self.bound else {
            return Ok(Outcome::Disabled);
        };
        let ok = unsafe {
            b.api.set_refresh_type(b.conn, i32::from(refresh_type));
            b.api.set_conn_status(b.conn, CONNECTION_ESTABLISHED);
            b.api.run_post_query(b.conn, false)
        };
        if !ok {
            tracing::debug!(refresh_type, "client logic post-query failed");
            return Err(Error::from_native(ErrorCode::Native, b.errmsg(), "client logic post-query failed"));
        }
        Ok(Outcome::Applied(()))
    }

    /// Outcome of the last encryption metadata reload.
    pub fn last_refresh_status(&self) -> Result<Outcome<()>> {
        let Some(b) = &self.bound else {
            return Ok(Outcome::Disabled);
        };
        match unsafe { b.api.last_refresh_status(b.conn) } {
            Ok(()) => Ok(Outcome::Applied(())),
            Err(message) => Err(Error::from_native(
                ErrorCode::Native,
                message,
                "Failed to load cache for client logic feature.",
            )),
        }
    }

    /// Send a request again, once, when it failed over stale encryption metadata.
    ///
    /// `retry` runs only when the library asked for a reload and the reload
    /// succeeded; its result replaces `first`.
    pub fn retry_on_stale_cache<T, E>(
        &self,
        first: core::result::Result<T, E>,
        retry: impl FnOnce() -> core::result::Result<T, E>,
    ) -> core::result::Result<T, E> {
        let Some(b) = &self.bound else {
            return first;
        };
        if first.is_ok() || !unsafe { b.api.refresh_on_error_pending(b.conn) } {
            return first;
        }
        let _guard = ResendGuard(b);
        if !unsafe { b.api.pre_check_resend(b.conn) } {
            return first;
        }
        tracing::debug!("resending after encryption metadata reload");
        retry()
    }

    /// Decode protected values in a server error detail.
    ///
    /// `Applied(None)` means the detail should be shown as received.
    pub fn error_detail(&self, detail: &str) -> Outcome<Option<String>> {
        let Some(b) = &self.bound else {
            return Outcome::Disabled;
        };
        let Ok(detail) = CString::new(detail) else {
            return Outcome::Applied(None);
        };
        let decoded = unsafe { b.api.deprocess_error_detail(b.conn, &detail) };
        Outcome::Applied(decoded.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Map an error position in the rewritten query back to the query the
    /// caller sent; `Applied(None)` keeps the position as received.
    pub fn error_position(&self, position: &str) -> Outcome<Option<i32>> {
        let Some(b) = &self.bound else {
            return Outcome::Disabled;
        };
        let Ok(processed) = position.trim().parse::<i32>() else {
            return Outcome::Applied(None);
        };
        let mapped = unsafe { b.api.deprocessed_position(b.conn, processed) };
        Outcome::Applied((mapped >= 0).then_some(mapped))
    }

    /// Process the fields of a server error, in wire order.
    ///
    /// Every field is shown to the library so it can tell whether the error
    /// calls for a metadata reload. Detail (`D`) and position (`P`) values are
    /// rewritten in place.
    pub fn process_server_error(&self, fields: &mut [(u8, String)]) -> Outcome<()> {
        let Some(b) = &self.bound else {
            return Outcome::Disabled;
        };
        let scratch = RefreshParams::new(b);
        for (code, value) in fields.iter_mut() {
            if let (Some(scratch), Ok(text)) = (&scratch, CString::new(value.as_str())) {
                scratch.read(*code, &text);
            }
            match *code {
                b'D' => {
                    if let Outcome::Applied(Some(detail)) = self.error_detail(value) {
                        *value = detail;
                    }
                }
                b'P' => {
                    if let Outcome::Applied(Some(pos)) = self.error_position(value) {
                        *value = pos.to_string();
                    }
                }
                _ => {}
            }
        }
        Outcome::Applied(())
    }

    /// A value decoder for this connection.
    pub fn deprocessor(&self, output_binary: bool) -> Result<Outcome<Deprocessor<'_, 'p, P>>> {
        let Some(b) = &self.bound else {
            return Ok(Outcome::Disabled);
        };
        match Deprocessor::new(b, output_binary) {
            Some(d) => Ok(Outcome::Applied(d)),
            None => Err(Error::with_message(ErrorCode::Native, "cannot create value decoder")),
        }
    }

    /// Decode one protected value with a short-lived decoder.
    ///
    /// `Applied(None)` means "use the raw value".
    pub fn deprocess_value(
        &self,
        processed: Option<&[u8]>,
        type_oid: u32,
        output_binary: bool,
    ) -> Outcome<Option<OwnedBuffer>> {
        let Some(b) = &self.bound else {
            return Outcome::Disabled;
        };
        let Some(processed) = processed.filter(|bytes| !bytes.is_empty()) else {
            return Outcome::Applied(None);
        };
        let decoded = Deprocessor::new(b, output_binary).and_then(|d| d.decode(processed, type_oid));
        Outcome::Applied(decoded)
    }

    /// Decode a protected record of type `type_oid` returned by `function_name`.
    ///
    /// `Applied(None)` means "use the raw value", including when nothing in
    /// the record was decrypted.
    pub fn deprocess_record(
        &self,
        processed: Option<&[u8]>,
        type_oid: u32,
        function_name: &CStr,
        output_binary: bool,
    ) -> Outcome<Option<OwnedBuffer>> {
        let Some(b) = &self.bound else {
            return Outcome::Disabled;
        };
        let Some(processed) = processed.filter(|bytes| !bytes.is_empty()) else {
            return Outcome::Applied(None);
        };
        let Some(ids) = (unsafe { b.api.record_original_ids(b.conn, type_oid, function_name) }) else {
            return Outcome::Applied(None);
        };
        let format = b.formats.format(output_binary);
        let decoded = unsafe { b.api.deprocess_record(b.conn, processed, &ids, format) };
        Outcome::Applied(decoded.and_then(|(buf, decrypted)| decrypted.then_some(buf)))
    }

    /// Hand the server's key exchange tokens to the library and return the
    /// client token to send back.
    pub fn exchange_keys(&self, rsa: &str, ecdh: &str) -> Result<Outcome<Vec<u8>>> {
        let Some(b) = &self.bound else {
            return Ok(Outcome::Disabled);
        };
        if rsa.is_empty() || ecdh.is_empty() {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "rsa_token or ecdh_token from server is empty!",
            ));
        }
        let to_c = |text: &str| {
            CString::new(text).map_err(|_| Error::with_message(ErrorCode::Misuse, "key token contains NUL"))
        };
        let (rsa, ecdh) = (to_c(rsa)?, to_c(ecdh)?);
        if !unsafe { b.api.set_server_keys(b.conn, &rsa, &ecdh) } {
            return Err(Self::native_error(
                b,
                ErrorCode::Native,
                "failed to generate client ecdh token from libpq_ce",
            ));
        }
        match unsafe { b.api.client_key(b.conn) } {
            Some(raw) => Ok(Outcome::Applied(unsafe { raw.as_slice() }.to_vec())),
            None => Err(Self::native_error(
                b,
                ErrorCode::Native,
                "failed to get client ecdh token from libpq_ce",
            )),
        }
    }

    /// Forget exchanged keys; reports whether the library had any.
    pub fn clear_client_keys(&self) -> Outcome<bool> {
        match &self.bound {
            Some(b) => Outcome::Applied(unsafe { b.api.clear_client_keys(b.conn) }),
            None => Outcome::Disabled,
        }
    }

    /// Column encryption keys fetched for the current session.
    ///
    /// An empty list means the library fetched none; its message is logged.
    pub fn fetch_ceks(&self) -> Result<Outcome<Vec<CachedCek>>> {
        let Some(b) = &self.bound else {
            return Ok(Outcome::Disabled);
        };
        let count = unsafe { b.api.fetched_columns(b.conn) };
        if count == 0 {
            let message = b.errmsg().unwrap_or_else(|| UNREPORTED_ERROR.to_owned());
            tracing::warn!(%message, "no column encryption keys fetched");
            return Ok(Outcome::Applied(Vec::new()));
        }
        if count < 0 {
            return Err(Self::native_error(b, ErrorCode::Native, "when fetch column ceks"));
        }
        match unsafe { b.api.cached_ceks(b.conn, count as usize) } {
            Some(ceks) => Ok(Outcome::Applied(ceks)),
            None => Err(Self::native_error(
                b,
                ErrorCode::Native,
                "failed to get cached ceks from pgconn",
            )),
        }
    }

    /// Protect one chunk of `COPY FROM STDIN` data.
    pub fn process_copy_chunk(&self, chunk: &[u8]) -> Outcome<CopyChunk> {
        match &self.bound {
            Some(b) => Outcome::Applied(unsafe { b.api.process_copy_chunk(b.conn, chunk) }),
            None => Outcome::Disabled,
        }
    }
}

impl<'p, P: ClientLogicApi> Drop for ClientLogic<'p, P> {
    fn drop(&mut self) {
        if let Some(b) = self.bound.take() {
            unsafe { b.api.conn_free(b.conn) };
            tracing::debug!("client logic connection freed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Outcome, parse_server_version};

    #[test]
    fn outcome_helpers() {
        assert!(Outcome::<i32>::Disabled.is_disabled());
        assert_eq!(Outcome::Applied(2).map(|v| v * 2), Outcome::Applied(4));
        assert_eq!(Outcome::Disabled.unwrap_or(7), 7);
        assert_eq!(Outcome::Applied(1).applied(), Some(1));
    }

    #[test]
    fn server_versions() {
        assert_eq!(parse_server_version("9.2.4"), 90204);
        assert_eq!(parse_server_version("9.2"), 90200);
        assert_eq!(parse_server_version("10.1.0 (openGauss)"), 100100);
        assert_eq!(parse_server_version("9.2beta1"), 90200);
        assert_eq!(parse_server_version("x"), 0);
    }
}
