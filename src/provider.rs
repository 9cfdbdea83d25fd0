use core::ffi::CStr;
use core::ptr::NonNull;

use crate::buffer::{OwnedBuffer, RawBytes};
use crate::cursor::CursorCallbacks;
use crate::statement::ParamBuffers;

/// Destructor the native cursor factory hands back with the cursor it built.
pub type CursorDeallocator<C> = unsafe extern "C" fn(*mut C);

/// Arguments of the native connection constructor.
#[derive(Clone, Debug, Default)]
pub struct ConnectParams {
    /// Session user.
    pub user: String,
    /// Current database.
    pub database: String,
    /// Application name reported to the server.
    pub application_name: String,
    /// Value of the driver's client-encryption setting; `0` leaves protection off.
    pub enable_client_encryption: i32,
}

impl ConnectParams {
    /// Parameters with client encryption turned on.
    pub fn new(user: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            database: database.into(),
            application_name: String::new(),
            enable_client_encryption: 1,
        }
    }

    /// Set the application name.
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Set the raw client-encryption flag.
    pub fn with_client_encryption(mut self, flag: i32) -> Self {
        self.enable_client_encryption = flag;
        self
    }
}

/// What the library did with one chunk of `COPY FROM STDIN` data.
#[derive(Debug)]
pub enum CopyChunk {
    /// Send the chunk as given.
    Unchanged,
    /// Send these bytes instead.
    Replaced(OwnedBuffer),
    /// Send nothing for this chunk.
    Withheld,
}

/// Column encryption key fetched from the server and re-wrapped by the library.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedCek {
    /// Key object id.
    pub oid: u32,
    /// Encryption algorithm code.
    pub algorithm: i32,
    /// Wrapped key bytes.
    pub key: Vec<u8>,
}

/// Procedure table of the client-side encryption library.
///
/// One method per native entry point (two for the few entry points whose
/// results are read in pairs); implementations forward without applying
/// policy. Native integer flags come back as `bool`. Handles are opaque and
/// only valid for the implementation that produced them.
///
/// # Safety
/// Implementations must honour the pointer contracts of every method: handles
/// passed in were produced by the same implementation and are still live, and
/// every returned [`OwnedBuffer`] carries the release function matching its
/// allocator.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait ClientLogicApi: Send + Sync {
    /// Native connection state.
    type Conn;
    /// Native pending-statement record.
    type Stmt;
    /// Native cursor interface wrapping exported callbacks.
    type Cursor;
    /// Reusable value decoder.
    type Deprocess;
    /// Scratch state filled while reading a server error.
    type RefreshParams;

    /// Short identifier of the implementation.
    fn backend_name(&self) -> &'static str;

    /// Wrap exported callbacks in a native cursor.
    ///
    /// On `None` the library never took the callbacks; the caller still owns
    /// the context.
    unsafe fn new_cursor(
        &self,
        callbacks: &CursorCallbacks,
    ) -> Option<(NonNull<Self::Cursor>, CursorDeallocator<Self::Cursor>)>;
    /// Create a native connection that reads rows through `cursor`.
    ///
    /// # Ownership contract
    /// Ownership of `cursor` transfers to the library at call entry, whether
    /// or not a connection comes back; the library calls `deallocator` once.
    unsafe fn conn_init(
        &self,
        params: &ConnectParams,
        cursor: NonNull<Self::Cursor>,
        deallocator: CursorDeallocator<Self::Cursor>,
    ) -> Option<NonNull<Self::Conn>>;
    /// Free a native connection and its cursor.
    unsafe fn conn_free(&self, conn: NonNull<Self::Conn>);
    /// Drop per-session state but keep the cursor.
    unsafe fn conn_reset(&self, conn: NonNull<Self::Conn>);
    /// Message of the last failure on `conn`; `None` when empty.
    unsafe fn errmsg(&self, conn: NonNull<Self::Conn>) -> Option<String>;
    /// Report the server version number (e.g. `90204`).
    unsafe fn set_server_version(&self, conn: NonNull<Self::Conn>, version: i32);
    /// Report whether the server uses standard-conforming string literals.
    unsafe fn set_std_strings(&self, conn: NonNull<Self::Conn>, on: bool);
    /// Report the connection status code.
    unsafe fn set_conn_status(&self, conn: NonNull<Self::Conn>, status: i32);
    /// Whether queries on `conn` go through the library at all.
    unsafe fn is_process_query(&self, conn: NonNull<Self::Conn>) -> bool;
    /// Release scratch memory the library kept for the last message.
    unsafe fn free_mem_manager(&self);
    /// Numeric value of a named library enum constant (e.g. `Deprocess::VALUE_RAW`).
    unsafe fn enum_value(&self, name: &CStr) -> i32;

    /// Create a pending-statement record.
    ///
    /// `params` must stay alive and unmoved until [`ClientLogicApi::stmt_free`].
    unsafe fn stmt_new(
        &self,
        conn: NonNull<Self::Conn>,
        name: &CStr,
        query: Option<&CStr>,
        params: &ParamBuffers,
        direct_flow: bool,
    ) -> Option<NonNull<Self::Stmt>>;
    /// Rewrite the statement's query text.
    unsafe fn run_pre_query(&self, stmt: NonNull<Self::Stmt>, inner: bool) -> bool;
    /// Rewrite the statement's parameters.
    unsafe fn run_pre_exec(&self, stmt: NonNull<Self::Stmt>) -> bool;
    /// Current (possibly rewritten) statement text.
    unsafe fn stmt_query(&self, stmt: NonNull<Self::Stmt>) -> RawBytes;
    /// Number of parameters after rewriting.
    unsafe fn stmt_param_count(&self, stmt: NonNull<Self::Stmt>) -> usize;
    /// Parameter `idx` after rewriting; `None` for NULL.
    unsafe fn stmt_param(&self, stmt: NonNull<Self::Stmt>, idx: usize) -> Option<RawBytes>;
    /// Free a pending-statement record.
    unsafe fn stmt_free(&self, stmt: NonNull<Self::Stmt>);
    /// Accept or discard statements awaiting server confirmation.
    unsafe fn accept_pending_statements(&self, conn: NonNull<Self::Conn>, accept: bool) -> bool;

    /// Record the `ReadyForQuery` transaction status byte.
    unsafe fn set_refresh_type(&self, conn: NonNull<Self::Conn>, refresh: i32);
    /// Finish a query; reloads metadata when the query changed it.
    unsafe fn run_post_query(&self, conn: NonNull<Self::Conn>, force_error: bool) -> bool;
    /// Outcome of the last metadata reload; `Err` carries the library's message.
    unsafe fn last_refresh_status(
        &self,
        conn: NonNull<Self::Conn>,
    ) -> core::result::Result<(), Option<String>>;
    /// Whether the last server error asked for a metadata reload.
    unsafe fn refresh_on_error_pending(&self, conn: NonNull<Self::Conn>) -> bool;
    /// Reload metadata after an error; true when the query should be sent again.
    unsafe fn pre_check_resend(&self, conn: NonNull<Self::Conn>) -> bool;
    /// Clear the resend state set by [`ClientLogicApi::pre_check_resend`].
    unsafe fn post_check_resend(&self, conn: NonNull<Self::Conn>);

    /// Allocate scratch state for reading one server error.
    unsafe fn new_refresh_params(&self) -> Option<NonNull<Self::RefreshParams>>;
    /// Free scratch state.
    unsafe fn free_refresh_params(&self, params: NonNull<Self::RefreshParams>);
    /// Feed one server error field to the library.
    unsafe fn read_error_field(
        &self,
        conn: NonNull<Self::Conn>,
        params: NonNull<Self::RefreshParams>,
        field: u8,
        value: &CStr,
    );
    /// Decode protected values in an error detail; `None` when nothing changed.
    unsafe fn deprocess_error_detail(&self, conn: NonNull<Self::Conn>, detail: &CStr) -> Option<Vec<u8>>;
    /// Map an error position in the rewritten query back to the original text.
    unsafe fn deprocessed_position(&self, conn: NonNull<Self::Conn>, processed: i32) -> i32;

    /// Create a value decoder.
    unsafe fn deprocess_new(
        &self,
        value_kind: i32,
        input_format: i32,
        output_format: i32,
    ) -> Option<NonNull<Self::Deprocess>>;
    /// Attach a decoder to `conn`.
    unsafe fn deprocess_set_conn(&self, deprocess: NonNull<Self::Deprocess>, conn: NonNull<Self::Conn>);
    /// Decode one value declared as `type_oid`; `None` when not decoded.
    unsafe fn deprocess(
        &self,
        deprocess: NonNull<Self::Deprocess>,
        processed: &[u8],
        type_oid: u32,
    ) -> Option<OwnedBuffer>;
    /// Free a value decoder.
    unsafe fn deprocess_free(&self, deprocess: NonNull<Self::Deprocess>);
    /// Original column types of record type `type_oid` as returned by `function_name`.
    unsafe fn record_original_ids(
        &self,
        conn: NonNull<Self::Conn>,
        type_oid: u32,
        function_name: &CStr,
    ) -> Option<Vec<i32>>;
    /// Decode a record; the flag reports whether anything was decrypted.
    unsafe fn deprocess_record(
        &self,
        conn: NonNull<Self::Conn>,
        processed: &[u8],
        original_ids: &[i32],
        format: i32,
    ) -> Option<(OwnedBuffer, bool)>;

    /// Verify the server's key exchange tokens and derive the session key.
    unsafe fn set_server_keys(&self, conn: NonNull<Self::Conn>, rsa: &CStr, ecdh: &CStr) -> bool;
    /// Library-owned client key exchange token.
    unsafe fn client_key(&self, conn: NonNull<Self::Conn>) -> Option<RawBytes>;
    /// Forget the exchanged keys.
    unsafe fn clear_client_keys(&self, conn: NonNull<Self::Conn>) -> bool;
    /// Number of fetched column encryption keys; `-1` on failure.
    unsafe fn fetched_columns(&self, conn: NonNull<Self::Conn>) -> i32;
    /// Copy the first `count` fetched column encryption keys.
    unsafe fn cached_ceks(&self, conn: NonNull<Self::Conn>, count: usize) -> Option<Vec<CachedCek>>;

    /// Protect one chunk of `COPY FROM STDIN` data.
    unsafe fn process_copy_chunk(&self, conn: NonNull<Self::Conn>, chunk: &[u8]) -> CopyChunk;
}
