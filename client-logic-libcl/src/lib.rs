//! Dynamic `libpq_ce` backend for `client-logic`.
//!
//! Every entry point is declared below with its C signature and resolved by
//! exact name when the library is loaded. Resolution cannot check signatures:
//! a library exporting a symbol with a different prototype is undefined
//! behaviour that this layer cannot detect.

mod loader;

use client_logic::{
    CachedCek, ClientLogicApi, ConnectParams, CopyChunk, CursorCallbacks, CursorDeallocator,
    OwnedBuffer, ParamBuffers, RawBytes, ReleaseFn,
};
use libc::{c_char, c_int, c_uint, c_ulong, c_void, size_t};
use std::ffi::CStr;
use std::ptr::{NonNull, null, null_mut};

pub use loader::{DlHandle, LIBRARY_ENV, LoadError, Loader, LoaderConfig, SymbolSource};

type Oid = c_uint;

macro_rules! opaque {
    ($($(#[$meta:meta])* $name:ident;)*) => {$(
        $(#[$meta])*
        #[repr(C)]
        pub struct $name {
            _opaque: [u8; 0],
        }
    )*};
}

opaque! {
    /// Native connection state.
    PGconn;
    /// Client-logic state owned by a [`PGconn`].
    PGClientLogic;
    /// Pending statement record.
    StatementData;
    /// Value decoder.
    Deprocess;
    /// Cursor wrapping the driver's callbacks.
    CursorInterface;
    /// Scratch state for reading one server error.
    CLRefreshParams;
}

type CursorOper = unsafe extern "C" fn(*mut c_void, c_int) -> *const c_char;
type CursorLoad = unsafe extern "C" fn(*mut c_void, *const c_char) -> c_int;
type CursorCount = unsafe extern "C" fn(*mut c_void) -> c_int;
type CursorColumn = unsafe extern "C" fn(*mut c_void, *const c_char) -> c_int;
type CursorVoid = unsafe extern "C" fn(*mut c_void);

/// Results of the library that the caller owns are released with the C allocator.
const RELEASE: ReleaseFn = libc::free;

struct LibClientLogicFns {
    get_rec_origial_ids: unsafe extern "C" fn(*mut PGconn, c_uint, *const c_char) -> *const c_int,
    get_rec_origial_ids_length: unsafe extern "C" fn(*mut PGconn, c_uint, *const c_char) -> size_t,
    de_process_record: unsafe extern "C" fn(
        *mut PGconn,
        *const c_char,
        c_ulong,
        *const c_int,
        c_ulong,
        c_int,
        *mut *mut u8,
        *mut c_ulong,
        *mut c_int,
    ) -> c_int,
    deprocess_set_conn_c: unsafe extern "C" fn(*mut Deprocess, *mut PGconn),
    get_deprocessed_c:
        unsafe extern "C" fn(*mut Deprocess, *const u8, size_t, c_uint, *mut *mut u8, *mut size_t) -> c_int,
    processor_run_pre_query_c: unsafe extern "C" fn(*mut StatementData, c_int, *mut c_int) -> c_int,
    delete_statementdata_c: unsafe extern "C" fn(*mut StatementData),
    run_pre_exec_c: unsafe extern "C" fn(*mut StatementData) -> c_int,
    free_mem_manager: unsafe extern "C" fn(),
    accept_pending_statements_c: unsafe extern "C" fn(*mut PGconn, c_int) -> c_int,
    new_deprocess: unsafe extern "C" fn(c_int, c_int, c_int) -> *mut Deprocess,
    delete_deprocess: unsafe extern "C" fn(*mut Deprocess),
    run_post_query_c: unsafe extern "C" fn(*mut PGconn, c_int) -> c_int,
    process_copy_chunk: unsafe extern "C" fn(*mut PGconn, *const c_char, c_int, *mut *mut c_char) -> c_int,
    is_any_refresh_cache_on_error: unsafe extern "C" fn(*mut PGconn) -> c_int,
    pre_check_resend_query_on_error: unsafe extern "C" fn(*mut PGconn) -> c_int,
    post_check_resend_query_on_error: unsafe extern "C" fn(*mut PGconn),
    clientlogic_read_error:
        unsafe extern "C" fn(*mut PGClientLogic, c_char, *const c_char, *mut CLRefreshParams),
    deprocess_error_detail_c: unsafe extern "C" fn(*mut PGconn, *const c_char, *mut c_char) -> c_int,
    new_statementdata_c: unsafe extern "C" fn(
        *mut PGconn,
        *const c_char,
        *const c_char,
        size_t,
        *const Oid,
        *const *const c_char,
        *const c_int,
        *const c_int,
        c_int,
    ) -> *mut StatementData,
    statement_data_get_params_count: unsafe extern "C" fn(*mut StatementData) -> size_t,
    processed_query_pos_to_deprocessed_c: unsafe extern "C" fn(*mut PGconn, c_int) -> c_int,
    statement_data_get_params_values: unsafe extern "C" fn(*mut StatementData) -> *const *const c_char,
    statement_data_get_params_lengths: unsafe extern "C" fn(*mut StatementData) -> *mut c_int,
    statement_data_get_query: unsafe extern "C" fn(*mut StatementData) -> *const c_char,
    set_cl_rfq_cache_refresh_type: unsafe extern "C" fn(*mut PGconn, c_int),
    set_conn_status: unsafe extern "C" fn(*mut PGconn, c_int),
    is_process_query: unsafe extern "C" fn(*mut PGconn) -> c_int,
    new_cl_refresh_params: unsafe extern "C" fn() -> *mut CLRefreshParams,
    delete_cl_refresh_params: unsafe extern "C" fn(*mut CLRefreshParams),
    clientlogic_pgconn_init: unsafe extern "C" fn(
        *const c_char,
        size_t,
        *const c_char,
        size_t,
        *const c_char,
        size_t,
        *mut CursorInterface,
        CursorDeallocator<CursorInterface>,
        c_int,
    ) -> *mut PGconn,
    clientlogic_pgconn_free: unsafe extern "C" fn(*mut PGconn),
    pgconn_errmsg: unsafe extern "C" fn(*mut PGconn) -> *mut c_char,
    pgconn_setserverversion: unsafe extern "C" fn(*mut PGconn, c_int),
    pgconn_setstdstrings: unsafe extern "C" fn(*mut PGconn, c_int),
    clientlogic_pgconn_reset: unsafe extern "C" fn(*mut PGconn),
    get_enum_val_by_string: unsafe extern "C" fn(*const c_char) -> c_int,
    get_client_logic: unsafe extern "C" fn(*mut PGconn) -> *mut PGClientLogic,
    get_new_driver_cursor: unsafe extern "C" fn(
        *mut c_void,
        CursorVoid,
        CursorOper,
        CursorLoad,
        CursorCount,
        CursorColumn,
        CursorVoid,
        CursorCount,
        *mut Option<CursorDeallocator<CursorInterface>>,
    ) -> *mut CursorInterface,
    get_last_refresh_cache_status: unsafe extern "C" fn(*mut PGconn, *mut *mut c_char) -> c_int,
    clear_client_keys_c: unsafe extern "C" fn(*mut PGconn) -> c_int,
    set_key_to_client_logic_c:
        unsafe extern "C" fn(*mut PGconn, size_t, size_t, *mut c_char, *mut c_char) -> c_int,
    get_client_key_c: unsafe extern "C" fn(*mut PGconn, *mut *mut c_char, *mut size_t) -> c_int,
    fetched_columns_c: unsafe extern "C" fn(*mut PGconn) -> c_int,
    get_cached_ceks_c: unsafe extern "C" fn(
        *mut PGconn,
        *mut *mut Oid,
        *mut *mut c_int,
        *mut *mut c_int,
        *mut *mut *mut c_char,
    ) -> c_int,
}

unsafe fn symbol<S, T>(lib: &S, name: &'static CStr) -> Result<T, LoadError>
where
    S: SymbolSource,
    T: Copy,
{
    let sym = unsafe { lib.symbol(name) };
    if sym.is_null() {
        return Err(LoadError::MissingSymbol(name.to_string_lossy().into_owned()));
    }
    debug_assert_eq!(std::mem::size_of::<T>(), std::mem::size_of::<*mut c_void>());
    Ok(unsafe { std::mem::transmute_copy(&sym) })
}

impl LibClientLogicFns {
    unsafe fn load<S: SymbolSource>(lib: &S) -> Result<Self, LoadError> {
        unsafe {
            Ok(Self {
                get_rec_origial_ids: symbol(lib, c"get_rec_origial_ids")?,
                get_rec_origial_ids_length: symbol(lib, c"get_rec_origial_ids_length")?,
                de_process_record: symbol(lib, c"de_process_record")?,
                deprocess_set_conn_c: symbol(lib, c"deprocess_set_conn_c")?,
                get_deprocessed_c: symbol(lib, c"get_deprocessed_c")?,
                processor_run_pre_query_c: symbol(lib, c"processor_run_pre_query_c")?,
                delete_statementdata_c: symbol(lib, c"delete_statementdata_c")?,
                run_pre_exec_c: symbol(lib, c"run_pre_exec_c")?,
                free_mem_manager: symbol(lib, c"free_mem_manager")?,
                accept_pending_statements_c: symbol(lib, c"accept_pending_statements_c")?,
                new_deprocess: symbol(lib, c"new_deprocess")?,
                delete_deprocess: symbol(lib, c"delete_deprocess")?,
                run_post_query_c: symbol(lib, c"run_post_query_c")?,
                process_copy_chunk: symbol(lib, c"process_copy_chunk")?,
                is_any_refresh_cache_on_error: symbol(lib, c"is_any_refresh_cache_on_error")?,
                pre_check_resend_query_on_error: symbol(lib, c"pre_check_resend_query_on_error")?,
                post_check_resend_query_on_error: symbol(lib, c"post_check_resend_query_on_error")?,
                clientlogic_read_error: symbol(lib, c"clientlogic_read_error")?,
                deprocess_error_detail_c: symbol(lib, c"deprocess_error_detail_c")?,
                new_statementdata_c: symbol(lib, c"new_statementdata_c")?,
                statement_data_get_params_count: symbol(lib, c"statement_data_get_params_count")?,
                processed_query_pos_to_deprocessed_c: symbol(
                    lib,
                    c"processed_query_pos_to_deprocessed_c",
                )?,
                statement_data_get_params_values: symbol(lib, c"statement_data_get_params_values")?,
                statement_data_get_params_lengths: symbol(lib, c"statement_data_get_params_lengths")?,
                statement_data_get_query: symbol(lib, c"statement_data_get_query")?,
                set_cl_rfq_cache_refresh_type: symbol(lib, c"set_cl_rfq_cache_refresh_type")?,
                set_conn_status: symbol(lib, c"set_conn_status")?,
                is_process_query: symbol(lib, c"is_process_query")?,
                new_cl_refresh_params: symbol(lib, c"new_cl_refresh_params")?,
                delete_cl_refresh_params: symbol(lib, c"delete_cl_refresh_params")?,
                clientlogic_pgconn_init: symbol(lib, c"clientlogic_pgconn_init")?,
                clientlogic_pgconn_free: symbol(lib, c"clientlogic_pgconn_free")?,
                pgconn_errmsg: symbol(lib, c"pgconn_errmsg")?,
                pgconn_setserverversion: symbol(lib, c"pgconn_setserverversion")?,
                pgconn_setstdstrings: symbol(lib, c"pgconn_setstdstrings")?,
                clientlogic_pgconn_reset: symbol(lib, c"clientlogic_pgconn_reset")?,
                get_enum_val_by_string: symbol(lib, c"get_enum_val_by_string")?,
                get_client_logic: symbol(lib, c"get_client_logic")?,
                get_new_driver_cursor: symbol(lib, c"get_new_driver_cursor")?,
                get_last_refresh_cache_status: symbol(lib, c"get_last_refresh_cache_status")?,
                clear_client_keys_c: symbol(lib, c"clear_client_keys_c")?,
                set_key_to_client_logic_c: symbol(lib, c"set_key_to_client_logic_c")?,
                get_client_key_c: symbol(lib, c"get_client_key_c")?,
                fetched_columns_c: symbol(lib, c"fetched_columns_c")?,
                get_cached_ceks_c: symbol(lib, c"get_cached_ceks_c")?,
            })
        }
    }
}

/// Dynamic `libpq_ce` adapter.
///
/// Only obtainable from a successful load, so every procedure it exposes is
/// resolved. Use [`Loader`] to create one.
pub struct LibClientLogic<S: SymbolSource = DlHandle> {
    fns: LibClientLogicFns,
    _lib: S,
}

impl<S: SymbolSource> LibClientLogic<S> {
    pub(crate) unsafe fn open(config: &LoaderConfig) -> Result<Self, LoadError> {
        let lib = unsafe { S::open(&config.library_names)? };
        let fns = unsafe { LibClientLogicFns::load(&lib)? };
        Ok(Self { fns, _lib: lib })
    }
}

unsafe fn raw_cstr<'a>(ptr: *const c_char) -> Option<&'a CStr> {
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(ptr) })
    }
}

unsafe fn owned_text(ptr: *const c_char) -> Option<String> {
    let text = unsafe { raw_cstr(ptr)? };
    (!text.is_empty()).then(|| text.to_string_lossy().into_owned())
}

unsafe impl<S: SymbolSource> ClientLogicApi for LibClientLogic<S> {
    type Conn = PGconn;
    type Stmt = StatementData;
    type Cursor = CursorInterface;
    type Deprocess = Deprocess;
    type RefreshParams = CLRefreshParams;

    fn backend_name(&self) -> &'static str {
        "libpq_ce"
    }

    unsafe fn new_cursor(
        &self,
        cb: &CursorCallbacks,
    ) -> Option<(NonNull<CursorInterface>, CursorDeallocator<CursorInterface>)> {
        let mut deallocator = None;
        let cursor = unsafe {
            (self.fns.get_new_driver_cursor)(
                cb.ctx,
                cb.destructor,
                cb.get,
                cb.load,
                cb.next,
                cb.column_index,
                cb.clear,
                cb.row_count,
                &mut deallocator,
            )
        };
        let cursor = NonNull::new(cursor)?;
        match deallocator {
            Some(deallocator) => Some((cursor, deallocator)),
            None => {
                tracing::warn!("driver cursor created without a deallocator");
                None
            }
        }
    }

    unsafe fn conn_init(
        &self,
        params: &ConnectParams,
        cursor: NonNull<CursorInterface>,
        deallocator: CursorDeallocator<CursorInterface>,
    ) -> Option<NonNull<PGconn>> {
        let texts = [&params.user, &params.database, &params.application_name]
            .map(|text| std::ffi::CString::new(text.as_str()));
        let [Ok(user), Ok(database), Ok(application)] = texts else {
            // The cursor is ours to release once this call is made.
            unsafe { deallocator(cursor.as_ptr()) };
            return None;
        };
        let conn = unsafe {
            (self.fns.clientlogic_pgconn_init)(
                user.as_ptr(),
                params.user.len(),
                database.as_ptr(),
                params.database.len(),
                application.as_ptr(),
                params.application_name.len(),
                cursor.as_ptr(),
                deallocator,
                params.enable_client_encryption,
            )
        };
        NonNull::new(conn)
    }

    unsafe fn conn_free(&self, conn: NonNull<PGconn>) {
        unsafe { (self.fns.clientlogic_pgconn_free)(conn.as_ptr()) }
    }

    unsafe fn conn_reset(&self, conn: NonNull<PGconn>) {
        unsafe { (self.fns.clientlogic_pgconn_reset)(conn.as_ptr()) }
    }

    unsafe fn errmsg(&self, conn: NonNull<PGconn>) -> Option<String> {
        unsafe { owned_text((self.fns.pgconn_errmsg)(conn.as_ptr())) }
    }

    unsafe fn set_server_version(&self, conn: NonNull<PGconn>, version: i32) {
        unsafe { (self.fns.pgconn_setserverversion)(conn.as_ptr(), version) }
    }

    unsafe fn set_std_strings(&self, conn: NonNull<PGconn>, on: bool) {
        unsafe { (self.fns.pgconn_setstdstrings)(conn.as_ptr(), c_int::from(on)) }
    }

    unsafe fn set_conn_status(&self, conn: NonNull<PGconn>, status: i32) {
        unsafe { (self.fns.set_conn_status)(conn.as_ptr(), status) }
    }

    unsafe fn is_process_query(&self, conn: NonNull<PGconn>) -> bool {
        unsafe { (self.fns.is_process_query)(conn.as_ptr()) != 0 }
    }

    unsafe fn free_mem_manager(&self) {
        unsafe { (self.fns.free_mem_manager)() }
    }

    unsafe fn enum_value(&self, name: &CStr) -> i32 {
        unsafe { (self.fns.get_enum_val_by_string)(name.as_ptr()) }
    }

    unsafe fn stmt_new(
        &self,
        conn: NonNull<PGconn>,
        name: &CStr,
        query: Option<&CStr>,
        params: &ParamBuffers,
        direct_flow: bool,
    ) -> Option<NonNull<StatementData>> {
        let stmt = unsafe {
            (self.fns.new_statementdata_c)(
                conn.as_ptr(),
                name.as_ptr(),
                query.map_or(null(), CStr::as_ptr),
                params.len(),
                null(),
                params.values_ptr(),
                params.lengths_ptr(),
                params.formats_ptr(),
                c_int::from(direct_flow),
            )
        };
        NonNull::new(stmt)
    }

    unsafe fn run_pre_query(&self, stmt: NonNull<StatementData>, inner: bool) -> bool {
        unsafe { (self.fns.processor_run_pre_query_c)(stmt.as_ptr(), c_int::from(inner), null_mut()) != 0 }
    }

    unsafe fn run_pre_exec(&self, stmt: NonNull<StatementData>) -> bool {
        unsafe { (self.fns.run_pre_exec_c)(stmt.as_ptr()) != 0 }
    }

    unsafe fn stmt_query(&self, stmt: NonNull<StatementData>) -> RawBytes {
        match unsafe { raw_cstr((self.fns.statement_data_get_query)(stmt.as_ptr())) } {
            Some(text) => RawBytes {
                ptr: text.as_ptr() as *const u8,
                len: text.to_bytes().len(),
            },
            None => RawBytes::empty(),
        }
    }

    unsafe fn stmt_param_count(&self, stmt: NonNull<StatementData>) -> usize {
        unsafe { (self.fns.statement_data_get_params_count)(stmt.as_ptr()) }
    }

    unsafe fn stmt_param(&self, stmt: NonNull<StatementData>, idx: usize) -> Option<RawBytes> {
        let values = unsafe { (self.fns.statement_data_get_params_values)(stmt.as_ptr()) };
        if values.is_null() {
            return None;
        }
        let value = unsafe { *values.add(idx) };
        if value.is_null() {
            return None;
        }
        let lengths = unsafe { (self.fns.statement_data_get_params_lengths)(stmt.as_ptr()) };
        let len = if lengths.is_null() {
            unsafe { CStr::from_ptr(value) }.to_bytes().len()
        } else {
            usize::try_from(unsafe { *lengths.add(idx) }).unwrap_or(0)
        };
        Some(RawBytes { ptr: value as *const u8, len })
    }

    unsafe fn stmt_free(&self, stmt: NonNull<StatementData>) {
        unsafe { (self.fns.delete_statementdata_c)(stmt.as_ptr()) }
    }

    unsafe fn accept_pending_statements(&self, conn: NonNull<PGconn>, accept: bool) -> bool {
        unsafe { (self.fns.accept_pending_statements_c)(conn.as_ptr(), c_int::from(accept)) == 0 }
    }

    unsafe fn set_refresh_type(&self, conn: NonNull<PGconn>, refresh: i32) {
        unsafe { (self.fns.set_cl_rfq_cache_refresh_type)(conn.as_ptr(), refresh) }
    }

    unsafe fn run_post_query(&self, conn: NonNull<PGconn>, force_error: bool) -> bool {
        unsafe { (self.fns.run_post_query_c)(conn.as_ptr(), c_int::from(force_error)) != 0 }
    }

    unsafe fn last_refresh_status(&self, conn: NonNull<PGconn>) -> Result<(), Option<String>> {
        let mut message = null_mut();
        let ok = unsafe { (self.fns.get_last_refresh_cache_status)(conn.as_ptr(), &mut message) };
        if ok != 0 {
            Ok(())
        } else {
            Err(unsafe { owned_text(message) })
        }
    }

    unsafe fn refresh_on_error_pending(&self, conn: NonNull<PGconn>) -> bool {
        unsafe { (self.fns.is_any_refresh_cache_on_error)(conn.as_ptr()) != 0 }
    }

    unsafe fn pre_check_resend(&self, conn: NonNull<PGconn>) -> bool {
        unsafe { (self.fns.pre_check_resend_query_on_error)(conn.as_ptr()) != 0 }
    }

    unsafe fn post_check_resend(&self, conn: NonNull<PGconn>) {
        unsafe { (self.fns.post_check_resend_query_on_error)(conn.as_ptr()) }
    }

    unsafe fn new_refresh_params(&self) -> Option<NonNull<CLRefreshParams>> {
        NonNull::new(unsafe { (self.fns.new_cl_refresh_params)() })
    }

    unsafe fn free_refresh_params(&self, params: NonNull<CLRefreshParams>) {
        unsafe { (self.fns.delete_cl_refresh_params)(params.as_ptr()) }
    }

    unsafe fn read_error_field(
        &self,
        conn: NonNull<PGconn>,
        params: NonNull<CLRefreshParams>,
        field: u8,
        value: &CStr,
    ) {
        let logic = unsafe { (self.fns.get_client_logic)(conn.as_ptr()) };
        if logic.is_null() {
            return;
        }
        unsafe { (self.fns.clientlogic_read_error)(logic, field as c_char, value.as_ptr(), params.as_ptr()) }
    }

    unsafe fn deprocess_error_detail(&self, conn: NonNull<PGconn>, detail: &CStr) -> Option<Vec<u8>> {
        // The decoded detail is never longer than the protected one.
        let mut contents = vec![0u8; detail.to_bytes().len() + 1];
        let ok = unsafe {
            (self.fns.deprocess_error_detail_c)(
                conn.as_ptr(),
                detail.as_ptr(),
                contents.as_mut_ptr() as *mut c_char,
            )
        };
        if ok == 0 {
            return None;
        }
        let end = contents.iter().position(|b| *b == 0).unwrap_or(contents.len());
        contents.truncate(end);
        Some(contents)
    }

    unsafe fn deprocessed_position(&self, conn: NonNull<PGconn>, processed: i32) -> i32 {
        unsafe { (self.fns.processed_query_pos_to_deprocessed_c)(conn.as_ptr(), processed) }
    }

    unsafe fn deprocess_new(
        &self,
        value_kind: i32,
        input_format: i32,
        output_format: i32,
    ) -> Option<NonNull<Deprocess>> {
        NonNull::new(unsafe { (self.fns.new_deprocess)(value_kind, input_format, output_format) })
    }

    unsafe fn deprocess_set_conn(&self, deprocess: NonNull<Deprocess>, conn: NonNull<PGconn>) {
        unsafe { (self.fns.deprocess_set_conn_c)(deprocess.as_ptr(), conn.as_ptr()) }
    }

    unsafe fn deprocess(
        &self,
        deprocess: NonNull<Deprocess>,
        processed: &[u8],
        type_oid: u32,
    ) -> Option<OwnedBuffer> {
        let mut out = null_mut();
        let mut out_len: size_t = 0;
        let ok = unsafe {
            (self.fns.get_deprocessed_c)(
                deprocess.as_ptr(),
                processed.as_ptr(),
                processed.len(),
                type_oid,
                &mut out,
                &mut out_len,
            )
        };
        if ok == 0 {
            return None;
        }
        unsafe { OwnedBuffer::from_raw(out, out_len, RELEASE) }
    }

    unsafe fn deprocess_free(&self, deprocess: NonNull<Deprocess>) {
        unsafe { (self.fns.delete_deprocess)(deprocess.as_ptr()) }
    }

    unsafe fn record_original_ids(
        &self,
        conn: NonNull<PGconn>,
        type_oid: u32,
        function_name: &CStr,
    ) -> Option<Vec<i32>> {
        let ids = unsafe { (self.fns.get_rec_origial_ids)(conn.as_ptr(), type_oid, function_name.as_ptr()) };
        if ids.is_null() {
            return None;
        }
        let len = unsafe {
            (self.fns.get_rec_origial_ids_length)(conn.as_ptr(), type_oid, function_name.as_ptr())
        };
        Some(unsafe { std::slice::from_raw_parts(ids, len) }.to_vec())
    }

    unsafe fn deprocess_record(
        &self,
        conn: NonNull<PGconn>,
        processed: &[u8],
        original_ids: &[i32],
        format: i32,
    ) -> Option<(OwnedBuffer, bool)> {
        let mut out = null_mut();
        let mut out_len: c_ulong = 0;
        let mut decrypted: c_int = 0;
        let ok = unsafe {
            (self.fns.de_process_record)(
                conn.as_ptr(),
                processed.as_ptr() as *const c_char,
                processed.len() as c_ulong,
                original_ids.as_ptr(),
                original_ids.len() as c_ulong,
                format,
                &mut out,
                &mut out_len,
                &mut decrypted,
            )
        };
        if ok == 0 {
            return None;
        }
        let buf = unsafe { OwnedBuffer::from_raw(out, out_len as usize, RELEASE)? };
        Some((buf, decrypted != 0))
    }

    unsafe fn set_server_keys(&self, conn: NonNull<PGconn>, rsa: &CStr, ecdh: &CStr) -> bool {
        unsafe {
            (self.fns.set_key_to_client_logic_c)(
                conn.as_ptr(),
                rsa.to_bytes().len(),
                ecdh.to_bytes().len(),
                rsa.as_ptr() as *mut c_char,
                ecdh.as_ptr() as *mut c_char,
            ) != 0
        }
    }

    unsafe fn client_key(&self, conn: NonNull<PGconn>) -> Option<RawBytes> {
        let mut key = null_mut();
        let mut len: size_t = 0;
        if unsafe { (self.fns.get_client_key_c)(conn.as_ptr(), &mut key, &mut len) } == 0 {
            return None;
        }
        Some(RawBytes { ptr: key as *const u8, len })
    }

    unsafe fn clear_client_keys(&self, conn: NonNull<PGconn>) -> bool {
        unsafe { (self.fns.clear_client_keys_c)(conn.as_ptr()) != 0 }
    }

    unsafe fn fetched_columns(&self, conn: NonNull<PGconn>) -> i32 {
        unsafe { (self.fns.fetched_columns_c)(conn.as_ptr()) }
    }

    unsafe fn cached_ceks(&self, conn: NonNull<PGconn>, count: usize) -> Option<Vec<CachedCek>> {
        let mut oids = null_mut();
        let mut algorithms = null_mut();
        let mut lengths = null_mut();
        let mut keys = null_mut();
        let ok = unsafe {
            (self.fns.get_cached_ceks_c)(conn.as_ptr(), &mut oids, &mut algorithms, &mut lengths, &mut keys)
        };
        if ok == 0 {
            return None;
        }
        if count == 0 {
            return Some(Vec::new());
        }
        if oids.is_null() || algorithms.is_null() || lengths.is_null() || keys.is_null() {
            return None;
        }
        let ceks = (0..count)
            .map(|i| unsafe {
                let len = usize::try_from(*lengths.add(i)).unwrap_or(0);
                let key = *keys.add(i);
                CachedCek {
                    oid: *oids.add(i),
                    algorithm: *algorithms.add(i),
                    key: RawBytes { ptr: key as *const u8, len }.as_slice().to_vec(),
                }
            })
            .collect();
        Some(ceks)
    }

    unsafe fn process_copy_chunk(&self, conn: NonNull<PGconn>, chunk: &[u8]) -> CopyChunk {
        let Ok(len) = c_int::try_from(chunk.len()) else {
            tracing::warn!(len = chunk.len(), "copy chunk too large for client logic; sent as is");
            return CopyChunk::Unchanged;
        };
        let mut out = null_mut();
        let ret = unsafe {
            (self.fns.process_copy_chunk)(conn.as_ptr(), chunk.as_ptr() as *const c_char, len, &mut out)
        };
        if ret > 0 {
            return match unsafe { OwnedBuffer::from_raw(out as *mut u8, ret as usize, RELEASE) } {
                Some(buf) => CopyChunk::Replaced(buf),
                None => CopyChunk::Unchanged,
            };
        }
        if !out.is_null() {
            unsafe { RELEASE(out as *mut c_void) };
        }
        if ret == 0 { CopyChunk::Unchanged } else { CopyChunk::Withheld }
    }
}
