use libc::{c_char, c_void};
use std::ffi::{CStr, CString};
use std::ptr::null_mut;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::LibClientLogic;

#[cfg(target_os = "linux")]
#[link(name = "dl")]
unsafe extern "C" {}

/// Environment variable naming a library to try before the platform defaults.
pub const LIBRARY_ENV: &str = "CLIENT_LOGIC_LIB";

/// Why the library could not be loaded.
///
/// Only reported through logs; callers see a boolean readiness result.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("no client logic library found (tried {tried})")]
    LibraryNotFound { tried: String },
    #[error("client logic library is missing symbol `{0}`")]
    MissingSymbol(String),
}

/// Where and how strictly the library is loaded.
#[derive(Clone, Debug)]
pub struct LoaderConfig {
    /// Library names handed to the dynamic linker, tried in order.
    pub library_names: Vec<CString>,
    /// Panic in the loading thread on a missing symbol instead of failing quietly.
    pub strict_symbols: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            library_names: default_library_names(),
            strict_symbols: cfg!(debug_assertions),
        }
    }
}

impl LoaderConfig {
    /// Platform defaults, preceded by `$CLIENT_LOGIC_LIB` when set.
    pub fn from_env() -> Self {
        Self::default().with_override(std::env::var(LIBRARY_ENV).ok().as_deref())
    }

    /// Try `name` before the configured names. Empty or NUL-containing names are ignored.
    pub fn with_override(mut self, name: Option<&str>) -> Self {
        if let Some(name) = name
            && !name.is_empty()
            && let Ok(name) = CString::new(name)
        {
            self.library_names.insert(0, name);
        }
        self
    }

    /// Replace the candidate library names.
    pub fn with_library_names<I, N>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<Vec<u8>>,
    {
        self.library_names = names
            .into_iter()
            .filter_map(|name| CString::new(name).ok())
            .collect();
        self
    }

    pub fn with_strict_symbols(mut self, strict: bool) -> Self {
        self.strict_symbols = strict;
        self
    }
}

fn default_library_names() -> Vec<CString> {
    let names: &[&CStr] = if cfg!(target_os = "macos") {
        &[c"libpq_ce.dylib", c"libpq_ce.so"]
    } else {
        &[c"libpq_ce.so"]
    };
    names.iter().map(|name| (*name).to_owned()).collect()
}

/// Opened library that resolves exported symbols by name.
///
/// # Safety
/// Pointers returned by [`SymbolSource::symbol`] must stay valid for as long
/// as the source is alive.
pub unsafe trait SymbolSource: Send + Sync + Sized {
    /// Open the first library in `names` that can be loaded.
    unsafe fn open(names: &[CString]) -> Result<Self, LoadError>;
    /// Address of `name`, or null when it is not exported.
    unsafe fn symbol(&self, name: &CStr) -> *mut c_void;
}

/// `dlopen` handle. Never closed: resolved procedures stay callable for the
/// life of the process.
pub struct DlHandle {
    handle: *mut c_void,
}

unsafe impl Send for DlHandle {}
unsafe impl Sync for DlHandle {}

unsafe impl SymbolSource for DlHandle {
    unsafe fn open(names: &[CString]) -> Result<Self, LoadError> {
        let mut handle = null_mut();
        for name in names {
            handle = unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_LAZY | libc::RTLD_LOCAL) };
            if !handle.is_null() {
                tracing::debug!(library = %name.to_string_lossy(), "opened client logic library");
                break;
            }
            let reason = unsafe { dl_error() }.unwrap_or_default();
            tracing::trace!(
                library = %name.to_string_lossy(),
                %reason,
                "dlopen failed"
            );
        }
        if handle.is_null() {
            Err(LoadError::LibraryNotFound {
                tried: tried_names(names),
            })
        } else {
            Ok(Self { handle })
        }
    }

    unsafe fn symbol(&self, name: &CStr) -> *mut c_void {
        unsafe { libc::dlsym(self.handle, name.as_ptr()) }
    }
}

unsafe fn dl_error() -> Option<String> {
    let msg: *const c_char = unsafe { libc::dlerror() };
    if msg.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned())
    }
}

pub(crate) fn tried_names(names: &[CString]) -> String {
    names
        .iter()
        .map(|name| name.to_string_lossy())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Loads the library at most once and shares the result.
///
/// The first caller of [`Loader::ensure_ready`] performs the load while
/// concurrent callers block; afterwards every caller gets the cached result
/// without locking. A failed load is never retried, not even after a strict
/// missing-symbol panic.
pub struct Loader<S: SymbolSource = DlHandle> {
    config: LoaderConfig,
    lib: OnceLock<Result<LibClientLogic<S>, LoadError>>,
    attempts: AtomicUsize,
}

impl Loader<DlHandle> {
    /// Process-wide loader configured from the environment.
    pub fn global() -> &'static Loader {
        static GLOBAL: OnceLock<Loader> = OnceLock::new();
        GLOBAL.get_or_init(|| Loader::new(LoaderConfig::from_env()))
    }
}

impl<S: SymbolSource> Loader<S> {
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            config,
            lib: OnceLock::new(),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Load the library if nobody has tried yet; `true` when every symbol resolved.
    pub fn ensure_ready(&self) -> bool {
        self.library().is_some()
    }

    /// Loaded library, or `None` when loading failed.
    ///
    /// With strict symbols, the thread that performed a load which found a
    /// symbol missing panics after the failure is recorded.
    pub fn library(&self) -> Option<&LibClientLogic<S>> {
        let mut loaded_here = false;
        let state = self.lib.get_or_init(|| {
            loaded_here = true;
            self.load()
        });
        match state {
            Ok(lib) => Some(lib),
            Err(LoadError::MissingSymbol(name)) if loaded_here && self.config.strict_symbols => {
                panic!("client logic library is missing symbol `{name}`")
            }
            Err(_) => None,
        }
    }

    /// Number of load attempts made so far; never more than one.
    pub fn load_attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }

    fn load(&self) -> Result<LibClientLogic<S>, LoadError> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        let loaded = unsafe { LibClientLogic::open(&self.config) };
        match &loaded {
            Ok(_) => tracing::info!("client logic library loaded"),
            Err(err) => tracing::warn!(error = %err, "client logic disabled"),
        }
        loaded
    }
}

#[cfg(test)]
mod tests {
    use super::{LoaderConfig, tried_names};
    use std::ffi::CString;

    #[test]
    fn override_goes_first() {
        let config = LoaderConfig::default()
            .with_library_names(["liba.so", "libb.so"])
            .with_override(Some("/opt/cl/libcustom.so"));
        assert_eq!(
            tried_names(&config.library_names),
            "/opt/cl/libcustom.so, liba.so, libb.so"
        );
    }

    #[test]
    fn empty_or_nul_override_is_ignored() {
        let base = LoaderConfig::default().with_library_names(["liba.so"]);
        let config = base.clone().with_override(Some(""));
        assert_eq!(config.library_names, vec![CString::new("liba.so").unwrap()]);
        let config = base.clone().with_override(Some("bad\0name"));
        assert_eq!(config.library_names.len(), 1);
        let config = base.with_override(None);
        assert_eq!(config.library_names.len(), 1);
    }

    #[test]
    fn defaults() {
        let config = LoaderConfig::default();
        assert!(tried_names(&config.library_names).contains("libpq_ce"));
        assert_eq!(config.strict_symbols, cfg!(debug_assertions));
    }
}
