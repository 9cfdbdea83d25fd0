//! Backend-agnostic bridge to a client-side encryption library.
//!
//! The native library is reached through [`ClientLogicApi`]; it reads rows it
//! did not produce through the seven [`CursorCallbacks`], implemented here by
//! [`CursorBridge`] over a [`ForeignConnection`].

mod bridge;
mod buffer;
mod connection;
mod cursor;
mod deprocess;
mod error;
mod provider;
mod statement;

pub use crate::bridge::{CursorBridge, ForeignConnection, ResultSet};
pub use crate::buffer::{OwnedBuffer, RawBytes, ReleaseFn};
pub use crate::connection::{ClientLogic, Outcome, parse_server_version};
pub use crate::cursor::{
    CURSOR_LOADED, CURSOR_NOT_LOADED, CursorCallbacks, CursorCalls, ExportedCursor, RowCursor,
};
pub use crate::deprocess::Deprocessor;
pub use crate::error::{Error, ErrorCode, Result};
pub use crate::provider::{
    CachedCek, ClientLogicApi, ConnectParams, CopyChunk, CursorDeallocator,
};
pub use crate::statement::{Param, ParamBuffers};
