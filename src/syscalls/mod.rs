//! Host syscall sets.
//!
//! The `event.*` set lives with the event hook
//! ([`EventHook::syscalls`](crate::hooks::EventHook::syscalls)).

mod shell;
mod space;

use serde_json::Value;

use crate::error::{Error, Result};

pub use shell::{shell_syscalls, SHELL_NAMESPACE};
pub use space::{
    space_syscalls, DocumentStore, EventedStore, MemoryStore, PageData, PageList, PageMeta,
};

pub(crate) fn string_arg(args: &[Value], index: usize, syscall: &str, what: &str) -> Result<String> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::syscall(format!("{}: missing {}", syscall, what)))
}

pub(crate) fn optional_u64_arg(args: &[Value], index: usize, syscall: &str) -> Result<Option<u64>> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| {
            Error::syscall(format!("{}: argument {} must be a timestamp", syscall, index))
        }),
    }
}
