//! Pre-load symbol whitelist.
//!
//! Before a shared object is ever mapped executable, its ELF dynamic
//! symbol table is walked and every function-typed or untyped global name
//! is checked against the instance's `WHITELIST(NAME, LIBC)` table.
//! Symbols with no name, a leading `_`, or the `module_` entrypoint prefix
//! are exempt. Any other symbol missing from the table aborts the load.

use goblin::elf::sym::{STT_FUNC, STT_NOTYPE};
use goblin::elf::Elf;

use crate::error::{PluginError, StoreError};
use crate::store::{SqlParam, Store};

/// Whether a symbol name skips the whitelist entirely.
pub fn exempt(name: &str) -> bool {
    name.is_empty() || name.starts_with('_') || name.starts_with("module_")
}

/// A whitelist verdict source: `Some(libc)` when the name is listed.
pub type Lookup<'a> = dyn Fn(&str) -> Result<Option<bool>, StoreError> + 'a;

/// Check a stream of symbol names against a verdict source.
///
/// The first non-exempt name the source does not know aborts the check.
pub fn check_names<'a>(
    names: impl Iterator<Item = &'a str>,
    lookup: &Lookup<'_>,
) -> Result<(), PluginError> {
    for name in names {
        if exempt(name) {
            continue;
        }
        match lookup(name)? {
            Some(_) => {}
            None => {
                return Err(PluginError::Blacklisted {
                    symbol: name.to_string(),
                    libc: false,
                })
            }
        }
    }
    Ok(())
}

/// Look a symbol up in the `WHITELIST` table.
pub fn table_lookup(store: &Store, name: &str) -> Result<Option<bool>, StoreError> {
    let row = store.query_row(
        "SELECT LIBC FROM WHITELIST WHERE NAME = ?1",
        &[SqlParam::text(name)],
        "i",
    )?;
    Ok(row.and_then(|mut r| r.pop_int()).map(|libc| libc != 0))
}

/// Walk the ELF dynamic symbol table of `bytes` and run the check.
pub fn check_object(
    path: &std::path::Path,
    bytes: &[u8],
    store: &Store,
) -> Result<(), PluginError> {
    let elf = Elf::parse(bytes).map_err(|e| PluginError::Inspect {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let names = elf.dynsyms.iter().filter_map(|sym| {
        let kind = sym.st_type();
        if kind != STT_FUNC && kind != STT_NOTYPE {
            return None;
        }
        elf.dynstrtab.get_at(sym.st_name)
    });

    // Collected up front; the borrow checker cannot see through the
    // filter_map closure into the lookup.
    let names: Vec<&str> = names.collect();
    check_names(names.into_iter(), &|name| table_lookup(store, name))
}
