//! Per-channel access control.
//!
//! Levels run from −2 to 6 and live in the `ACCESS` table keyed by
//! (channel, name). Two levels carry special meaning: −1 marks a sender
//! the bot ignores outright, −2 marks a sender kicked on sight. Modifying
//! the list requires level [`ACCESS_CONTROL`], and nobody may touch a
//! target at or above their own seniority nor hand out a level above
//! their own.

use crate::error::StoreError;
use crate::store::{SqlParam, Store};

/// Level required to modify the access list.
pub const ACCESS_CONTROL: i64 = 4;

/// Sender is silently ignored.
pub const ACCESS_IGNORE: i64 = -1;

/// Sender is kicked on join.
pub const ACCESS_SHITLIST: i64 = -2;

/// Smallest valid level.
pub const ACCESS_MIN: i64 = -2;

/// Largest valid level.
pub const ACCESS_MAX: i64 = 6;

/// Outcome of an access-list operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOutcome {
    /// Operation applied.
    Success,
    /// The store refused the operation.
    Failed,
    /// The invoker lacked the required seniority.
    Denied,
    /// The target has no entry on this channel.
    NoExistTarget,
    /// The invoker has no entry on this channel.
    NoExistInvoker,
    /// The target already has an entry.
    Exists,
    /// The level was outside −2..=6.
    BadRange,
}

fn in_range(level: i64) -> bool {
    (ACCESS_MIN..=ACCESS_MAX).contains(&level)
}

/// Look up a level; `None` when no entry exists.
pub fn level(store: &Store, channel: &str, target: &str) -> Result<Option<i64>, StoreError> {
    let row = store.query_row(
        "SELECT ACCESS FROM ACCESS WHERE NAME = ?1 AND CHANNEL = ?2",
        &[SqlParam::text(target), SqlParam::text(channel)],
        "i",
    )?;
    Ok(row.and_then(|mut r| r.pop_int()))
}

/// Add `target` at `level`, subject to the invoker's seniority.
pub fn insert(
    store: &Store,
    channel: &str,
    target: &str,
    invoker: &str,
    new_level: i64,
) -> AccessOutcome {
    if !in_range(new_level) {
        return AccessOutcome::BadRange;
    }

    let invoker_level = match level(store, channel, invoker) {
        Ok(Some(l)) => l,
        Ok(None) => return AccessOutcome::NoExistInvoker,
        Err(_) => return AccessOutcome::Failed,
    };
    match level(store, channel, target) {
        Ok(Some(_)) => return AccessOutcome::Exists,
        Ok(None) => {}
        Err(_) => return AccessOutcome::Failed,
    }
    if invoker_level < ACCESS_CONTROL || new_level > invoker_level {
        return AccessOutcome::Denied;
    }

    let result = store.execute(
        "INSERT INTO ACCESS(CHANNEL, NAME, ACCESS) VALUES (?1, ?2, ?3)",
        &[
            SqlParam::text(channel),
            SqlParam::text(target),
            SqlParam::int(new_level),
        ],
    );
    match result {
        Ok(_) => AccessOutcome::Success,
        Err(_) => AccessOutcome::Failed,
    }
}

/// Remove `target`, refusing targets at or above the invoker.
pub fn remove(store: &Store, channel: &str, target: &str, invoker: &str) -> AccessOutcome {
    let invoker_level = match level(store, channel, invoker) {
        Ok(Some(l)) => l,
        Ok(None) => return AccessOutcome::NoExistInvoker,
        Err(_) => return AccessOutcome::Failed,
    };
    let target_level = match level(store, channel, target) {
        Ok(Some(l)) => l,
        Ok(None) => return AccessOutcome::NoExistTarget,
        Err(_) => return AccessOutcome::Failed,
    };
    if invoker_level < ACCESS_CONTROL || target_level >= invoker_level {
        return AccessOutcome::Denied;
    }

    let result = store.execute(
        "DELETE FROM ACCESS WHERE NAME = ?1 AND CHANNEL = ?2",
        &[SqlParam::text(target), SqlParam::text(channel)],
    );
    match result {
        Ok(_) => AccessOutcome::Success,
        Err(_) => AccessOutcome::Failed,
    }
}

/// Change `target`'s level, denying promotions above the invoker.
pub fn change(
    store: &Store,
    channel: &str,
    target: &str,
    invoker: &str,
    new_level: i64,
) -> AccessOutcome {
    if !in_range(new_level) {
        return AccessOutcome::BadRange;
    }

    let invoker_level = match level(store, channel, invoker) {
        Ok(Some(l)) => l,
        Ok(None) => return AccessOutcome::NoExistInvoker,
        Err(_) => return AccessOutcome::Failed,
    };
    let target_level = match level(store, channel, target) {
        Ok(Some(l)) => l,
        Ok(None) => return AccessOutcome::NoExistTarget,
        Err(_) => return AccessOutcome::Failed,
    };
    if invoker_level < ACCESS_CONTROL
        || target_level > invoker_level
        || new_level > invoker_level
    {
        return AccessOutcome::Denied;
    }

    let result = store.execute(
        "UPDATE ACCESS SET ACCESS = ?1 WHERE NAME = ?2 AND CHANNEL = ?3",
        &[
            SqlParam::int(new_level),
            SqlParam::text(target),
            SqlParam::text(channel),
        ],
    );
    match result {
        Ok(_) => AccessOutcome::Success,
        Err(_) => AccessOutcome::Failed,
    }
}

/// Whether `target` sits at exactly `check`.
pub fn check(store: &Store, channel: &str, target: &str, check: i64) -> bool {
    matches!(level(store, channel, target), Ok(Some(l)) if l == check)
}

/// Whether `target` sits at `check` or above.
pub fn range(store: &Store, channel: &str, target: &str, check: i64) -> bool {
    matches!(level(store, channel, target), Ok(Some(l)) if l >= check)
}

/// Whether `target` is ignored on this channel.
pub fn ignore(store: &Store, channel: &str, target: &str) -> bool {
    check(store, channel, target, ACCESS_IGNORE)
}

/// Whether `target` is kicked on sight on this channel.
pub fn shitlist(store: &Store, channel: &str, target: &str) -> bool {
    check(store, channel, target, ACCESS_SHITLIST)
}
