//! Core trait definitions for the Cyanea ecosystem.
//!
//! These traits define the contracts that domain types implement across crates.

/// A value with a current and a stored (pre-proposal) version.
///
/// Mutating setters on implementors call [`Versioned::touch`] first, so the
/// stored copy is taken at most once per proposal. Reads never snapshot.
pub trait Versioned {
    /// Snapshot current into stored, unless already touched since the last
    /// commit or rollback.
    fn touch(&mut self);

    /// Keep the current value and drop the snapshot.
    fn commit(&mut self);

    /// Restore the snapshot. A no-op when nothing is pending.
    fn rollback(&mut self);

    /// Whether the value changed since the last commit or rollback.
    fn is_touched(&self) -> bool;
}

/// A cached quantity that can be invalidated.
pub trait Dirtyable {
    /// Whether the cached value may be stale.
    fn is_dirty(&self) -> bool;

    /// Flag the cached value as stale.
    fn mark_dirty(&mut self);
}

/// A type that can produce a summary of its contents.
pub trait Summarizable {
    /// A one-line summary suitable for display.
    fn summary(&self) -> String;
}
