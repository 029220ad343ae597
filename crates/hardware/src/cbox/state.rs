//! Coherence state of a cached line.

/// Valid/dirty/shared bits shared by the duplicate tags, the primary tags,
/// and the backup-cache tags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LineState {
    /// Line holds a usable copy.
    pub valid: bool,
    /// Line is newer than memory.
    pub dirty: bool,
    /// Other caches may hold copies.
    pub shared: bool,
}

impl LineState {
    /// No copy.
    pub const INVALID: Self = Self {
        valid: false,
        dirty: false,
        shared: false,
    };

    /// Exclusive clean copy.
    pub const CLEAN: Self = Self {
        valid: true,
        dirty: false,
        shared: false,
    };

    /// Shared clean copy.
    pub const CLEAN_SHARED: Self = Self {
        valid: true,
        dirty: false,
        shared: true,
    };

    /// Exclusive dirty copy.
    pub const DIRTY: Self = Self {
        valid: true,
        dirty: true,
        shared: false,
    };

    /// Dirty copy that other caches may also hold.
    pub const DIRTY_SHARED: Self = Self {
        valid: true,
        dirty: true,
        shared: true,
    };

    /// Union of two views of the same line (primary tags and backup cache).
    pub const fn merge(self, other: Self) -> Self {
        Self {
            valid: self.valid || other.valid,
            dirty: (self.valid && self.dirty) || (other.valid && other.dirty),
            shared: (self.valid && self.shared) || (other.valid && other.shared),
        }
    }

    /// `true` if the line is valid and dirty.
    #[inline]
    pub const fn is_dirty(&self) -> bool {
        self.valid && self.dirty
    }
}
