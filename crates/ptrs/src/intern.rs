//! Identifier and literal interning.
//!
//! The parser interns every identifier and file name once and refers to it by
//! a compact [`StringId`]. During execution lookups are needed only for
//! struct member access, import resolution, and error messages.

use ahash::AHashMap;

/// Index into the interner's storage.
///
/// Uses `u32` to save space; four billion unique identifiers is more than
/// any script will produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct StringId(u32);

impl StringId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Append-only string interner shared by every module the engine loads.
#[derive(Debug, Default)]
pub(crate) struct Interns {
    strings: Vec<Box<str>>,
    map: AHashMap<Box<str>, u32>,
}

impl Interns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a string, returning the id of the existing entry if the same
    /// text was interned before.
    pub fn intern(&mut self, s: &str) -> StringId {
        if let Some(&id) = self.map.get(s) {
            return StringId(id);
        }
        let id = u32::try_from(self.strings.len()).expect("interner overflow");
        self.strings.push(s.into());
        self.map.insert(s.into(), id);
        StringId(id)
    }

    pub fn get(&self, id: StringId) -> &str {
        &self.strings[id.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_dedups() {
        let mut interns = Interns::new();
        let a = interns.intern("foo");
        let b = interns.intern("bar");
        let c = interns.intern("foo");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(interns.get(a), "foo");
        assert_eq!(interns.get(b), "bar");
    }
}
