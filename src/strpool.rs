//! An interning string pool for symbol and section names.
//!
//! Every name the linker touches is interned once and referred to by a dense
//! 32-bit [`Name`] handle; equality and hashing are handle identity. No name
//! is ever freed before the link completes.

use core::fmt;
use std::collections::HashMap;

/// A handle to an interned name. Cheap to copy, compare, and hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(pub u32);

/// The pool itself. Strings go in, handles come out, strings never leave.
#[derive(Debug, Default)]
pub struct StringPool {
    strings: Vec<Box<str>>,
    lookup: HashMap<Box<str>, Name>,
}

impl StringPool {
    pub fn new() -> Self {
        StringPool::default()
    }

    /// Interns `s`, returning the existing handle if it was seen before
    pub fn intern(&mut self, s: &str) -> Name {
        if let Some(&name) = self.lookup.get(s) {
            return name;
        }
        let name = Name(self.strings.len() as u32);
        let boxed: Box<str> = s.into();
        self.strings.push(boxed.clone());
        self.lookup.insert(boxed, name);
        name
    }

    /// Handle for `s` if it has already been interned
    pub fn get(&self, s: &str) -> Option<Name> {
        self.lookup.get(s).copied()
    }

    pub fn resolve(&self, name: Name) -> &str {
        &self.strings[name.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

impl fmt::Display for Name {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "name#{}", self.0)
    }
}

#[test]
fn intern_is_idempotent() {
    let mut pool = StringPool::new();
    let a = pool.intern("_main");
    let b = pool.intern("_helper");
    let c = pool.intern("_main");
    assert_eq!(a, c);
    assert_ne!(a, b);
    assert_eq!(pool.resolve(a), "_main");
    assert_eq!(pool.resolve(b), "_helper");
    assert_eq!(pool.len(), 2);
}

#[test]
fn empty_name_interns() {
    let mut pool = StringPool::new();
    let e = pool.intern("");
    assert_eq!(pool.resolve(e), "");
}
