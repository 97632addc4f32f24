//! Interned paths and file-name atoms.
//!
//! Every path the engine touches is interned once into a [`PathTable`] and
//! referred to by its [`PathId`] afterwards. This keeps per-pip state small
//! (ids instead of strings), makes equality O(1), and funnels every
//! platform-casing decision through one comparator.
//!
//! The table is append-only: ids are never invalidated, readers never
//! block, and interning is the only mutation.

use std::{cmp::Ordering, num::NonZeroU32, sync::Arc, sync::RwLock};

use dashmap::{DashMap, mapref::entry::Entry};

/// Separator characters recognized when splitting paths.
///
/// Both separators are accepted on every platform; expanded strings keep
/// whatever the caller interned.
const SEPARATORS: [char; 2] = ['/', '\\'];

/// An interned path.
///
/// Ids are only meaningful together with the table that produced them, and
/// deliberately carry no `Ord`: path ordering is defined by expanded-string
/// comparison under the table's case rule, via [`PathTable::cmp_paths`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PathId(NonZeroU32);

impl PathId {
    fn index(self) -> usize {
        self.0.get() as usize - 1
    }
}

/// An interned final path component, compared case-insensitively.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct FileNameAtom(NonZeroU32);

impl FileNameAtom {
    fn index(self) -> usize {
        self.0.get() as usize - 1
    }
}

/// The append-only path interner.
pub struct PathTable {
    case_sensitive: bool,
    ids: DashMap<String, PathId>,
    expansions: RwLock<Vec<Arc<str>>>,
    atom_ids: DashMap<String, FileNameAtom>,
    atom_expansions: RwLock<Vec<Arc<str>>>,
}

impl Default for PathTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PathTable {
    /// Create a table with the platform's case rule.
    pub fn new() -> Self {
        Self::with_case_sensitivity(!cfg!(windows))
    }

    /// Create a table with an explicit case rule.
    pub fn with_case_sensitivity(case_sensitive: bool) -> Self {
        Self {
            case_sensitive,
            ids: DashMap::new(),
            expansions: RwLock::new(Vec::new()),
            atom_ids: DashMap::new(),
            atom_expansions: RwLock::new(Vec::new()),
        }
    }

    /// Whether comparisons are case sensitive.
    pub fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    fn key_of(&self, s: &str) -> String {
        if self.case_sensitive {
            s.to_owned()
        } else {
            s.to_lowercase()
        }
    }

    /// Intern a path, returning its stable id.
    ///
    /// The first interning wins the expansion casing; later internings that
    /// differ only by case (under an insensitive rule) return the same id.
    pub fn intern(&self, path: impl AsRef<str>) -> PathId {
        let path = path.as_ref();
        let key = self.key_of(path);
        if let Some(existing) = self.ids.get(&key) {
            return *existing;
        }

        match self.ids.entry(key) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                let mut expansions = self.expansions.write().expect("path table poisoned");
                expansions.push(Arc::from(path));
                let id = PathId(
                    NonZeroU32::new(expansions.len() as u32).expect("path table overflow"),
                );
                entry.insert(id);
                id
            }
        }
    }

    /// Expand an id to its string form.
    pub fn expand(&self, id: PathId) -> Arc<str> {
        self.expansions.read().expect("path table poisoned")[id.index()].clone()
    }

    /// Total order over paths, consistent with expanded-string comparison
    /// under the table's case rule.
    pub fn cmp_paths(&self, a: PathId, b: PathId) -> Ordering {
        if a == b {
            return Ordering::Equal;
        }
        let (ea, eb) = (self.expand(a), self.expand(b));
        self.cmp_strs(&ea, &eb)
    }

    /// The comparator underlying [`PathTable::cmp_paths`], usable on raw
    /// strings.
    pub fn cmp_strs(&self, a: &str, b: &str) -> Ordering {
        if self.case_sensitive {
            a.cmp(b)
        } else {
            a.chars()
                .map(|c| c.to_ascii_lowercase())
                .cmp(b.chars().map(|c| c.to_ascii_lowercase()))
        }
    }

    /// The parent directory of a path, if it has one.
    pub fn parent(&self, id: PathId) -> Option<PathId> {
        let expanded = self.expand(id);
        let trimmed = expanded.trim_end_matches(SEPARATORS);
        let cut = trimmed.rfind(SEPARATORS)?;
        if cut == 0 {
            // The parent of a top-level entry is the root itself.
            return if trimmed.len() > 1 {
                Some(self.intern(&trimmed[..1]))
            } else {
                None
            };
        }
        Some(self.intern(&trimmed[..cut]))
    }

    /// The final component of a path, if it has one.
    pub fn file_name(&self, id: PathId) -> Option<String> {
        let expanded = self.expand(id);
        let trimmed = expanded.trim_end_matches(SEPARATORS);
        if trimmed.is_empty() {
            return None;
        }
        match trimmed.rfind(SEPARATORS) {
            Some(cut) => Some(trimmed[cut + 1..].to_owned()),
            None => Some(trimmed.to_owned()),
        }
    }

    /// Intern the final component of a path as a file-name atom.
    pub fn file_name_atom(&self, id: PathId) -> Option<FileNameAtom> {
        self.file_name(id).map(|name| self.intern_atom(name))
    }

    /// Whether `descendant` is under `ancestor` (or equal to it).
    pub fn is_within(&self, descendant: PathId, ancestor: PathId) -> bool {
        if descendant == ancestor {
            return true;
        }
        let (d, a) = (self.expand(descendant), self.expand(ancestor));
        let a = a.trim_end_matches(SEPARATORS);
        if d.len() <= a.len() {
            return false;
        }
        let (prefix, rest) = d.split_at(a.len());
        self.cmp_strs(prefix, a) == Ordering::Equal && rest.starts_with(SEPARATORS)
    }

    /// Intern a file-name atom. Atoms always compare case-insensitively.
    pub fn intern_atom(&self, name: impl AsRef<str>) -> FileNameAtom {
        let name = name.as_ref();
        let key = name.to_lowercase();
        if let Some(existing) = self.atom_ids.get(&key) {
            return *existing;
        }

        match self.atom_ids.entry(key) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                let mut expansions = self.atom_expansions.write().expect("path table poisoned");
                expansions.push(Arc::from(name));
                let atom = FileNameAtom(
                    NonZeroU32::new(expansions.len() as u32).expect("atom table overflow"),
                );
                entry.insert(atom);
                atom
            }
        }
    }

    /// Expand an atom to its first-interned casing.
    pub fn expand_atom(&self, atom: FileNameAtom) -> Arc<str> {
        self.atom_expansions.read().expect("path table poisoned")[atom.index()].clone()
    }

    /// Case-insensitive order over atoms, by expansion.
    pub fn cmp_atoms(&self, a: FileNameAtom, b: FileNameAtom) -> Ordering {
        if a == b {
            return Ordering::Equal;
        }
        let (ea, eb) = (self.expand_atom(a), self.expand_atom(b));
        ea.chars()
            .map(|c| c.to_ascii_lowercase())
            .cmp(eb.chars().map(|c| c.to_ascii_lowercase()))
    }

    /// Sort a collection of paths in place by the table's path order.
    pub fn sort(&self, paths: &mut [PathId]) {
        paths.sort_by(|a, b| self.cmp_paths(*a, *b));
    }
}

impl std::fmt::Debug for PathTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathTable")
            .field("case_sensitive", &self.case_sensitive)
            .field("paths", &self.ids.len())
            .field("atoms", &self.atom_ids.len())
            .finish()
    }
}
