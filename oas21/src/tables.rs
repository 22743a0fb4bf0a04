//!
//! # Oasis Name Tables & Forward References
//!
//! OASIS streams intern their strings in five independently-numbered tables:
//! cell names, text strings, property names, property strings, and layer
//! names. Records reference entries by number, and nothing stops a reference
//! from appearing before its declaration; unresolved references queue in the
//! owning table and are flushed once, at stream end, by [OasTable::finish].
//!
//! Each table is numbered in one of two modes, latched by its first
//! declaration and fixed for the remainder of the stream:
//!
//! * *implicit*: the stream auto-numbers entries 0, 1, 2, ... in declaration
//!   order (records 3, 5, 7, 9);
//! * *explicit*: each declaration carries its own reference-number
//!   (records 4, 6, 8, 10).
//!
//! Mixing modes within one table is a hard error, as is re-declaring a number
//! with different content. Re-declaring identical content is tolerated.
//!

// Std-Lib Imports
use std::collections::{BTreeMap, HashMap};

// Local Imports
use crate::data::{OasError, OasResult};

/// # Table Numbering Mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableMode {
    /// Stream-assigned sequential numbering
    Implicit,
    /// Declaration-supplied reference numbers
    Explicit,
}

/// # Name Reference
///
/// A string which may arrive as a table reference-number or as an inline
/// value. Modal variables hold these un-resolved; resolution happens when an
/// element or property is materialized.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NameRef {
    /// Reference-number into the owning table
    Id(u64),
    /// Inline string value
    Name(String),
}
impl Default for NameRef {
    fn default() -> Self {
        NameRef::Id(0)
    }
}

///
/// # Oasis Name Table
///
/// A bijective map from 64-bit reference-numbers to interned strings, plus a
/// pending queue of consumers awaiting not-yet-declared numbers. The consumer
/// type `C` is caller-defined; the reader uses it to describe the object to
/// patch once a name resolves.
///
/// Strict-mode streams additionally record each table's byte offset (and a
/// strict flag) from the START/END table-offsets structure. A `None` offset
/// means "no offset recorded", never "table empty".
///
#[derive(Debug, Clone)]
pub struct OasTable<C = ()> {
    /// Table name, for diagnostics ("CELLNAME" etc.)
    name: &'static str,
    /// Numbering mode, latched by the first declaration
    mode: Option<TableMode>,
    /// Number-to-name bindings
    entries: BTreeMap<u64, String>,
    /// Next auto-assigned number, in implicit mode
    next_auto: u64,
    /// Lazily-built reverse index
    reverse: Option<HashMap<String, u64>>,
    /// Consumers awaiting an undeclared number
    pending: Vec<(u64, C)>,
    /// Byte offset of this table's records, from the table-offsets structure
    pub stream_offset: Option<u64>,
    /// Strict flag from the table-offsets structure
    pub strict: bool,
}
impl<C> OasTable<C> {
    /// Create a new, empty table named `name`
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            mode: None,
            entries: BTreeMap::new(),
            next_auto: 0,
            reverse: None,
            pending: Vec::new(),
            stream_offset: None,
            strict: false,
        }
    }
    /// Table name, for diagnostics
    pub fn table_name(&self) -> &'static str {
        self.name
    }
    /// Numbering mode, if latched
    pub fn mode(&self) -> Option<TableMode> {
        self.mode
    }
    /// Number of declared entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    /// Boolean indication of an empty table
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    /// Latch the numbering mode, or fail on a mode mixture
    fn latch(&mut self, mode: TableMode) -> OasResult<()> {
        match self.mode {
            None => {
                self.mode = Some(mode);
                Ok(())
            }
            Some(m) if m == mode => Ok(()),
            Some(_) => Err(OasError::Table {
                table: self.name,
                msg: "mixed implicit and explicit numbering within one table".into(),
            }),
        }
    }
    /// Bind `refnum` to `name`.
    /// Identical re-declarations are a no-op; conflicting ones are an error.
    fn bind(&mut self, refnum: u64, name: String) -> OasResult<()> {
        if let Some(existing) = self.entries.get(&refnum) {
            if *existing == name {
                return Ok(()); // Tolerated duplicate
            }
            return Err(OasError::Table {
                table: self.name,
                msg: format!(
                    "number {} re-declared as {:?}, already bound to {:?}",
                    refnum, name, existing
                ),
            });
        }
        if let Some(rev) = self.reverse.as_mut() {
            rev.insert(name.clone(), refnum);
        }
        self.entries.insert(refnum, name);
        Ok(())
    }
    /// Declare `name` with stream-assigned (implicit) numbering.
    /// Returns the assigned number.
    pub fn declare_implicit(&mut self, name: String) -> OasResult<u64> {
        self.latch(TableMode::Implicit)?;
        let refnum = self.next_auto;
        self.next_auto += 1;
        self.bind(refnum, name)?;
        Ok(refnum)
    }
    /// Declare `name` with an explicit reference-number
    pub fn declare(&mut self, refnum: u64, name: String) -> OasResult<()> {
        self.latch(TableMode::Explicit)?;
        self.bind(refnum, name)
    }
    /// Look up the name bound to `refnum`
    pub fn lookup(&self, refnum: u64) -> Option<&str> {
        self.entries.get(&refnum).map(String::as_str)
    }
    /// Look up the number bound to `name`, building the reverse index on first use
    pub fn lookup_by_name(&mut self, name: &str) -> Option<u64> {
        let entries = &self.entries;
        let rev = self.reverse.get_or_insert_with(|| {
            entries.iter().map(|(k, v)| (v.clone(), *k)).collect()
        });
        rev.get(name).copied()
    }
    /// Intern `name`, declaring it with the next sequential number if absent.
    /// The writer's pass-1 vocabulary builder.
    pub fn intern(&mut self, name: &str) -> OasResult<u64> {
        if let Some(refnum) = self.lookup_by_name(name) {
            return Ok(refnum);
        }
        self.declare_implicit(name.to_string())
    }
    /// Resolve `refnum` immediately if bound, returning the name and the
    /// consumer for the caller to apply; otherwise queue the consumer.
    pub fn resolve_or_defer(&mut self, refnum: u64, consumer: C) -> Option<(String, C)> {
        match self.entries.get(&refnum) {
            Some(name) => Some((name.clone(), consumer)),
            None => {
                self.pending.push((refnum, consumer));
                None
            }
        }
    }
    /// Flush the pending queue, once, at stream end.
    /// Returns the now-resolvable `(refnum, name, consumer)` triples for the
    /// caller to apply, or a dangling-reference error naming this table and
    /// the first unresolved number.
    pub fn finish(&mut self) -> OasResult<Vec<(u64, String, C)>> {
        let mut out = Vec::with_capacity(self.pending.len());
        for (refnum, consumer) in self.pending.drain(..) {
            match self.entries.get(&refnum) {
                Some(name) => out.push((refnum, name.clone(), consumer)),
                None => {
                    return Err(OasError::DanglingRef {
                        table: self.name,
                        refnum,
                    })
                }
            }
        }
        Ok(out)
    }
    /// Iterate entries in reference-number order
    pub fn iter(&self) -> impl Iterator<Item = (u64, &str)> {
        self.entries.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

///
/// # The Five Oasis Name Tables
///
/// One instance per codec; reader and writer each own an independent set.
///
#[derive(Debug, Clone)]
pub struct OasTables<C = ()> {
    pub cellnames: OasTable<C>,
    pub textstrings: OasTable<C>,
    pub propnames: OasTable<C>,
    pub propstrings: OasTable<C>,
    pub layernames: OasTable<C>,
}
impl<C> OasTables<C> {
    pub fn new() -> Self {
        Self {
            cellnames: OasTable::new("CELLNAME"),
            textstrings: OasTable::new("TEXTSTRING"),
            propnames: OasTable::new("PROPNAME"),
            propstrings: OasTable::new("PROPSTRING"),
            layernames: OasTable::new("LAYERNAME"),
        }
    }
}
impl<C> Default for OasTables<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_redeclaration_tolerated() {
        let mut table: OasTable = OasTable::new("CELLNAME");
        table.declare(5, "TOP".into()).unwrap();
        table.declare(5, "TOP".into()).unwrap(); // No error
        match table.declare(5, "OTHER".into()) {
            Err(OasError::Table { table, .. }) => assert_eq!(table, "CELLNAME"),
            _ => panic!("expected a table-conflict error"),
        }
    }
    #[test]
    fn modes_are_exclusive() {
        let mut table: OasTable = OasTable::new("PROPNAME");
        table.declare_implicit("alpha".into()).unwrap();
        assert_eq!(table.mode(), Some(TableMode::Implicit));
        assert!(matches!(
            table.declare(3, "beta".into()),
            Err(OasError::Table { .. })
        ));
        // And the other way around
        let mut table: OasTable = OasTable::new("PROPNAME");
        table.declare(3, "beta".into()).unwrap();
        assert!(matches!(
            table.declare_implicit("alpha".into()),
            Err(OasError::Table { .. })
        ));
    }
    #[test]
    fn implicit_numbers_sequentially() {
        let mut table: OasTable = OasTable::new("TEXTSTRING");
        assert_eq!(table.declare_implicit("a".into()).unwrap(), 0);
        assert_eq!(table.declare_implicit("b".into()).unwrap(), 1);
        assert_eq!(table.lookup(1), Some("b"));
        assert_eq!(table.lookup_by_name("a"), Some(0));
        assert_eq!(table.lookup(2), None);
    }
    #[test]
    fn forward_references_resolve_at_finish() {
        let mut table: OasTable<&'static str> = OasTable::new("PROPNAME");
        // Reference number 9 before its declaration
        assert!(table.resolve_or_defer(9, "patch-me").is_none());
        table.declare(9, "whatever".into()).unwrap();
        let resolved = table.finish().unwrap();
        assert_eq!(resolved, vec![(9, "whatever".to_string(), "patch-me")]);
        // A second finish has nothing left to do
        assert!(table.finish().unwrap().is_empty());
    }
    #[test]
    fn dangling_reference_fails_at_finish_only() {
        let mut table: OasTable<&'static str> = OasTable::new("CELLNAME");
        assert!(table.resolve_or_defer(42, "patch-me").is_none());
        // No error yet; only finish() raises
        match table.finish() {
            Err(OasError::DanglingRef { table, refnum }) => {
                assert_eq!(table, "CELLNAME");
                assert_eq!(refnum, 42);
            }
            _ => panic!("expected a dangling-reference error"),
        }
    }
    #[test]
    fn interning_deduplicates() {
        let mut table: OasTable = OasTable::new("CELLNAME");
        let a = table.intern("alpha").unwrap();
        let b = table.intern("beta").unwrap();
        assert_eq!(table.intern("alpha").unwrap(), a);
        assert_ne!(a, b);
    }
}
