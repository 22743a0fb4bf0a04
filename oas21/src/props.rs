//!
//! # Oasis Properties
//!
//! Property records attach `(name, values)` pairs to the library, to cells,
//! and to elements. Names and string-valued entries may arrive as table
//! reference-numbers, possibly ahead of their declarations; such values hold
//! a transient [OasPropValue::StringRef] until the tables resolve them.
//!
//! A handful of "standard" properties carry schema-level metadata rather
//! than user data. They are recognized by well-known name strings, listed in
//! [STD_PROPERTIES], and consumed into first-class model fields unless the
//! reader is configured to pass them through.
//!

// Crates.io
use serde::{Deserialize, Serialize};

// Local Imports
use crate::data::{OasBbox, OasCell, OasError, OasLibrary, OasResult};

/// # String Storage Class
///
/// Which of the three OASIS string flavors a referenced property-string
/// entry should decode as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StringClass {
    /// Printable-character string, spaces allowed
    A,
    /// Arbitrary bytes
    B,
    /// Printable-character string, no spaces, non-empty
    N,
}

/// # Property Value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OasPropValue {
    Real(f64),
    Unsigned(u64),
    Signed(i64),
    AString(String),
    BString(Vec<u8>),
    NString(String),
    /// Unresolved reference into the PROPSTRING table.
    /// Transient; patched to a string variant before reads complete.
    StringRef { refnum: u64, class: StringClass },
}
impl OasPropValue {
    /// Unsigned-integer content, if any
    pub fn as_unsigned(&self) -> Option<u64> {
        match self {
            OasPropValue::Unsigned(v) => Some(*v),
            _ => None,
        }
    }
    /// Signed-integer content, if any
    pub fn as_signed(&self) -> Option<i64> {
        match self {
            OasPropValue::Signed(v) => Some(*v),
            OasPropValue::Unsigned(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }
    /// String content, if any
    pub fn as_str(&self) -> Option<&str> {
        match self {
            OasPropValue::AString(s) | OasPropValue::NString(s) => Some(s.as_str()),
            _ => None,
        }
    }
    /// Boolean indication of an unresolved table reference
    pub fn is_unresolved(&self) -> bool {
        matches!(self, OasPropValue::StringRef { .. })
    }
    /// Resolve an unresolved reference to `string`, keeping its storage class
    pub(crate) fn resolve(&mut self, string: &str) {
        if let OasPropValue::StringRef { class, .. } = self {
            *self = match class {
                StringClass::A => OasPropValue::AString(string.to_string()),
                StringClass::N => OasPropValue::NString(string.to_string()),
                StringClass::B => OasPropValue::BString(string.as_bytes().to_vec()),
            };
        }
    }
}

/// # Oasis Property
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OasProperty {
    /// Property name
    pub name: String,
    /// Value list, possibly empty
    pub values: Vec<OasPropValue>,
    /// Standard-property flag, from the record's S bit
    pub standard: bool,
}
impl OasProperty {
    /// Create a new property
    pub fn new(name: impl Into<String>, values: Vec<OasPropValue>) -> Self {
        Self {
            name: name.into(),
            values,
            standard: false,
        }
    }
    /// Boolean indication of any unresolved string reference among `values`
    pub fn has_unresolved(&self) -> bool {
        self.values.iter().any(OasPropValue::is_unresolved)
    }
}

/// # Standard-Property Owner Kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdPropOwner {
    Library,
    Cell,
}

/// # Standard-Property Effect
///
/// What a recognized standard property folds into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdPropEffect {
    /// One n-string value naming the library's top cell
    TopCell,
    /// Five values `(flags, x, y, width, height)` giving a cell's extent
    BoundingBox,
}

/// # Standard-Property Registry Entry
#[derive(Debug, Clone, Copy)]
pub struct StdProperty {
    pub name: &'static str,
    pub owner: StdPropOwner,
    pub effect: StdPropEffect,
}

/// The recognized standard properties. The set is version-dependent
/// configuration, not exhaustive; unrecognized `S`-flagged names pass
/// through as generic properties.
pub const STD_PROPERTIES: &[StdProperty] = &[
    StdProperty {
        name: "S_TOP_CELL",
        owner: StdPropOwner::Library,
        effect: StdPropEffect::TopCell,
    },
    StdProperty {
        name: "S_BOUNDING_BOX",
        owner: StdPropOwner::Cell,
        effect: StdPropEffect::BoundingBox,
    },
];

/// Look up the standard property registered for `name` on `owner`, if any
pub fn std_property(name: &str, owner: StdPropOwner) -> Option<&'static StdProperty> {
    STD_PROPERTIES
        .iter()
        .find(|p| p.name == name && p.owner == owner)
}

/// Fold a library-level standard property into `lib`.
/// Returns true if consumed, false for pass-through.
pub(crate) fn consume_library_std(lib: &mut OasLibrary, prop: &OasProperty) -> OasResult<bool> {
    let std = match std_property(&prop.name, StdPropOwner::Library) {
        Some(s) => s,
        None => return Ok(false),
    };
    match std.effect {
        StdPropEffect::TopCell => {
            let name = prop
                .values
                .first()
                .and_then(OasPropValue::as_str)
                .ok_or_else(|| {
                    OasError::Decode(format!("property {} requires one string value", prop.name))
                })?;
            lib.top_cell = Some(name.to_string());
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Fold a cell-level standard property into `cell`.
/// Returns true if consumed, false for pass-through.
pub(crate) fn consume_cell_std(cell: &mut OasCell, prop: &OasProperty) -> OasResult<bool> {
    let std = match std_property(&prop.name, StdPropOwner::Cell) {
        Some(s) => s,
        None => return Ok(false),
    };
    match std.effect {
        StdPropEffect::BoundingBox => {
            if prop.values.len() != 5 {
                return Err(OasError::Decode(format!(
                    "property {} requires five values, has {}",
                    prop.name,
                    prop.values.len()
                )));
            }
            let bad = || OasError::Decode(format!("property {} has non-numeric values", prop.name));
            cell.bbox = Some(OasBbox {
                x: prop.values[1].as_signed().ok_or_else(bad)?,
                y: prop.values[2].as_signed().ok_or_else(bad)?,
                width: prop.values[3].as_unsigned().ok_or_else(bad)?,
                height: prop.values[4].as_unsigned().ok_or_else(bad)?,
            });
            Ok(true)
        }
        _ => Ok(false),
    }
}
