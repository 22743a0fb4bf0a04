//!
//! # Oas21 Data Model
//!

// Std-Lib Imports
use std::fmt;
use std::io::Write;
use std::path::Path;

// Crates.io
use derive_builder::Builder;
use derive_more::{Add, AddAssign, Sub, SubAssign};
use enum_dispatch::enum_dispatch;
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

// Local Imports
use crate::props::OasProperty;
use crate::read::OasParser;
use crate::rep::Repetition;
use crate::write::OasWriter;

///
/// # Oasis Record Types
///
/// In the numeric order specified by the OASIS standard, for automatic
/// [FromPrimitive](num_traits::FromPrimitive) conversions from record-id bytes.
///
/// Name-table records come in pairs: the *implicit* form auto-numbers entries
/// in stream order, while the *explicit* form carries its own reference-number.
///
#[derive(FromPrimitive, Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum OasRecordType {
    Pad = 0x00,
    Start,
    End,
    CellnameImplicit, // 3
    CellnameExplicit, // 4
    TextstringImplicit,
    TextstringExplicit,
    PropnameImplicit,
    PropnameExplicit,
    PropstringImplicit,
    PropstringExplicit,
    LayernameGeometry, // 11
    LayernameText,     // 12
    CellByRef,  // CELL, referring to a CELLNAME reference-number
    CellByName, // CELL, with an inline name string
    XyAbsolute,
    XyRelative,
    Placement,          // 17, restricted angles
    PlacementTransform, // 18, with magnification & angle reals
    Text,
    Rectangle, // 20
    Polygon,
    Path,
    Trapezoid,  // 23
    TrapezoidA, // 24, width-delta form
    TrapezoidB, // 25, height-delta form
    Ctrapezoid, // 26
    Circle,     // 27
    Property,       // 28
    PropertyRepeat, // 29
    XnameImplicit,  // 30
    XnameExplicit,
    Xelement,
    Xgeometry,
    Cblock, // 34
}

/// # Oasis Spatial Point (or Vector)
///
/// OASIS coordinates are signed 64-bit database-unit integers.
/// Displacements use the same representation; [OasVector] aliases [OasPoint].
#[derive(
    Default,
    Debug,
    Clone,
    Copy,
    Deserialize,
    Serialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Add,
    AddAssign,
    Sub,
    SubAssign,
)]
pub struct OasPoint {
    pub x: i64,
    pub y: i64,
}
impl OasPoint {
    /// Create a new [OasPoint]
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
    /// The zero point/vector
    pub fn zero() -> Self {
        Self { x: 0, y: 0 }
    }
    /// Scale by integer factor `k`
    pub fn scaled(self, k: i64) -> Self {
        Self {
            x: self.x * k,
            y: self.y * k,
        }
    }
}
/// Displacements share the point representation
pub type OasVector = OasPoint;

/// # Oasis Layer/Datatype Interval
///
/// LAYERNAME records bind a name to an interval of layer numbers and an
/// interval of datatype numbers. `hi == None` denotes an unbounded interval.
#[derive(Default, Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct OasInterval {
    pub lo: u32,
    pub hi: Option<u32>,
}
impl OasInterval {
    /// The all-values interval
    pub fn all() -> Self {
        Self { lo: 0, hi: None }
    }
    /// The single-value interval `{v}`
    pub fn exactly(v: u32) -> Self {
        Self {
            lo: v,
            hi: Some(v),
        }
    }
}
/// # Oasis Layer-Name Binding
///
/// As declared by LAYERNAME records (geometry and text variants).
#[derive(Default, Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct OasLayerName {
    /// Layer Name
    pub name: String,
    /// Layer-number interval
    pub layers: OasInterval,
    /// Datatype (or texttype) interval
    pub types: OasInterval,
    /// Text-layer binding (LAYERNAME record 12) rather than geometry (11)
    pub is_text: bool,
}

/// # Oasis Cell Bounding Box
///
/// Decoded from the standard `S_BOUNDING_BOX` cell property.
#[derive(Default, Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct OasBbox {
    pub x: i64,
    pub y: i64,
    pub width: u64,
    pub height: u64,
}

///
/// # Oasis Rectangle Element
///
/// Wire form: record 20, info-byte `SWHXYRDL`.
/// The `S` (square) form omits the height on the wire; in-memory both
/// dimensions are always populated.
///
#[derive(Default, Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct OasRectangle {
    /// Layer Number
    pub layer: u32,
    /// Datatype Number
    pub datatype: u32,
    /// Lower-left x
    pub x: i64,
    /// Lower-left y
    pub y: i64,
    /// Width
    pub width: u64,
    /// Height
    pub height: u64,

    #[serde(default)]
    pub repetition: Option<Repetition>,
    #[serde(default)]
    pub properties: Vec<OasProperty>,
}

///
/// # Oasis Polygon Element
///
/// Wire form: record 21, info-byte `00PXYRDL`.
/// Vertices are stored relative to the element position `(x, y)`;
/// the first vertex is always the zero vector. The polygon closes
/// implicitly from the final vertex back to the first.
///
#[derive(Default, Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct OasPolygon {
    pub layer: u32,
    pub datatype: u32,
    pub x: i64,
    pub y: i64,
    /// Vertices, relative to `(x, y)`. `points[0]` is always `(0, 0)`.
    pub points: Vec<OasPoint>,

    #[serde(default)]
    pub repetition: Option<Repetition>,
    #[serde(default)]
    pub properties: Vec<OasProperty>,
}

///
/// # Oasis Path Element
///
/// Wire form: record 22, info-byte `EWPXYRDL`.
/// OASIS stores half-widths; the full width is always even in database units.
///
#[derive(Default, Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct OasPath {
    pub layer: u32,
    pub datatype: u32,
    pub x: i64,
    pub y: i64,
    /// Half-width
    pub half_width: u64,
    /// Start extension, in database units
    pub start_ext: i64,
    /// End extension, in database units
    pub end_ext: i64,
    /// Centerline vertices, relative to `(x, y)`. `points[0]` is always `(0, 0)`.
    pub points: Vec<OasPoint>,

    #[serde(default)]
    pub repetition: Option<Repetition>,
    #[serde(default)]
    pub properties: Vec<OasProperty>,
}

///
/// # Oasis Text Element
///
/// Wire form: record 19, info-byte `0CNXYRTL`.
/// The text string may arrive as a TEXTSTRING reference-number;
/// it is resolved to its string form before landing here.
///
#[derive(Default, Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct OasTextElem {
    /// Text Value
    pub string: String,
    /// Text-Layer Number
    pub layer: u32,
    /// Text-Type Number
    pub texttype: u32,
    pub x: i64,
    pub y: i64,

    #[serde(default)]
    pub repetition: Option<Repetition>,
    #[serde(default)]
    pub properties: Vec<OasProperty>,
}

///
/// # Oasis Placement (Cell Instance)
///
/// Wire forms: record 17 (`CNXYRAAF`, restricted angles) and
/// record 18 (`CNXYRMAF`, arbitrary magnification & angle).
/// The referenced cell may arrive as a CELLNAME reference-number;
/// it is resolved to its name before landing here.
///
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct OasPlacement {
    /// Placed Cell Name
    pub cell: String,
    pub x: i64,
    pub y: i64,
    /// Magnification. Unity when absent on the wire.
    pub mag: f64,
    /// Angle, in degrees counter-clockwise. Zero when absent on the wire.
    pub angle: f64,
    /// Mirror about the x-axis, applied before rotation
    pub flip: bool,

    #[serde(default)]
    pub repetition: Option<Repetition>,
    #[serde(default)]
    pub properties: Vec<OasProperty>,
}
impl Default for OasPlacement {
    fn default() -> Self {
        Self {
            cell: String::new(),
            x: 0,
            y: 0,
            mag: 1.0,
            angle: 0.0,
            flip: false,
            repetition: None,
            properties: Vec::new(),
        }
    }
}

///
/// # Oasis Element Enumeration
///
/// Union of the geometric elements, texts, and placements which comprise an
/// OASIS cell. Trapezoid-family, circle, and X-element records are not
/// materially supported and surface as [OasError::Unsupported] at parse time.
///
#[enum_dispatch]
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub enum OasElement {
    OasRectangle(OasRectangle),
    OasPolygon(OasPolygon),
    OasPath(OasPath),
    OasTextElem(OasTextElem),
    OasPlacement(OasPlacement),
}
impl OasElement {
    /// Position of the element
    pub fn pos(&self) -> OasPoint {
        match self {
            OasElement::OasRectangle(e) => OasPoint::new(e.x, e.y),
            OasElement::OasPolygon(e) => OasPoint::new(e.x, e.y),
            OasElement::OasPath(e) => OasPoint::new(e.x, e.y),
            OasElement::OasTextElem(e) => OasPoint::new(e.x, e.y),
            OasElement::OasPlacement(e) => OasPoint::new(e.x, e.y),
        }
    }
    /// Repetition, if any
    pub fn repetition(&self) -> Option<&Repetition> {
        match self {
            OasElement::OasRectangle(e) => e.repetition.as_ref(),
            OasElement::OasPolygon(e) => e.repetition.as_ref(),
            OasElement::OasPath(e) => e.repetition.as_ref(),
            OasElement::OasTextElem(e) => e.repetition.as_ref(),
            OasElement::OasPlacement(e) => e.repetition.as_ref(),
        }
    }
    /// Attached properties
    pub fn properties(&self) -> &[OasProperty] {
        match self {
            OasElement::OasRectangle(e) => &e.properties,
            OasElement::OasPolygon(e) => &e.properties,
            OasElement::OasPath(e) => &e.properties,
            OasElement::OasTextElem(e) => &e.properties,
            OasElement::OasPlacement(e) => &e.properties,
        }
    }
    /// Move the element to position `p`
    pub(crate) fn set_pos(&mut self, p: OasPoint) {
        match self {
            OasElement::OasRectangle(e) => (e.x, e.y) = (p.x, p.y),
            OasElement::OasPolygon(e) => (e.x, e.y) = (p.x, p.y),
            OasElement::OasPath(e) => (e.x, e.y) = (p.x, p.y),
            OasElement::OasTextElem(e) => (e.x, e.y) = (p.x, p.y),
            OasElement::OasPlacement(e) => (e.x, e.y) = (p.x, p.y),
        }
    }
    /// Mutable access to attached properties
    pub(crate) fn properties_mut(&mut self) -> &mut Vec<OasProperty> {
        match self {
            OasElement::OasRectangle(e) => &mut e.properties,
            OasElement::OasPolygon(e) => &mut e.properties,
            OasElement::OasPath(e) => &mut e.properties,
            OasElement::OasTextElem(e) => &mut e.properties,
            OasElement::OasPlacement(e) => &mut e.properties,
        }
    }
}

///
/// # Oasis Cell Definition
///
/// OASIS's hierarchical layout-definition object, introduced by a CELL record
/// and extending to the next CELL record or the end of the stream.
/// Principally an un-ordered vector of [OasElement]s.
///
#[derive(Default, Clone, Builder, Debug, Deserialize, Serialize, PartialEq)]
#[builder(setter(into), private)]
pub struct OasCell {
    /// Cell Name
    pub name: String,
    /// Elements List
    pub elems: Vec<OasElement>,

    /// Bounding box, from the standard `S_BOUNDING_BOX` property
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub bbox: Option<OasBbox>,
    #[serde(default)]
    #[builder(default)]
    pub properties: Vec<OasProperty>,
}
impl OasCell {
    /// Create a new and empty [OasCell]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

///
/// # Oasis Library
///
/// The root of an OASIS stream: a set of cell definitions plus library-level
/// metadata (format version, database-unit resolution, layer-name bindings,
/// the standard top-cell marker, and any library-level properties).
/// On disk each [OasLibrary] corresponds one-to-one with a `.oas` file.
///
#[derive(Clone, Builder, Debug, Deserialize, Serialize, PartialEq)]
#[builder(setter(into), private)]
pub struct OasLibrary {
    /// Format version string. `"1.0"` is the sole published version.
    pub version: String,
    /// Database-unit resolution, in grid positions per micron
    pub unit: f64,
    /// Cell Definitions
    pub cells: Vec<OasCell>,

    /// Layer-name bindings, from LAYERNAME records
    #[serde(default)]
    #[builder(default)]
    pub layernames: Vec<OasLayerName>,
    /// Top cell, from the standard `S_TOP_CELL` property
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub top_cell: Option<String>,
    #[serde(default)]
    #[builder(default)]
    pub properties: Vec<OasProperty>,
}
impl Default for OasLibrary {
    /// Default library: OASIS v1.0, 1nm database units (1000 per micron)
    fn default() -> Self {
        Self {
            version: "1.0".into(),
            unit: 1000.0,
            cells: Vec::new(),
            layernames: Vec::new(),
            top_cell: None,
            properties: Vec::new(),
        }
    }
}
impl OasLibrary {
    /// Create a new and empty [OasLibrary]
    pub fn new() -> Self {
        Self::default()
    }
    /// Read an [OasLibrary] from file `fname`. Alias for [OasLibrary::load].
    pub fn open(fname: impl AsRef<Path>) -> OasResult<OasLibrary> {
        Self::load(fname)
    }
    /// Read an [OasLibrary] from file `fname`, with default options
    pub fn load(fname: impl AsRef<Path>) -> OasResult<OasLibrary> {
        let mut parser = OasParser::open(fname, OasReaderOpts::default())?;
        parser.parse_lib()
    }
    /// Read an [OasLibrary] from byte-slice `bytes`
    pub fn from_bytes(bytes: &[u8]) -> OasResult<OasLibrary> {
        let mut parser = OasParser::from_bytes(bytes, OasReaderOpts::default());
        parser.parse_lib()
    }
    /// Save to file `fname`, with default options
    pub fn save(&self, fname: impl AsRef<Path>) -> OasResult<()> {
        let mut writer = OasWriter::open(fname, OasWriterOpts::default())?;
        writer.write_lib(self)
    }
    /// Write to stream `file`, with default options
    pub fn write(&self, file: impl Write) -> OasResult<()> {
        let mut writer = OasWriter::new(file, OasWriterOpts::default());
        writer.write_lib(self)
    }
}

#[cfg(any(test, feature = "selftest"))]
/// Check `lib` matches across a write-read round-trip cycle
pub fn roundtrip(lib: &OasLibrary) -> OasResult<()> {
    use std::io::{Read, Seek, SeekFrom};
    use tempfile::tempfile;

    // Write to a temporary file
    let mut file = tempfile()?;
    lib.write(&mut file)?;

    // Rewind to the file-start, and read it back
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let lib2 = OasLibrary::from_bytes(&bytes)?;

    // And check the two line up
    assert_eq!(*lib, lib2);
    Ok(())
}

/// # Oasis Reader Options
#[derive(Default, Clone, Builder, Debug, Deserialize, Serialize, PartialEq)]
#[builder(setter(into), default)]
pub struct OasReaderOpts {
    /// Expose standard properties as generic properties,
    /// rather than consuming them into first-class fields
    pub read_all_properties: bool,
    /// Strict-mode expectation. `None` accepts either layout;
    /// `Some(_)` turns a mismatch into a reader error.
    pub expect_strict: Option<bool>,
    /// Degrade correctable geometric errors to warnings
    pub permissive: bool,
    /// Escalate all warnings to fatal errors
    pub warnings_as_errors: bool,
}

/// # Oasis Writer Options
#[derive(Clone, Builder, Debug, Deserialize, Serialize, PartialEq)]
#[builder(setter(into), default)]
pub struct OasWriterOpts {
    /// Shape/instance compressor thoroughness, 0..=10.
    /// Zero disables array detection entirely.
    pub compression_level: u8,
    /// Wrap each cell body in a compressed CBLOCK
    pub write_cblocks: bool,
    /// Emit strict-mode layout: explicitly-numbered name tables,
    /// with offsets in the END trailer
    pub strict_mode: bool,
    /// Re-expand existing repetitions before re-running the compressor
    pub recompress: bool,
    /// Degrade correctable geometric errors to warnings
    pub permissive: bool,
    /// Standard-property emission: 0 none, 1 library-level,
    /// 2 library plus per-cell bounding boxes
    pub write_std_properties: u8,
    /// Replacement for characters illegal in name strings.
    /// `None` makes illegal characters a writer error.
    pub subst_char: Option<char>,
    /// Defer name-table emission until after all cells
    pub tables_at_end: bool,
    /// Escalate all warnings to fatal errors
    pub warnings_as_errors: bool,
}
impl Default for OasWriterOpts {
    fn default() -> Self {
        Self {
            compression_level: 1,
            write_cblocks: false,
            strict_mode: false,
            recompress: false,
            permissive: false,
            write_std_properties: 1,
            subst_char: None,
            tables_at_end: false,
            warnings_as_errors: false,
        }
    }
}

/// # Oasis Warning
///
/// Non-fatal diagnostics accumulate in a caller-visible log on the reader and
/// writer. They never alter control flow unless `warnings_as_errors` is set.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct OasWarning {
    pub message: String,
    /// Severity level; higher is more severe
    pub level: u8,
}

/// Enumeration of each context in which a record can be parsed or emitted,
/// primarily for error reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OasContext {
    Library,
    Cell,
    Rectangle,
    Polygon,
    Path,
    Text,
    Placement,
    Property,
    Repetition,
    PointList,
    Cblock,
    Tables,
    Trailer,
}

/// # [OasError] Result Type
pub type OasResult<T> = Result<T, OasError>;

///
/// # Oasis Error Enumeration
///
/// Most errors are tied in some sense to parsing and decoding.
/// Once a valid [OasLibrary] is created in memory, it can generally be
/// streamed to bytes.
///
#[derive(Clone, Debug)]
pub enum OasError {
    /// Invalid record-id byte
    InvalidRecordType(u8),
    /// Structural parse failure, with stream location and context
    Parse {
        msg: String,
        recordnum: usize,
        bytepos: u64,
        cell: Option<String>,
        ctx: Vec<OasContext>,
    },
    /// Read of an unset modal variable
    Modal { variable: &'static str },
    /// Name-table failure: id conflict, mixed numbering modes
    Table { table: &'static str, msg: String },
    /// A forward reference never resolved by stream end
    DanglingRef { table: &'static str, refnum: u64 },
    /// Spec-valid but unsupported record, in the decoded context
    Unsupported(OasRecordType, Option<OasContext>),
    /// Degenerate or invalid geometry
    Geometry(String),
    /// CBLOCK compression or decompression failure
    Cblock(String),
    /// Cooperative cancellation of a long-running pass
    Cancelled,
    /// File opening, reading, and writing
    FileIO(String),
    /// Other decoding errors
    Decode(String),
    /// Other encoding errors
    Encode(String),
    /// Other errors
    Other(String),
}
impl fmt::Display for OasError {
    /// Display an [OasError].
    /// Functionally delegates to the (derived) [fmt::Debug] implementation.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
impl std::error::Error for OasError {}
impl From<std::io::Error> for OasError {
    fn from(e: std::io::Error) -> Self {
        OasError::FileIO(format!("{:?}", e))
    }
}
impl From<std::str::Utf8Error> for OasError {
    fn from(e: std::str::Utf8Error) -> Self {
        OasError::Decode(format!("{:?}", e))
    }
}
impl From<String> for OasError {
    fn from(e: String) -> Self {
        OasError::Other(e)
    }
}
impl From<OasLibraryBuilderError> for OasError {
    fn from(e: OasLibraryBuilderError) -> Self {
        OasError::Decode(format!("{}", e))
    }
}
