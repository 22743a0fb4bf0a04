//!
//! # Oas21 Reading & Parsing
//!
//! Two layers: [OasReader] decodes the OASIS byte primitives (variable-length
//! integers, reals, strings, deltas, point lists, repetitions) from any
//! [Read] source, transparently draining CBLOCK envelopes; [OasParser] drives
//! the record-level state machine over it, tracking modal state per cell and
//! resolving name-table references, forward ones included, into an
//! [OasLibrary].
//!

// Std-Lib Imports
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::mem;
use std::path::Path;

// Crates.io
use byteorder::{ByteOrder, LittleEndian};
use num_traits::FromPrimitive;

// Local Imports
use crate::cblock;
use crate::data::{
    OasCell, OasContext, OasElement, OasError, OasInterval, OasLayerName, OasLibrary, OasPath,
    OasPlacement, OasPoint, OasPolygon, OasReaderOpts, OasRecordType, OasRectangle, OasResult,
    OasTextElem, OasVector, OasWarning,
};
use crate::modal::ModalStore;
use crate::props::{OasPropValue, OasProperty, StringClass};
use crate::rep::Repetition;
use crate::tables::{NameRef, OasTables, TableMode};

/// The thirteen-byte stream header
pub const MAGIC: &[u8; 13] = b"%SEMI-OASIS\r\n";

/// The eight octal delta directions, in wire order
fn octal_direction(dir: u64) -> OasVector {
    match dir {
        0 => OasPoint::new(1, 0),   // East
        1 => OasPoint::new(0, 1),   // North
        2 => OasPoint::new(-1, 0),  // West
        3 => OasPoint::new(0, -1),  // South
        4 => OasPoint::new(1, 1),   // Northeast
        5 => OasPoint::new(-1, 1),  // Northwest
        6 => OasPoint::new(-1, -1), // Southwest
        _ => OasPoint::new(1, -1),  // Southeast
    }
}
/// Checked narrowing of table-sourced integers
fn to_u32(v: u64) -> OasResult<u32> {
    u32::try_from(v).map_err(|_| OasError::Decode(format!("value {} exceeds 32 bits", v)))
}
fn to_usize(v: u64) -> OasResult<usize> {
    usize::try_from(v).map_err(|_| OasError::Decode(format!("count {} exceeds address space", v)))
}

/// Preallocation ceiling for length-prefixed containers. Declared lengths
/// are untrusted; capacity past this arrives one element at a time.
const PREALLOC_CAP: usize = 1 << 16;

/// # OasReader
///
/// Byte-primitive decoder over any [Read] source. When a CBLOCK envelope is
/// opened its decompressed payload is drained first; primitive reads fall
/// back to the underlying source once the payload is exhausted.
pub struct OasReader<'src> {
    /// Byte source
    src: Box<dyn Read + 'src>,
    /// Bytes consumed from the underlying source
    pos: u64,
    /// Active CBLOCK payload, if any
    cblock: Option<Cursor<Vec<u8>>>,
    /// The next byte begins a record, so an open payload may end here
    at_record_boundary: bool,
}
impl<'src> OasReader<'src> {
    /// Create an [OasReader], opening the file at path `fname`
    pub fn open(fname: impl AsRef<Path>) -> OasResult<OasReader<'src>> {
        Ok(Self::new(BufReader::new(File::open(fname)?)))
    }
    /// Create an [OasReader] over `src`
    pub fn new(src: impl Read + 'src) -> OasReader<'src> {
        OasReader {
            src: Box::new(src),
            pos: 0,
            cblock: None,
            at_record_boundary: true,
        }
    }
    /// Mark a record boundary: the CBLOCK payload, if one is open, is
    /// allowed to end before the next byte
    pub(crate) fn mark_record_boundary(&mut self) {
        self.at_record_boundary = true;
    }
    /// Current position in the underlying (compressed) stream
    #[inline(always)]
    pub fn pos(&self) -> u64 {
        self.pos
    }
    /// Read a single byte, from the active CBLOCK payload if one is open
    fn read_byte(&mut self) -> OasResult<u8> {
        if let Some(cursor) = self.cblock.as_mut() {
            let mut b = [0u8; 1];
            if cursor.read(&mut b)? == 1 {
                self.at_record_boundary = false;
                return Ok(b[0]);
            }
            // Payload exhausted; resuming the source mid-record means the
            // envelope held a truncated record
            if !self.at_record_boundary {
                return Err(OasError::Cblock("payload ends mid-record".into()));
            }
            self.cblock = None;
        }
        let mut b = [0u8; 1];
        self.src.read_exact(&mut b)?;
        self.pos += 1;
        self.at_record_boundary = false;
        Ok(b[0])
    }
    /// Read `len` bytes
    fn read_bytes(&mut self, len: usize) -> OasResult<Vec<u8>> {
        let mut rv = Vec::with_capacity(len.min(PREALLOC_CAP));
        for _ in 0..len {
            rv.push(self.read_byte()?);
        }
        Ok(rv)
    }
    /// Read an unsigned integer, seven bits per byte, low bits first
    pub fn read_uint(&mut self) -> OasResult<u64> {
        let mut v: u64 = 0;
        let mut shift = 0u32;
        loop {
            let b = self.read_byte()?;
            let low = u64::from(b & 0x7f);
            if shift > 63 || (shift == 63 && low > 1) {
                return Err(OasError::Decode(
                    "unsigned integer overflows 64 bits".into(),
                ));
            }
            v |= low << shift;
            if b & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        Ok(v)
    }
    /// Read a signed integer: sign in the low bit, magnitude above it
    pub fn read_sint(&mut self) -> OasResult<i64> {
        let u = self.read_uint()?;
        let mag = (u >> 1) as i64;
        Ok(if u & 1 == 1 { -mag } else { mag })
    }
    /// Read a real number, form byte included
    pub fn read_real(&mut self) -> OasResult<f64> {
        let form = self.read_uint()?;
        self.read_real_form(form)
    }
    /// Read a real number whose form has already been consumed
    pub fn read_real_form(&mut self, form: u64) -> OasResult<f64> {
        match form {
            0 => Ok(self.read_uint()? as f64),
            1 => Ok(-(self.read_uint()? as f64)),
            2 | 3 => {
                let d = self.read_uint()?;
                if d == 0 {
                    return Err(OasError::Decode("zero denominator in reciprocal real".into()));
                }
                let v = 1.0 / d as f64;
                Ok(if form == 3 { -v } else { v })
            }
            4 | 5 => {
                let n = self.read_uint()?;
                let d = self.read_uint()?;
                if d == 0 {
                    return Err(OasError::Decode("zero denominator in ratio real".into()));
                }
                let v = n as f64 / d as f64;
                Ok(if form == 5 { -v } else { v })
            }
            6 => {
                let bytes = self.read_bytes(4)?;
                Ok(f64::from(LittleEndian::read_f32(&bytes)))
            }
            7 => {
                let bytes = self.read_bytes(8)?;
                Ok(LittleEndian::read_f64(&bytes))
            }
            _ => Err(OasError::Decode(format!("invalid real form {}", form))),
        }
    }
    /// Read a b-string: length-prefixed arbitrary bytes
    pub fn read_bstring(&mut self) -> OasResult<Vec<u8>> {
        let len = to_usize(self.read_uint()?)?;
        self.read_bytes(len)
    }
    /// Read an a-string: printable characters, spaces allowed
    pub fn read_astring(&mut self) -> OasResult<String> {
        let bytes = self.read_bstring()?;
        if bytes.iter().any(|b| !(0x20..=0x7e).contains(b)) {
            return Err(OasError::Decode("non-printable character in a-string".into()));
        }
        Ok(std::str::from_utf8(&bytes)?.to_string())
    }
    /// Read an n-string: non-empty printable characters, no spaces
    pub fn read_nstring(&mut self) -> OasResult<String> {
        let bytes = self.read_bstring()?;
        if bytes.is_empty() {
            return Err(OasError::Decode("empty n-string".into()));
        }
        if bytes.iter().any(|b| !(0x21..=0x7e).contains(b)) {
            return Err(OasError::Decode("illegal character in n-string".into()));
        }
        Ok(std::str::from_utf8(&bytes)?.to_string())
    }
    /// Read a g-delta: either an octal-direction magnitude or an (x, y) pair
    pub fn read_gdelta(&mut self) -> OasResult<OasVector> {
        let g = self.read_uint()?;
        if g & 1 == 0 {
            let mag = (g >> 4) as i64;
            Ok(octal_direction((g >> 1) & 0x7).scaled(mag))
        } else {
            let xmag = (g >> 2) as i64;
            let x = if g & 2 != 0 { -xmag } else { xmag };
            let y = self.read_sint()?;
            Ok(OasPoint::new(x, y))
        }
    }
    /// Decode a 2-delta: axis direction in the two low bits
    fn two_delta(v: u64) -> OasVector {
        octal_direction(v & 0x3).scaled((v >> 2) as i64)
    }
    /// Decode a 3-delta: octal direction in the three low bits
    fn three_delta(v: u64) -> OasVector {
        octal_direction(v & 0x7).scaled((v >> 3) as i64)
    }
    /// Read a point list into absolute vertices relative to an implicit
    /// origin vertex. `closing` appends the implicit squared-off final
    /// vertex used by polygon outlines of the alternating-delta types.
    pub fn read_point_list(&mut self, closing: bool) -> OasResult<Vec<OasPoint>> {
        let ptype = self.read_uint()?;
        let count = to_usize(self.read_uint()?)?;
        let mut pts = Vec::with_capacity(count.saturating_add(2).min(PREALLOC_CAP));
        pts.push(OasPoint::zero());
        let mut cur = OasPoint::zero();
        match ptype {
            // Alternating axis-parallel deltas, horizontal-first or vertical-first
            0 | 1 => {
                let mut horizontal = ptype == 0;
                for _ in 0..count {
                    let d = self.read_sint()?;
                    if horizontal {
                        cur.x += d;
                    } else {
                        cur.y += d;
                    }
                    horizontal = !horizontal;
                    pts.push(cur);
                }
                if closing {
                    // The outline's final vertex is implied by the alternation
                    let implied = if ptype == 0 {
                        OasPoint::new(0, cur.y)
                    } else {
                        OasPoint::new(cur.x, 0)
                    };
                    pts.push(implied);
                }
            }
            2 => {
                for _ in 0..count {
                    let v = self.read_uint()?;
                    cur += Self::two_delta(v);
                    pts.push(cur);
                }
            }
            3 => {
                for _ in 0..count {
                    let v = self.read_uint()?;
                    cur += Self::three_delta(v);
                    pts.push(cur);
                }
            }
            4 => {
                for _ in 0..count {
                    cur += self.read_gdelta()?;
                    pts.push(cur);
                }
            }
            // Second-order g-deltas: each stored delta adjusts the previous one
            5 => {
                let mut delta = OasPoint::zero();
                for _ in 0..count {
                    delta += self.read_gdelta()?;
                    cur += delta;
                    pts.push(cur);
                }
            }
            _ => {
                return Err(OasError::Decode(format!(
                    "invalid point-list type {}",
                    ptype
                )))
            }
        }
        Ok(pts)
    }
    /// Read a repetition dimension count, stored offset by two
    fn read_rep_dimension(&mut self) -> OasResult<u64> {
        self.read_uint()?
            .checked_add(2)
            .ok_or_else(|| OasError::Decode("repetition dimension overflows 64 bits".into()))
    }
    /// Read a delta-list count, stored offset by one
    fn read_rep_count(&mut self) -> OasResult<usize> {
        to_usize(self.read_uint()?)?
            .checked_add(1)
            .ok_or_else(|| OasError::Decode("repetition count overflows address space".into()))
    }
    /// Read a repetition of (non-modal) type `rtype`.
    /// Dimension counts are stored offset by two, delta-list counts by one.
    pub fn read_repetition(&mut self, rtype: u64) -> OasResult<Repetition> {
        match rtype {
            1 => {
                let n = self.read_rep_dimension()?;
                let m = self.read_rep_dimension()?;
                let dx = self.read_uint()? as i64;
                let dy = self.read_uint()? as i64;
                Ok(Repetition::Regular {
                    a: OasPoint::new(dx, 0),
                    b: OasPoint::new(0, dy),
                    n,
                    m,
                })
            }
            2 => {
                let n = self.read_rep_dimension()?;
                let dx = self.read_uint()? as i64;
                Ok(Repetition::row(OasPoint::new(dx, 0), n))
            }
            3 => {
                let n = self.read_rep_dimension()?;
                let dy = self.read_uint()? as i64;
                Ok(Repetition::row(OasPoint::new(0, dy), n))
            }
            4 | 5 | 6 | 7 => {
                let count = self.read_rep_count()?;
                let grid = if rtype == 5 || rtype == 7 {
                    self.read_uint()? as i64
                } else {
                    1
                };
                let mut pts = Vec::with_capacity(count.min(PREALLOC_CAP));
                let mut cum = 0i64;
                for _ in 0..count {
                    cum += self.read_uint()? as i64 * grid;
                    let v = if rtype <= 5 {
                        OasPoint::new(cum, 0)
                    } else {
                        OasPoint::new(0, cum)
                    };
                    pts.push(v);
                }
                Ok(Repetition::Irregular(pts))
            }
            8 => {
                let n = self.read_rep_dimension()?;
                let m = self.read_rep_dimension()?;
                let a = self.read_gdelta()?;
                let b = self.read_gdelta()?;
                Ok(Repetition::Regular { a, b, n, m })
            }
            9 => {
                let n = self.read_rep_dimension()?;
                let d = self.read_gdelta()?;
                Ok(Repetition::row(d, n))
            }
            10 | 11 => {
                let count = self.read_rep_count()?;
                let grid = if rtype == 11 {
                    self.read_uint()? as i64
                } else {
                    1
                };
                let mut pts = Vec::with_capacity(count.min(PREALLOC_CAP));
                let mut cum = OasPoint::zero();
                for _ in 0..count {
                    cum += self.read_gdelta()?.scaled(grid);
                    pts.push(cum);
                }
                Ok(Repetition::Irregular(pts))
            }
            _ => Err(OasError::Decode(format!(
                "invalid repetition type {}",
                rtype
            ))),
        }
    }
    /// Read a layer or datatype interval
    pub fn read_interval(&mut self) -> OasResult<OasInterval> {
        match self.read_uint()? {
            0 => Ok(OasInterval::all()),
            1 => Ok(OasInterval {
                lo: 0,
                hi: Some(to_u32(self.read_uint()?)?),
            }),
            2 => Ok(OasInterval {
                lo: to_u32(self.read_uint()?)?,
                hi: None,
            }),
            3 => Ok(OasInterval::exactly(to_u32(self.read_uint()?)?)),
            4 => {
                let lo = to_u32(self.read_uint()?)?;
                let hi = to_u32(self.read_uint()?)?;
                Ok(OasInterval { lo, hi: Some(hi) })
            }
            t => Err(OasError::Decode(format!("invalid interval type {}", t))),
        }
    }
    /// Open a CBLOCK envelope: decompress its payload and drain it before
    /// the underlying source. CBLOCKs do not nest.
    pub(crate) fn begin_cblock(&mut self) -> OasResult<()> {
        if self.cblock.is_some() {
            return Err(OasError::Cblock("nested CBLOCK".into()));
        }
        let comp_type = self.read_uint()?;
        if comp_type != cblock::COMP_TYPE_DEFLATE {
            return Err(OasError::Cblock(format!(
                "unknown comp-type {}",
                comp_type
            )));
        }
        let uncomp_count = self.read_uint()?;
        let comp_count = to_usize(self.read_uint()?)?;
        let payload = self.read_bytes(comp_count)?;
        self.cblock = Some(Cursor::new(cblock::inflate(&payload, uncomp_count)?));
        Ok(())
    }
}

/// The object a resolved forward reference patches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PropTarget {
    Library,
    Cell(usize),
    Elem(usize, usize),
}

/// A deferred fix-up, queued in a name table until its number resolves
#[derive(Debug, Clone)]
pub(crate) enum RefPatch {
    /// Name of the cell definition at `cells[cell]`
    CellName { cell: usize },
    /// Referenced cell of the placement at `cells[cell].elems[elem]`
    PlacementCell { cell: usize, elem: usize },
    /// String of the text element at `cells[cell].elems[elem]`
    TextString { cell: usize, elem: usize },
    /// Name of a property
    PropName { target: PropTarget, prop: usize },
    /// String value within a property
    PropValue {
        target: PropTarget,
        prop: usize,
        value: usize,
    },
}

/// # OasParser
///
/// Record-level state machine: reads record ids one at a time, decodes their
/// content against the modal store, and accumulates an [OasLibrary].
/// Forward references queue in the name tables and are patched during the
/// end-of-stream fix-up pass.
pub struct OasParser<'src> {
    /// Byte-primitive reader
    rdr: OasReader<'src>,
    /// Reader options
    opts: OasReaderOpts,
    /// Modal variable store, reset at each cell boundary
    modal: ModalStore,
    /// The five name tables
    tables: OasTables<RefPatch>,
    /// Library under construction
    lib: OasLibrary,
    /// One-record pushback, for cell-terminating records
    pending: Option<OasRecordType>,
    /// Terminal latch: once the END record is parsed, stay there
    done: bool,
    /// Number of records read
    numread: usize,
    /// Context Stack
    ctx_stack: Vec<OasContext>,
    /// Accumulated non-fatal diagnostics
    warnings: Vec<OasWarning>,
    /// Table offsets deferred to the END record
    offsets_in_trailer: bool,
    /// Any table-offset pair carried the strict flag
    strict_tables_seen: bool,
    /// Index of the cell being parsed
    cur_cell: Option<usize>,
    /// Owner of the next PROPERTY record. `None` once the owner has been
    /// dropped, so trailing properties are discarded rather than misattached.
    last_target: Option<PropTarget>,
}
impl<'src> OasParser<'src> {
    /// Create a new [OasParser] for the file at path `fname`
    pub fn open(fname: impl AsRef<Path>, opts: OasReaderOpts) -> OasResult<OasParser<'src>> {
        Ok(Self::new(OasReader::open(fname)?, opts))
    }
    /// Create a new [OasParser] over byte-slice `bytes`
    pub fn from_bytes(bytes: &'src [u8], opts: OasReaderOpts) -> OasParser<'src> {
        Self::new(OasReader::new(bytes), opts)
    }
    /// Create a new [OasParser] over `rdr`
    pub fn new(rdr: OasReader<'src>, opts: OasReaderOpts) -> OasParser<'src> {
        OasParser {
            rdr,
            opts,
            modal: ModalStore::new(),
            tables: OasTables::new(),
            lib: OasLibrary::new(),
            pending: None,
            done: false,
            numread: 0,
            ctx_stack: Vec::new(),
            warnings: Vec::new(),
            offsets_in_trailer: false,
            strict_tables_seen: false,
            cur_cell: None,
            last_target: Some(PropTarget::Library),
        }
    }
    /// Warnings accumulated so far
    pub fn warnings(&self) -> &[OasWarning] {
        &self.warnings
    }
    /// Advance to the next record id. Respects the one-record pushback and
    /// latches on the END record.
    fn next_record(&mut self) -> OasResult<OasRecordType> {
        if let Some(r) = self.pending.take() {
            return Ok(r);
        }
        if self.done {
            return Ok(OasRecordType::End);
        }
        self.rdr.mark_record_boundary();
        let byte = self.rdr.read_byte()?;
        let rtype =
            FromPrimitive::from_u8(byte).ok_or(OasError::InvalidRecordType(byte))?;
        self.numread += 1;
        Ok(rtype)
    }
    /// Parse an [OasLibrary]. The start-state when reading an OASIS file.
    pub fn parse_lib(&mut self) -> OasResult<OasLibrary> {
        self.ctx_stack.push(OasContext::Library);
        let magic = self.rdr.read_bytes(MAGIC.len())?;
        if magic != MAGIC {
            return self.fail("missing OASIS magic string");
        }
        match self.next_record()? {
            OasRecordType::Start => self.parse_start()?,
            _ => return self.fail("missing START record"),
        }
        loop {
            let r = self.next_record()?;
            match r {
                OasRecordType::End => {
                    self.parse_trailer()?;
                    break;
                }
                OasRecordType::Pad => (),
                OasRecordType::Cblock => self.rdr.begin_cblock()?,
                OasRecordType::CellByName => {
                    let name = self.rdr.read_nstring()?;
                    self.parse_cell(name)?;
                }
                OasRecordType::CellByRef => {
                    let refnum = self.rdr.read_uint()?;
                    let ci = self.lib.cells.len();
                    let name = match self
                        .tables
                        .cellnames
                        .resolve_or_defer(refnum, RefPatch::CellName { cell: ci })
                    {
                        Some((name, _)) => name,
                        None => String::new(),
                    };
                    self.parse_cell(name)?;
                }
                OasRecordType::CellnameImplicit
                | OasRecordType::CellnameExplicit
                | OasRecordType::TextstringImplicit
                | OasRecordType::TextstringExplicit
                | OasRecordType::PropnameImplicit
                | OasRecordType::PropnameExplicit
                | OasRecordType::PropstringImplicit
                | OasRecordType::PropstringExplicit => self.parse_name_record(r)?,
                OasRecordType::LayernameGeometry => self.parse_layername(false)?,
                OasRecordType::LayernameText => self.parse_layername(true)?,
                OasRecordType::Property => self.parse_property()?,
                OasRecordType::PropertyRepeat => self.repeat_property()?,
                // Spec-valid but unsupported records
                OasRecordType::XnameImplicit
                | OasRecordType::XnameExplicit
                | OasRecordType::Xelement
                | OasRecordType::Xgeometry => {
                    return Err(OasError::Unsupported(r, Some(OasContext::Library)))
                }
                // Invalid at library level
                _ => return self.invalid(r),
            }
        }
        self.finish()?;
        self.ctx_stack.pop();
        Ok(mem::take(&mut self.lib))
    }
    /// Parse the START record: version, unit, and offset-flag
    fn parse_start(&mut self) -> OasResult<()> {
        let version = self.rdr.read_astring()?;
        if version != "1.0" {
            self.warn(format!("unsupported format version {:?}", version), 2)?;
        }
        let unit = self.rdr.read_real()?;
        if !(unit > 0.0) {
            return self.fail("non-positive database unit");
        }
        self.lib.version = version;
        self.lib.unit = unit;
        match self.rdr.read_uint()? {
            0 => self.parse_table_offsets()?,
            1 => self.offsets_in_trailer = true,
            f => return self.fail(format!("invalid offset-flag {}", f)),
        }
        Ok(())
    }
    /// Parse the six table-offset pairs, in their fixed order
    fn parse_table_offsets(&mut self) -> OasResult<()> {
        self.ctx_stack.push(OasContext::Tables);
        let mut pairs = [(false, 0u64); 6];
        for pair in pairs.iter_mut() {
            let flag = match self.rdr.read_uint()? {
                0 => false,
                1 => true,
                f => return self.fail(format!("invalid table-offset flag {}", f)),
            };
            *pair = (flag, self.rdr.read_uint()?);
        }
        let tables = [
            &mut self.tables.cellnames,
            &mut self.tables.textstrings,
            &mut self.tables.propnames,
            &mut self.tables.propstrings,
            &mut self.tables.layernames,
        ];
        for (table, (strict, offset)) in tables.into_iter().zip(pairs.iter()) {
            table.strict = *strict;
            table.stream_offset = if *offset != 0 { Some(*offset) } else { None };
            if *strict {
                self.strict_tables_seen = true;
            }
        }
        // The sixth pair covers the XNAME table, which carries no
        // supported content
        self.ctx_stack.pop();
        Ok(())
    }
    /// Parse the END record: deferred offsets, padding, and validation
    fn parse_trailer(&mut self) -> OasResult<()> {
        self.ctx_stack.push(OasContext::Trailer);
        if self.offsets_in_trailer {
            self.parse_table_offsets()?;
        }
        let _padding = self.rdr.read_bstring()?;
        let scheme = self.rdr.read_uint()?;
        if scheme != 0 {
            // Checksum signatures are skipped, not verified
            let _signature = self.rdr.read_bytes(4)?;
            self.warn(
                format!("validation signature (scheme {}) not verified", scheme),
                1,
            )?;
        }
        self.done = true;
        self.ctx_stack.pop();
        Ok(())
    }
    /// CELLNAME records bind trailing properties to the named cell when one
    /// is defined, and to the library otherwise
    fn cellname_target(&self, name: &str) -> PropTarget {
        match self.lib.cells.iter().position(|c| c.name == name) {
            Some(ci) => PropTarget::Cell(ci),
            None => PropTarget::Library,
        }
    }
    /// Declare a name-table record of type `rtype`
    fn parse_name_record(&mut self, rtype: OasRecordType) -> OasResult<()> {
        use OasRecordType::*;
        self.last_target = Some(PropTarget::Library);
        match rtype {
            CellnameImplicit => {
                let name = self.rdr.read_nstring()?;
                self.last_target = Some(self.cellname_target(&name));
                self.tables.cellnames.declare_implicit(name)?;
            }
            CellnameExplicit => {
                let name = self.rdr.read_nstring()?;
                let refnum = self.rdr.read_uint()?;
                self.last_target = Some(self.cellname_target(&name));
                self.tables.cellnames.declare(refnum, name)?;
            }
            TextstringImplicit => {
                let s = self.rdr.read_astring()?;
                self.tables.textstrings.declare_implicit(s)?;
            }
            TextstringExplicit => {
                let s = self.rdr.read_astring()?;
                let refnum = self.rdr.read_uint()?;
                self.tables.textstrings.declare(refnum, s)?;
            }
            PropnameImplicit => {
                let name = self.rdr.read_nstring()?;
                self.tables.propnames.declare_implicit(name)?;
            }
            PropnameExplicit => {
                let name = self.rdr.read_nstring()?;
                let refnum = self.rdr.read_uint()?;
                self.tables.propnames.declare(refnum, name)?;
            }
            PropstringImplicit => {
                let bytes = self.rdr.read_bstring()?;
                let s = std::str::from_utf8(&bytes)?.to_string();
                self.tables.propstrings.declare_implicit(s)?;
            }
            PropstringExplicit => {
                let bytes = self.rdr.read_bstring()?;
                let s = std::str::from_utf8(&bytes)?.to_string();
                let refnum = self.rdr.read_uint()?;
                self.tables.propstrings.declare(refnum, s)?;
            }
            _ => return self.invalid(rtype),
        }
        Ok(())
    }
    /// Parse a LAYERNAME record, geometry- or text-layer flavored
    fn parse_layername(&mut self, is_text: bool) -> OasResult<()> {
        self.last_target = Some(PropTarget::Library);
        let name = self.rdr.read_nstring()?;
        let layers = self.rdr.read_interval()?;
        let types = self.rdr.read_interval()?;
        self.lib.layernames.push(OasLayerName {
            name,
            layers,
            types,
            is_text,
        });
        Ok(())
    }
    /// Parse a cell body: element, property, and mode records up to the next
    /// cell-level record. Modal state resets at entry.
    fn parse_cell(&mut self, name: String) -> OasResult<()> {
        self.ctx_stack.push(OasContext::Cell);
        self.modal.reset();
        let ci = self.lib.cells.len();
        self.lib.cells.push(OasCell::new(name));
        self.cur_cell = Some(ci);
        self.last_target = Some(PropTarget::Cell(ci));
        loop {
            let r = self.next_record()?;
            match r {
                // Cell-terminating records return to the library loop
                OasRecordType::End
                | OasRecordType::CellByName
                | OasRecordType::CellByRef
                | OasRecordType::CellnameImplicit
                | OasRecordType::CellnameExplicit
                | OasRecordType::TextstringImplicit
                | OasRecordType::TextstringExplicit
                | OasRecordType::PropnameImplicit
                | OasRecordType::PropnameExplicit
                | OasRecordType::PropstringImplicit
                | OasRecordType::PropstringExplicit
                | OasRecordType::LayernameGeometry
                | OasRecordType::LayernameText => {
                    self.pending = Some(r);
                    break;
                }
                OasRecordType::Pad => (),
                OasRecordType::Cblock => self.rdr.begin_cblock()?,
                OasRecordType::XyAbsolute => self.modal.xy_absolute = true,
                OasRecordType::XyRelative => self.modal.xy_absolute = false,
                OasRecordType::Rectangle => self.parse_rectangle(ci)?,
                OasRecordType::Polygon => self.parse_polygon(ci)?,
                OasRecordType::Path => self.parse_path(ci)?,
                OasRecordType::Text => self.parse_text(ci)?,
                OasRecordType::Placement => self.parse_placement(ci, false)?,
                OasRecordType::PlacementTransform => self.parse_placement(ci, true)?,
                OasRecordType::Property => self.parse_property()?,
                OasRecordType::PropertyRepeat => self.repeat_property()?,
                // Spec-valid but unsupported records
                OasRecordType::Trapezoid
                | OasRecordType::TrapezoidA
                | OasRecordType::TrapezoidB
                | OasRecordType::Ctrapezoid
                | OasRecordType::Circle
                | OasRecordType::Xelement
                | OasRecordType::Xgeometry => {
                    return Err(OasError::Unsupported(r, Some(OasContext::Cell)))
                }
                // Invalid inside a cell
                _ => return self.invalid(r),
            }
        }
        self.cur_cell = None;
        self.ctx_stack.pop();
        Ok(())
    }
    /// Apply a coordinate field to its modal position slot
    fn update_coord(cur: &mut i64, val: i64, absolute: bool) {
        if absolute {
            *cur = val;
        } else {
            *cur += val;
        }
    }
    /// Read the repetition field: type zero reuses the modal value,
    /// all others replace it
    fn read_repetition_field(&mut self) -> OasResult<Repetition> {
        self.ctx_stack.push(OasContext::Repetition);
        let rtype = self.rdr.read_uint()?;
        let rep = if rtype == 0 {
            self.modal.repetition.get()?.clone()
        } else {
            let rep = self.rdr.read_repetition(rtype)?;
            self.modal.repetition.set(rep.clone());
            rep
        };
        self.ctx_stack.pop();
        Ok(rep)
    }
    /// Append `elem` to cell `ci` and make it the property target
    fn push_elem(&mut self, ci: usize, elem: OasElement) {
        let ei = self.lib.cells[ci].elems.len();
        self.lib.cells[ci].elems.push(elem);
        self.last_target = Some(PropTarget::Elem(ci, ei));
    }
    /// Parse a RECTANGLE record. Info-byte `SWHXYRDL`.
    fn parse_rectangle(&mut self, ci: usize) -> OasResult<()> {
        self.ctx_stack.push(OasContext::Rectangle);
        let info = self.rdr.read_byte()?;
        let square = info & 0x80 != 0;
        if info & 0x01 != 0 {
            let v = to_u32(self.rdr.read_uint()?)?;
            self.modal.layer.set(v);
        }
        let layer = *self.modal.layer.get()?;
        if info & 0x02 != 0 {
            let v = to_u32(self.rdr.read_uint()?)?;
            self.modal.datatype.set(v);
        }
        let datatype = *self.modal.datatype.get()?;
        if info & 0x40 != 0 {
            let v = self.rdr.read_uint()?;
            self.modal.geometry_w.set(v);
        }
        let width = *self.modal.geometry_w.get()?;
        if square {
            if info & 0x20 != 0 {
                return self.fail("square rectangle with explicit height");
            }
            self.modal.geometry_h.set(width);
        } else if info & 0x20 != 0 {
            let v = self.rdr.read_uint()?;
            self.modal.geometry_h.set(v);
        }
        let height = *self.modal.geometry_h.get()?;
        if info & 0x10 != 0 {
            let v = self.rdr.read_sint()?;
            Self::update_coord(&mut self.modal.geometry_x, v, self.modal.xy_absolute);
        }
        if info & 0x08 != 0 {
            let v = self.rdr.read_sint()?;
            Self::update_coord(&mut self.modal.geometry_y, v, self.modal.xy_absolute);
        }
        let repetition = if info & 0x04 != 0 {
            Some(self.read_repetition_field()?)
        } else {
            None
        };
        self.push_elem(
            ci,
            OasRectangle {
                layer,
                datatype,
                x: self.modal.geometry_x,
                y: self.modal.geometry_y,
                width,
                height,
                repetition,
                properties: Vec::new(),
            }
            .into(),
        );
        self.ctx_stack.pop();
        Ok(())
    }
    /// Parse a POLYGON record. Info-byte `00PXYRDL`.
    fn parse_polygon(&mut self, ci: usize) -> OasResult<()> {
        self.ctx_stack.push(OasContext::Polygon);
        let info = self.rdr.read_byte()?;
        if info & 0x01 != 0 {
            let v = to_u32(self.rdr.read_uint()?)?;
            self.modal.layer.set(v);
        }
        let layer = *self.modal.layer.get()?;
        if info & 0x02 != 0 {
            let v = to_u32(self.rdr.read_uint()?)?;
            self.modal.datatype.set(v);
        }
        let datatype = *self.modal.datatype.get()?;
        if info & 0x20 != 0 {
            self.ctx_stack.push(OasContext::PointList);
            let pts = self.rdr.read_point_list(true)?;
            self.ctx_stack.pop();
            self.modal.polygon_points.set(pts);
        }
        let points = self.modal.polygon_points.get()?.clone();
        if info & 0x10 != 0 {
            let v = self.rdr.read_sint()?;
            Self::update_coord(&mut self.modal.geometry_x, v, self.modal.xy_absolute);
        }
        if info & 0x08 != 0 {
            let v = self.rdr.read_sint()?;
            Self::update_coord(&mut self.modal.geometry_y, v, self.modal.xy_absolute);
        }
        let repetition = if info & 0x04 != 0 {
            Some(self.read_repetition_field()?)
        } else {
            None
        };
        if points.len() < 3 {
            if self.opts.permissive {
                self.warn("degenerate polygon dropped".to_string(), 2)?;
                self.last_target = None;
                self.ctx_stack.pop();
                return Ok(());
            }
            return Err(OasError::Geometry(format!(
                "polygon with {} vertices",
                points.len()
            )));
        }
        self.push_elem(
            ci,
            OasPolygon {
                layer,
                datatype,
                x: self.modal.geometry_x,
                y: self.modal.geometry_y,
                points,
                repetition,
                properties: Vec::new(),
            }
            .into(),
        );
        self.ctx_stack.pop();
        Ok(())
    }
    /// Parse a PATH record. Info-byte `EWPXYRDL`.
    fn parse_path(&mut self, ci: usize) -> OasResult<()> {
        self.ctx_stack.push(OasContext::Path);
        let info = self.rdr.read_byte()?;
        if info & 0x01 != 0 {
            let v = to_u32(self.rdr.read_uint()?)?;
            self.modal.layer.set(v);
        }
        let layer = *self.modal.layer.get()?;
        if info & 0x02 != 0 {
            let v = to_u32(self.rdr.read_uint()?)?;
            self.modal.datatype.set(v);
        }
        let datatype = *self.modal.datatype.get()?;
        if info & 0x40 != 0 {
            let v = self.rdr.read_uint()?;
            self.modal.path_half_width.set(v);
        }
        let half_width = *self.modal.path_half_width.get()?;
        if info & 0x80 != 0 {
            // Extension scheme: two-bit fields for the start and end,
            // each modal / flush / half-width / explicit
            let scheme = self.rdr.read_uint()?;
            match (scheme >> 2) & 0x3 {
                0 => (),
                1 => self.modal.path_start_ext.set(0),
                2 => self.modal.path_start_ext.set(half_width as i64),
                _ => {
                    let v = self.rdr.read_sint()?;
                    self.modal.path_start_ext.set(v);
                }
            }
            match scheme & 0x3 {
                0 => (),
                1 => self.modal.path_end_ext.set(0),
                2 => self.modal.path_end_ext.set(half_width as i64),
                _ => {
                    let v = self.rdr.read_sint()?;
                    self.modal.path_end_ext.set(v);
                }
            }
        }
        let start_ext = *self.modal.path_start_ext.get()?;
        let end_ext = *self.modal.path_end_ext.get()?;
        if info & 0x20 != 0 {
            self.ctx_stack.push(OasContext::PointList);
            let pts = self.rdr.read_point_list(false)?;
            self.ctx_stack.pop();
            self.modal.path_points.set(pts);
        }
        let points = self.modal.path_points.get()?.clone();
        if info & 0x10 != 0 {
            let v = self.rdr.read_sint()?;
            Self::update_coord(&mut self.modal.geometry_x, v, self.modal.xy_absolute);
        }
        if info & 0x08 != 0 {
            let v = self.rdr.read_sint()?;
            Self::update_coord(&mut self.modal.geometry_y, v, self.modal.xy_absolute);
        }
        let repetition = if info & 0x04 != 0 {
            Some(self.read_repetition_field()?)
        } else {
            None
        };
        if points.len() < 2 {
            if self.opts.permissive {
                self.warn("degenerate path dropped".to_string(), 2)?;
                self.last_target = None;
                self.ctx_stack.pop();
                return Ok(());
            }
            return Err(OasError::Geometry(format!(
                "path with {} vertices",
                points.len()
            )));
        }
        self.push_elem(
            ci,
            OasPath {
                layer,
                datatype,
                x: self.modal.geometry_x,
                y: self.modal.geometry_y,
                half_width,
                start_ext,
                end_ext,
                points,
                repetition,
                properties: Vec::new(),
            }
            .into(),
        );
        self.ctx_stack.pop();
        Ok(())
    }
    /// Parse a TEXT record. Info-byte `0CNXYRTL`.
    fn parse_text(&mut self, ci: usize) -> OasResult<()> {
        self.ctx_stack.push(OasContext::Text);
        let info = self.rdr.read_byte()?;
        if info & 0x40 != 0 {
            let nref = if info & 0x20 != 0 {
                NameRef::Id(self.rdr.read_uint()?)
            } else {
                NameRef::Name(self.rdr.read_astring()?)
            };
            self.modal.text_string.set(nref);
        }
        let sref = self.modal.text_string.get()?.clone();
        if info & 0x01 != 0 {
            let v = to_u32(self.rdr.read_uint()?)?;
            self.modal.textlayer.set(v);
        }
        let layer = *self.modal.textlayer.get()?;
        if info & 0x02 != 0 {
            let v = to_u32(self.rdr.read_uint()?)?;
            self.modal.texttype.set(v);
        }
        let texttype = *self.modal.texttype.get()?;
        if info & 0x10 != 0 {
            let v = self.rdr.read_sint()?;
            Self::update_coord(&mut self.modal.text_x, v, self.modal.xy_absolute);
        }
        if info & 0x08 != 0 {
            let v = self.rdr.read_sint()?;
            Self::update_coord(&mut self.modal.text_y, v, self.modal.xy_absolute);
        }
        let repetition = if info & 0x04 != 0 {
            Some(self.read_repetition_field()?)
        } else {
            None
        };
        let ei = self.lib.cells[ci].elems.len();
        let string = match sref {
            NameRef::Name(s) => s,
            NameRef::Id(id) => match self
                .tables
                .textstrings
                .resolve_or_defer(id, RefPatch::TextString { cell: ci, elem: ei })
            {
                Some((s, _)) => s,
                None => String::new(),
            },
        };
        self.push_elem(
            ci,
            OasTextElem {
                string,
                layer,
                texttype,
                x: self.modal.text_x,
                y: self.modal.text_y,
                repetition,
                properties: Vec::new(),
            }
            .into(),
        );
        self.ctx_stack.pop();
        Ok(())
    }
    /// Parse a PLACEMENT record: info-byte `CNXYRAAF` (restricted angles) or
    /// `CNXYRMAF` (`transform` form, with magnification and angle reals)
    fn parse_placement(&mut self, ci: usize, transform: bool) -> OasResult<()> {
        self.ctx_stack.push(OasContext::Placement);
        let info = self.rdr.read_byte()?;
        if info & 0x80 != 0 {
            let cref = if info & 0x40 != 0 {
                NameRef::Id(self.rdr.read_uint()?)
            } else {
                NameRef::Name(self.rdr.read_nstring()?)
            };
            self.modal.placement_cell.set(cref);
        }
        let cref = self.modal.placement_cell.get()?.clone();
        let (mag, angle) = if transform {
            let mag = if info & 0x04 != 0 {
                self.rdr.read_real()?
            } else {
                1.0
            };
            let angle = if info & 0x02 != 0 {
                self.rdr.read_real()?
            } else {
                0.0
            };
            if !(mag > 0.0) {
                return self.fail("non-positive placement magnification");
            }
            (mag, angle)
        } else {
            (1.0, f64::from((info >> 1) & 0x3) * 90.0)
        };
        if info & 0x20 != 0 {
            let v = self.rdr.read_sint()?;
            Self::update_coord(&mut self.modal.placement_x, v, self.modal.xy_absolute);
        }
        if info & 0x10 != 0 {
            let v = self.rdr.read_sint()?;
            Self::update_coord(&mut self.modal.placement_y, v, self.modal.xy_absolute);
        }
        let repetition = if info & 0x08 != 0 {
            Some(self.read_repetition_field()?)
        } else {
            None
        };
        let ei = self.lib.cells[ci].elems.len();
        let cell = match cref {
            NameRef::Name(s) => s,
            NameRef::Id(id) => match self
                .tables
                .cellnames
                .resolve_or_defer(id, RefPatch::PlacementCell { cell: ci, elem: ei })
            {
                Some((s, _)) => s,
                None => String::new(),
            },
        };
        self.push_elem(
            ci,
            OasPlacement {
                cell,
                x: self.modal.placement_x,
                y: self.modal.placement_y,
                mag,
                angle,
                flip: info & 0x01 != 0,
                repetition,
                properties: Vec::new(),
            }
            .into(),
        );
        self.ctx_stack.pop();
        Ok(())
    }
    /// Read one property value, tagged by its kind integer
    fn read_prop_value(&mut self) -> OasResult<OasPropValue> {
        let kind = self.rdr.read_uint()?;
        match kind {
            0..=7 => Ok(OasPropValue::Real(self.rdr.read_real_form(kind)?)),
            8 => Ok(OasPropValue::Unsigned(self.rdr.read_uint()?)),
            9 => Ok(OasPropValue::Signed(self.rdr.read_sint()?)),
            10 => Ok(OasPropValue::AString(self.rdr.read_astring()?)),
            11 => Ok(OasPropValue::BString(self.rdr.read_bstring()?)),
            12 => Ok(OasPropValue::NString(self.rdr.read_nstring()?)),
            13 => Ok(OasPropValue::StringRef {
                refnum: self.rdr.read_uint()?,
                class: StringClass::A,
            }),
            14 => Ok(OasPropValue::StringRef {
                refnum: self.rdr.read_uint()?,
                class: StringClass::B,
            }),
            15 => Ok(OasPropValue::StringRef {
                refnum: self.rdr.read_uint()?,
                class: StringClass::N,
            }),
            _ => Err(OasError::Decode(format!(
                "invalid property value kind {}",
                kind
            ))),
        }
    }
    /// Parse a PROPERTY record. Info-byte `UUUUVCNS`.
    fn parse_property(&mut self) -> OasResult<()> {
        self.ctx_stack.push(OasContext::Property);
        let info = self.rdr.read_byte()?;
        let value_count = info >> 4;
        if info & 0x04 != 0 {
            let nref = if info & 0x02 != 0 {
                NameRef::Id(self.rdr.read_uint()?)
            } else {
                NameRef::Name(self.rdr.read_nstring()?)
            };
            self.modal.prop_name.set(nref);
        }
        self.modal.prop_standard.set(info & 0x01 != 0);
        if info & 0x08 == 0 {
            let count = if value_count == 15 {
                to_usize(self.rdr.read_uint()?)?
            } else {
                usize::from(value_count)
            };
            let mut values = Vec::with_capacity(count.min(PREALLOC_CAP));
            for _ in 0..count {
                values.push(self.read_prop_value()?);
            }
            self.modal.prop_values.set(values);
        } else if value_count != 0 {
            return self.fail("non-zero value count with modal reuse flag");
        }
        let name_ref = self.modal.prop_name.get()?.clone();
        let values = self.modal.prop_values.get()?.clone();
        let standard = *self.modal.prop_standard.get()?;
        self.attach_property(name_ref, values, standard)?;
        self.ctx_stack.pop();
        Ok(())
    }
    /// Parse a repeated-PROPERTY record: the whole modal last property again
    fn repeat_property(&mut self) -> OasResult<()> {
        self.ctx_stack.push(OasContext::Property);
        let name_ref = self.modal.prop_name.get()?.clone();
        let values = self.modal.prop_values.get()?.clone();
        let standard = *self.modal.prop_standard.get()?;
        self.attach_property(name_ref, values, standard)?;
        self.ctx_stack.pop();
        Ok(())
    }
    /// Attach a property to the current target, resolving or deferring its
    /// name and string-value references
    fn attach_property(
        &mut self,
        name_ref: NameRef,
        values: Vec<OasPropValue>,
        standard: bool,
    ) -> OasResult<()> {
        let target = match self.last_target {
            Some(t) => t,
            None => {
                // The owning element was dropped; its properties go with it
                return self.warn("property of a dropped element discarded".to_string(), 2);
            }
        };
        let pi = self.props_len(target);
        let name = match name_ref {
            NameRef::Name(s) => s,
            NameRef::Id(id) => match self
                .tables
                .propnames
                .resolve_or_defer(id, RefPatch::PropName { target, prop: pi })
            {
                Some((s, _)) => s,
                None => String::new(),
            },
        };
        let mut prop = OasProperty {
            name,
            values,
            standard,
        };
        for (vi, value) in prop.values.iter_mut().enumerate() {
            if let OasPropValue::StringRef { refnum, .. } = value {
                let patch = RefPatch::PropValue {
                    target,
                    prop: pi,
                    value: vi,
                };
                if let Some((s, _)) = self.tables.propstrings.resolve_or_defer(*refnum, patch) {
                    value.resolve(&s);
                }
            }
        }
        self.props_vec_mut(target).push(prop);
        Ok(())
    }
    /// Number of properties already attached to `target`
    fn props_len(&self, target: PropTarget) -> usize {
        match target {
            PropTarget::Library => self.lib.properties.len(),
            PropTarget::Cell(ci) => self.lib.cells[ci].properties.len(),
            PropTarget::Elem(ci, ei) => self.lib.cells[ci].elems[ei].properties().len(),
        }
    }
    /// Mutable property list of `target`
    fn props_vec_mut(&mut self, target: PropTarget) -> &mut Vec<OasProperty> {
        match target {
            PropTarget::Library => &mut self.lib.properties,
            PropTarget::Cell(ci) => &mut self.lib.cells[ci].properties,
            PropTarget::Elem(ci, ei) => self.lib.cells[ci].elems[ei].properties_mut(),
        }
    }
    /// Apply a resolved forward reference
    fn apply_patch(&mut self, name: &str, patch: RefPatch) {
        match patch {
            RefPatch::CellName { cell } => {
                if let Some(c) = self.lib.cells.get_mut(cell) {
                    c.name = name.to_string();
                }
            }
            RefPatch::PlacementCell { cell, elem } => {
                if let Some(OasElement::OasPlacement(p)) = self
                    .lib
                    .cells
                    .get_mut(cell)
                    .and_then(|c| c.elems.get_mut(elem))
                {
                    p.cell = name.to_string();
                }
            }
            RefPatch::TextString { cell, elem } => {
                if let Some(OasElement::OasTextElem(t)) = self
                    .lib
                    .cells
                    .get_mut(cell)
                    .and_then(|c| c.elems.get_mut(elem))
                {
                    t.string = name.to_string();
                }
            }
            RefPatch::PropName { target, prop } => {
                if let Some(p) = self.props_vec_mut(target).get_mut(prop) {
                    p.name = name.to_string();
                }
            }
            RefPatch::PropValue {
                target,
                prop,
                value,
            } => {
                if let Some(v) = self
                    .props_vec_mut(target)
                    .get_mut(prop)
                    .and_then(|p| p.values.get_mut(value))
                {
                    v.resolve(name);
                }
            }
        }
    }
    /// End-of-stream fix-up: flush forward references, enforce strict-mode
    /// expectations, consume standard properties, and sanity-check placements
    fn finish(&mut self) -> OasResult<()> {
        for (_, name, patch) in self.tables.cellnames.finish()? {
            self.apply_patch(&name, patch);
        }
        for (_, name, patch) in self.tables.textstrings.finish()? {
            self.apply_patch(&name, patch);
        }
        for (_, name, patch) in self.tables.propnames.finish()? {
            self.apply_patch(&name, patch);
        }
        for (_, name, patch) in self.tables.propstrings.finish()? {
            self.apply_patch(&name, patch);
        }
        match self.opts.expect_strict {
            Some(true) => {
                if !self.strict_tables_seen {
                    return self.fail("expected a strict-mode stream");
                }
                let tables = [
                    &self.tables.cellnames,
                    &self.tables.textstrings,
                    &self.tables.propnames,
                    &self.tables.propstrings,
                ];
                for table in tables {
                    if !table.is_empty() && table.mode() != Some(TableMode::Explicit) {
                        return Err(OasError::Table {
                            table: table.table_name(),
                            msg: "strict mode requires explicit numbering".into(),
                        });
                    }
                }
            }
            Some(false) => {
                if self.strict_tables_seen {
                    return self.fail("expected a non-strict stream");
                }
            }
            None => (),
        }
        if !self.opts.read_all_properties {
            self.consume_std_properties()?;
        }
        // Placements of resolved but undefined cell names are suspicious,
        // not fatal
        let defined: std::collections::HashSet<String> =
            self.lib.cells.iter().map(|c| c.name.clone()).collect();
        let mut missing = Vec::new();
        for cell in &self.lib.cells {
            for elem in &cell.elems {
                if let OasElement::OasPlacement(p) = elem {
                    if !p.cell.is_empty() && !defined.contains(&p.cell) {
                        missing.push(format!(
                            "cell {:?} places undefined cell {:?}",
                            cell.name, p.cell
                        ));
                    }
                }
            }
        }
        for msg in missing {
            self.warn(msg, 1)?;
        }
        Ok(())
    }
    /// Fold recognized standard properties into their first-class fields
    fn consume_std_properties(&mut self) -> OasResult<()> {
        let props = mem::take(&mut self.lib.properties);
        let mut kept = Vec::new();
        for p in props {
            if !crate::props::consume_library_std(&mut self.lib, &p)? {
                kept.push(p);
            }
        }
        self.lib.properties = kept;
        for ci in 0..self.lib.cells.len() {
            let props = mem::take(&mut self.lib.cells[ci].properties);
            let mut kept = Vec::new();
            for p in props {
                if !crate::props::consume_cell_std(&mut self.lib.cells[ci], &p)? {
                    kept.push(p);
                }
            }
            self.lib.cells[ci].properties = kept;
        }
        Ok(())
    }
    /// Log a warning, escalating it when the options demand
    fn warn(&mut self, message: String, level: u8) -> OasResult<()> {
        self.warnings.push(OasWarning {
            message: message.clone(),
            level,
        });
        if self.opts.warnings_as_errors {
            return self.fail(format!("warning escalated to error: {}", message));
        }
        Ok(())
    }
    /// Error helper for an invalid record in the current context
    fn invalid<T>(&mut self, rtype: OasRecordType) -> OasResult<T> {
        self.fail(format!("invalid record {:?}", rtype))
    }
    /// Error helper. Create a Parse error at the current stream location.
    fn err(&mut self, msg: impl Into<String>) -> OasError {
        OasError::Parse {
            msg: msg.into(),
            recordnum: self.numread,
            bytepos: self.rdr.pos(),
            cell: self
                .cur_cell
                .and_then(|ci| self.lib.cells.get(ci))
                .map(|c| c.name.clone()),
            ctx: self.ctx_stack.clone(),
        }
    }
    /// Return failure
    fn fail<T>(&mut self, msg: impl Into<String>) -> OasResult<T> {
        Err(self.err(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::OasReaderOpts;

    /// Seven-bits-per-byte unsigned encoding, for hand-built streams
    fn uint(mut v: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let mut b = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                b |= 0x80;
            }
            out.push(b);
            if v == 0 {
                return out;
            }
        }
    }
    fn sint(v: i64) -> Vec<u8> {
        let u = if v < 0 {
            ((-v as u64) << 1) | 1
        } else {
            (v as u64) << 1
        };
        uint(u)
    }
    fn nstring(s: &str) -> Vec<u8> {
        let mut out = uint(s.len() as u64);
        out.extend_from_slice(s.as_bytes());
        out
    }

    fn reader(bytes: &[u8]) -> OasReader {
        OasReader::new(bytes)
    }

    #[test]
    fn decodes_unsigned_integers() {
        assert_eq!(reader(&[0x00]).read_uint().unwrap(), 0);
        assert_eq!(reader(&[0x7f]).read_uint().unwrap(), 127);
        assert_eq!(reader(&[0x80, 0x01]).read_uint().unwrap(), 128);
        assert_eq!(reader(&[0xff, 0xff, 0x03]).read_uint().unwrap(), 65535);
        // Ten full continuation bytes overflow 64 bits
        assert!(reader(&[0xff; 10]).read_uint().is_err());
    }
    #[test]
    fn decodes_signed_integers() {
        assert_eq!(reader(&[0x00]).read_sint().unwrap(), 0);
        assert_eq!(reader(&[0x02]).read_sint().unwrap(), 1);
        assert_eq!(reader(&[0x03]).read_sint().unwrap(), -1);
        assert_eq!(reader(&sint(-12345)).read_sint().unwrap(), -12345);
    }
    #[test]
    fn decodes_reals() {
        // Form 0/1: signed whole numbers
        let mut bytes = uint(0);
        bytes.extend(uint(42));
        assert_eq!(reader(&bytes).read_real().unwrap(), 42.0);
        let mut bytes = uint(1);
        bytes.extend(uint(42));
        assert_eq!(reader(&bytes).read_real().unwrap(), -42.0);
        // Form 4: ratio
        let mut bytes = uint(4);
        bytes.extend(uint(3));
        bytes.extend(uint(4));
        assert_eq!(reader(&bytes).read_real().unwrap(), 0.75);
        // Form 7: eight-byte float, little-endian
        let mut bytes = uint(7);
        bytes.extend_from_slice(&1.5f64.to_le_bytes());
        assert_eq!(reader(&bytes).read_real().unwrap(), 1.5);
        // Zero denominators are errors
        let mut bytes = uint(2);
        bytes.extend(uint(0));
        assert!(reader(&bytes).read_real().is_err());
    }
    #[test]
    fn decodes_gdeltas() {
        // Form 1: direction north, magnitude 3: bits 0b0011_0010
        assert_eq!(
            reader(&[0x32]).read_gdelta().unwrap(),
            OasPoint::new(0, 3)
        );
        // Form 2: x = -2 (sign bit set), y = 5
        let mut bytes = uint((2 << 2) | 0b11);
        bytes.extend(sint(5));
        assert_eq!(
            reader(&bytes).read_gdelta().unwrap(),
            OasPoint::new(-2, 5)
        );
    }
    #[test]
    fn decodes_point_lists() {
        // Type 0, horizontal-first: +10, +5 describes a 10x5 rectangle
        // outline with its implied fourth vertex
        let mut bytes = uint(0);
        bytes.extend(uint(2));
        bytes.extend(sint(10));
        bytes.extend(sint(5));
        let pts = reader(&bytes).read_point_list(true).unwrap();
        assert_eq!(
            pts,
            vec![
                OasPoint::new(0, 0),
                OasPoint::new(10, 0),
                OasPoint::new(10, 5),
                OasPoint::new(0, 5),
            ]
        );
        // Same list without closure, as a path centerline
        let pts = reader(&bytes).read_point_list(false).unwrap();
        assert_eq!(pts.len(), 3);
    }
    #[test]
    fn decodes_repetitions() {
        // Type 2: three columns spaced 10 apart
        let mut bytes = uint(1);
        bytes.extend(uint(10));
        let rep = reader(&bytes).read_repetition(2).unwrap();
        assert_eq!(rep, Repetition::row(OasPoint::new(10, 0), 3));
        // Type 10: two explicit g-delta displacements
        let mut bytes = uint(1);
        bytes.extend(uint((3 << 2) | 1)); // form 2, x=3
        bytes.extend(sint(4)); // y=4
        bytes.extend(&[0x32]); // north 3
        let rep = reader(&bytes).read_repetition(10).unwrap();
        assert_eq!(
            rep,
            Repetition::Irregular(vec![OasPoint::new(3, 4), OasPoint::new(3, 7)])
        );
    }

    #[test]
    fn oversized_repetition_counts_are_errors() {
        // Dimension counts are stored offset by two; the maximum stored
        // value has no in-range meaning
        for rtype in [1u64, 2, 3, 8, 9] {
            let bytes = uint(u64::MAX);
            assert!(
                matches!(
                    reader(&bytes).read_repetition(rtype),
                    Err(OasError::Decode(_))
                ),
                "type {}",
                rtype
            );
        }
        // Delta-list counts, stored offset by one
        let bytes = uint(u64::MAX);
        assert!(matches!(
            reader(&bytes).read_repetition(10),
            Err(OasError::Decode(_))
        ));
        // A huge declared count runs out of bytes, without preallocating
        let bytes = uint(1 << 40);
        assert!(reader(&bytes).read_repetition(10).is_err());
    }
    #[test]
    fn oversized_point_counts_are_errors() {
        let mut bytes = uint(4); // explicit g-deltas
        bytes.extend(uint(1 << 40));
        assert!(reader(&bytes).read_point_list(false).is_err());
    }

    /// Build a minimal stream: magic, START with inline (empty) table
    /// offsets, the given body records, and an END record
    fn stream(body: &[u8]) -> Vec<u8> {
        let mut bytes = MAGIC.to_vec();
        bytes.push(1); // START
        bytes.extend(nstring("1.0"));
        bytes.extend(uint(0)); // unit real, form 0
        bytes.extend(uint(1000));
        bytes.extend(uint(0)); // offsets inline
        bytes.extend(std::iter::repeat(0).take(12)); // six zero pairs
        bytes.extend_from_slice(body);
        bytes.push(2); // END
        bytes.extend(uint(0)); // padding string, empty
        bytes.extend(uint(0)); // validation scheme
        bytes
    }
    fn parse(bytes: &[u8]) -> OasResult<OasLibrary> {
        OasParser::new(OasReader::new(bytes), OasReaderOpts::default()).parse_lib()
    }

    #[test]
    fn parses_a_rectangle() {
        let mut body = vec![14u8]; // CELL by name
        body.extend(nstring("unit"));
        body.push(20); // RECTANGLE, info WHXYDL
        body.push(0b0111_1011);
        body.extend(uint(4)); // layer
        body.extend(uint(0)); // datatype
        body.extend(uint(10)); // width
        body.extend(uint(20)); // height
        body.extend(sint(100)); // x
        body.extend(sint(-50)); // y
        let lib = parse(&stream(&body)).unwrap();
        assert_eq!(lib.unit, 1000.0);
        assert_eq!(lib.cells.len(), 1);
        let cell = &lib.cells[0];
        assert_eq!(cell.name, "unit");
        match &cell.elems[0] {
            OasElement::OasRectangle(r) => {
                assert_eq!((r.layer, r.datatype), (4, 0));
                assert_eq!((r.x, r.y, r.width, r.height), (100, -50, 10, 20));
                assert!(r.repetition.is_none());
            }
            other => panic!("expected a rectangle, got {:?}", other),
        }
    }
    #[test]
    fn modal_fields_carry_between_records() {
        let mut body = vec![14u8];
        body.extend(nstring("unit"));
        body.push(20); // Full rectangle
        body.push(0b0111_1011);
        body.extend(uint(4));
        body.extend(uint(0));
        body.extend(uint(10));
        body.extend(uint(20));
        body.extend(sint(100));
        body.extend(sint(0));
        body.push(20); // Second rectangle: only a relative x, all else modal
        body.push(0b0001_0000);
        body.extend(sint(30));
        let lib = parse(&stream(&body)).unwrap();
        match &lib.cells[0].elems[1] {
            OasElement::OasRectangle(r) => {
                assert_eq!((r.layer, r.width, r.height), (4, 10, 20));
                assert_eq!((r.x, r.y), (130, 0));
            }
            other => panic!("expected a rectangle, got {:?}", other),
        }
    }
    #[test]
    fn unset_modal_is_fatal() {
        let mut body = vec![14u8];
        body.extend(nstring("unit"));
        body.push(20); // Rectangle with no fields at all, and nothing modal
        body.push(0x00);
        match parse(&stream(&body)) {
            Err(OasError::Modal { .. }) => (),
            other => panic!("expected a modal error, got {:?}", other),
        }
    }
    #[test]
    fn forward_text_reference_resolves() {
        let mut body = vec![14u8];
        body.extend(nstring("unit"));
        body.push(19); // TEXT with string by (not yet declared) refnum
        body.push(0b0110_0011);
        body.extend(uint(0)); // textstring 0
        body.extend(uint(5)); // textlayer
        body.extend(uint(1)); // texttype
        body.push(5); // TEXTSTRING, implicit, declared after use
        body.extend(nstring("hello"));
        let lib = parse(&stream(&body)).unwrap();
        match &lib.cells[0].elems[0] {
            OasElement::OasTextElem(t) => assert_eq!(t.string, "hello"),
            other => panic!("expected a text element, got {:?}", other),
        }
    }
    #[test]
    fn dangling_reference_is_fatal() {
        let mut body = vec![14u8];
        body.extend(nstring("unit"));
        body.push(19);
        body.push(0b0110_0011);
        body.extend(uint(7)); // never declared
        body.extend(uint(5));
        body.extend(uint(1));
        match parse(&stream(&body)) {
            Err(OasError::DanglingRef { table, refnum }) => {
                assert_eq!(table, "TEXTSTRING");
                assert_eq!(refnum, 7);
            }
            other => panic!("expected a dangling reference, got {:?}", other),
        }
    }
    #[test]
    fn unsupported_records_are_flagged() {
        let mut body = vec![14u8];
        body.extend(nstring("unit"));
        body.push(27); // CIRCLE
        match parse(&stream(&body)) {
            Err(OasError::Unsupported(OasRecordType::Circle, _)) => (),
            other => panic!("expected unsupported, got {:?}", other),
        }
    }
    #[test]
    fn dropped_elements_take_their_properties() {
        let mut body = vec![14u8];
        body.extend(nstring("unit"));
        body.push(20); // Full rectangle
        body.push(0b0111_1011);
        body.extend(uint(4));
        body.extend(uint(0));
        body.extend(uint(10));
        body.extend(uint(20));
        body.extend(sint(100));
        body.extend(sint(0));
        body.push(21); // Degenerate polygon: an empty point list
        body.push(0b0010_0011);
        body.extend(uint(4));
        body.extend(uint(0));
        body.extend(uint(0)); // point-list type 0
        body.extend(uint(0)); // zero deltas
        body.push(28); // PROPERTY trailing the dropped polygon
        body.push(0b0000_0100);
        body.extend(nstring("TAG"));
        let bytes = stream(&body);
        let opts = OasReaderOpts {
            permissive: true,
            ..Default::default()
        };
        let mut parser = OasParser::new(OasReader::new(bytes.as_slice()), opts);
        let lib = parser.parse_lib().unwrap();
        let cell = &lib.cells[0];
        assert_eq!(cell.elems.len(), 1);
        // Neither the surviving rectangle nor the cell inherits the property
        assert!(cell.elems[0].properties().is_empty());
        assert!(cell.properties.is_empty());
        assert_eq!(parser.warnings().len(), 2);
    }
    #[test]
    fn forward_property_references_resolve() {
        let mut body = vec![14u8];
        body.extend(nstring("unit"));
        body.push(20); // Full rectangle
        body.push(0b0111_1011);
        body.extend(uint(4));
        body.extend(uint(0));
        body.extend(uint(10));
        body.extend(uint(20));
        body.extend(sint(100));
        body.extend(sint(0));
        body.push(28); // PROPERTY: name and value by not-yet-declared refnums
        body.push(0b0001_0110);
        body.extend(uint(9)); // propname 9
        body.extend(uint(13)); // value kind: a-string reference
        body.extend(uint(3)); // propstring 3
        body.push(8); // PROPNAME, explicit, declared after use
        body.extend(nstring("PARAM"));
        body.extend(uint(9));
        body.push(10); // PROPSTRING, explicit, declared after use
        body.extend(nstring("fast"));
        body.extend(uint(3));
        let lib = parse(&stream(&body)).unwrap();
        let props = lib.cells[0].elems[0].properties();
        assert_eq!(props.len(), 1);
        assert_eq!(props[0].name, "PARAM");
        assert_eq!(props[0].values, vec![OasPropValue::AString("fast".into())]);
        assert!(!props[0].has_unresolved());
    }
    #[test]
    fn dangling_property_name_is_fatal() {
        let mut body = vec![14u8];
        body.extend(nstring("unit"));
        body.push(20); // Full rectangle
        body.push(0b0111_1011);
        body.extend(uint(4));
        body.extend(uint(0));
        body.extend(uint(10));
        body.extend(uint(20));
        body.extend(sint(100));
        body.extend(sint(0));
        body.push(28); // PROPERTY by a refnum no PROPNAME record declares
        body.push(0b0000_0110);
        body.extend(uint(9));
        match parse(&stream(&body)) {
            Err(OasError::DanglingRef { table, refnum }) => {
                assert_eq!(table, "PROPNAME");
                assert_eq!(refnum, 9);
            }
            other => panic!("expected a dangling reference, got {:?}", other),
        }
    }
    #[test]
    fn cblock_ending_mid_record_is_fatal() {
        // The payload holds a record id and its first field only; the rest
        // of the record follows uncompressed
        let mut inner = vec![20u8]; // RECTANGLE
        inner.push(0b0111_1011);
        inner.extend(uint(4)); // layer
        let packed = crate::cblock::deflate(&inner, 6).unwrap();
        let mut body = vec![14u8];
        body.extend(nstring("unit"));
        body.push(34); // CBLOCK
        body.extend(uint(0)); // comp-type, DEFLATE
        body.extend(uint(inner.len() as u64));
        body.extend(uint(packed.len() as u64));
        body.extend_from_slice(&packed);
        body.extend(uint(0)); // datatype
        body.extend(uint(10)); // width
        body.extend(uint(20)); // height
        body.extend(sint(100));
        body.extend(sint(0));
        match parse(&stream(&body)) {
            Err(OasError::Cblock(_)) => (),
            other => panic!("expected a payload boundary error, got {:?}", other),
        }
    }
    #[test]
    fn cellname_record_properties_attach_to_the_cell() {
        let mut body = vec![14u8];
        body.extend(nstring("unit"));
        body.push(20); // Full rectangle
        body.push(0b0111_1011);
        body.extend(uint(4));
        body.extend(uint(0));
        body.extend(uint(10));
        body.extend(uint(20));
        body.extend(sint(100));
        body.extend(sint(0));
        body.push(3); // CELLNAME for the already-defined cell
        body.extend(nstring("unit"));
        body.push(28); // PROPERTY trailing the name record
        body.push(0b0000_0100);
        body.extend(nstring("NOTE"));
        let lib = parse(&stream(&body)).unwrap();
        assert!(lib.properties.is_empty());
        assert_eq!(lib.cells[0].properties.len(), 1);
        assert_eq!(lib.cells[0].properties[0].name, "NOTE");
    }
    #[test]
    fn bad_magic_is_fatal() {
        let bytes = b"%SEMI-NOTHING".to_vec();
        assert!(parse(&bytes).is_err());
    }
}
