//!
//! # Oas21 Integrated Circuit Layout Parser & Writer
//!
//! OASIS (SEMI P39) is the IC industry's compact successor to GDSII for
//! storing and sharing layout data. Oas21 is a library for reading and
//! creating OASIS data, designed primarily as an interface layer to OASIS
//! streams for larger layout-processing programs.
//! Reading and generating OASIS-format data are primary goals;
//! offering ease-of-use functionality for more elaborate manipulations of
//! layout data is not. (Although these manipulations can be performed on
//! Oas21's data structures). Oas21 accordingly stores layout data on OASIS's
//! terms, using OASIS's idioms and naming conventions.
//!
//! Layout data is represented in a short tree with three layers:
//!
//! * The root is an [OasLibrary], which primarily consists of a set of cells
//!   ([OasCell]s), and secondarily a set of metadata: the database-unit
//!   resolution, layer-name bindings, and library-level properties.
//!   Each [OasLibrary] is a universe unto itself, in that it has no
//!   mechanisms for comprehending layout cells or data defined outside
//!   itself. On-disk each [OasLibrary] is typically paired one-to-one with
//!   a `.oas` file.
//! * Libraries consist of cell definitions AKA [OasCell]s, which define each
//!   layout cell (or module).
//! * Cells consist of [OasElement]s, an enumeration which includes
//!   rectangles ([OasRectangle]), polygons ([OasPolygon]), paths ([OasPath]),
//!   text annotations ([OasTextElem]), and instances of other layout cells
//!   ([OasPlacement]).
//!
//! The stream-level machinery OASIS layers beneath that tree - name tables,
//! modal variables, repetitions, and CBLOCK compression - is consumed and
//! produced on the way into and out of [Read](std::io::Read) and
//! [Write](std::io::Write) objects (typically [File](std::fs::File)s),
//! and never stored. Readers resolve every name reference and expand every
//! modal field; writers re-derive them, including re-detecting arrays of
//! identical elements ([Repetition]s) up to a configurable effort level.
//!
//! ## Usage
//!
//! Loading an [OasLibrary] from disk:
//!
//! ```skip
//! let lib = OasLibrary::load("sample.oas")?;
//! ```
//!
//! Creating a new and empty [OasLibrary], and adding an [OasCell]
//! cell-definition:
//!
//! ```
//! use oas21::{OasLibrary, OasCell};
//! let mut lib = OasLibrary::new();
//! lib.cells.push(OasCell::new("mycell"));
//! ```
//!
//! Saving an [OasLibrary] to disk:
//!
//! ```skip
//! lib.save("mylib.oas")?;
//! ```
//!
//! Each element in the [OasLibrary] tree is [serde]-serializable, e.g. to
//! [JSON](serde_json):
//!
//! ```
//! let lib = oas21::OasLibrary::new();
//! let json = serde_json::to_string(&lib);
//! ```
//!

mod cblock;
mod compress;
mod data;
mod modal;
mod props;
mod read;
mod rep;
mod tables;
mod write;

#[cfg(test)]
mod tests;

pub use data::*;
pub use props::{
    std_property, OasPropValue, OasProperty, StdPropEffect, StdPropOwner, StdProperty,
    StringClass, STD_PROPERTIES,
};
pub use read::{OasParser, OasReader};
pub use rep::Repetition;
pub use write::{OasWriter, WriteElement};
