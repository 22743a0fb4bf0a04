//!
//! # Oas21 Integration Tests
//!
//! Whole-library scenarios: write-read round trips, shape-array detection,
//! CBLOCK compression, strict-mode layout, and standard properties.
//!

// Local Imports
use crate::data::*;
use crate::props::{OasPropValue, OasProperty};
use crate::read::OasParser;
use crate::rep::Repetition;
use crate::write::OasWriter;

fn rect(layer: u32, x: i64, y: i64, width: u64, height: u64) -> OasElement {
    OasRectangle {
        layer,
        datatype: 0,
        x,
        y,
        width,
        height,
        repetition: None,
        properties: Vec::new(),
    }
    .into()
}

fn write_bytes(lib: &OasLibrary, opts: OasWriterOpts) -> OasResult<Vec<u8>> {
    let mut bytes: Vec<u8> = Vec::new();
    let mut writer = OasWriter::new(&mut bytes, opts);
    writer.write_lib(lib)?;
    drop(writer);
    Ok(bytes)
}

fn parse_bytes(bytes: &[u8], opts: OasReaderOpts) -> OasResult<OasLibrary> {
    OasParser::from_bytes(bytes, opts).parse_lib()
}

#[test]
fn empty_library_roundtrips() -> OasResult<()> {
    roundtrip(&OasLibrary::new())
}

#[test]
fn library_roundtrips() -> OasResult<()> {
    let mut lib = OasLibrary::new();
    lib.top_cell = Some("top".to_string());
    lib.layernames.push(OasLayerName {
        name: "metal1".to_string(),
        layers: OasInterval::exactly(1),
        types: OasInterval::all(),
        is_text: false,
    });
    lib.layernames.push(OasLayerName {
        name: "metal1_label".to_string(),
        layers: OasInterval::exactly(1),
        types: OasInterval::exactly(0),
        is_text: true,
    });
    lib.properties.push(OasProperty {
        name: "LIB_NOTE".to_string(),
        values: vec![OasPropValue::NString("hello".to_string())],
        standard: false,
    });

    let mut top = OasCell::new("top");
    // Elements with properties or repetitions are written where they stand;
    // singular shapes follow, so keep that order here for a faithful compare
    top.elems.push(
        OasRectangle {
            layer: 1,
            datatype: 0,
            x: 0,
            y: 0,
            width: 100,
            height: 50,
            repetition: None,
            properties: vec![OasProperty {
                name: "PROP_OWNER".to_string(),
                values: vec![
                    OasPropValue::Unsigned(7),
                    OasPropValue::Signed(-4),
                    OasPropValue::Real(2.5),
                    OasPropValue::AString("acme corp".to_string()),
                    OasPropValue::NString("acme".to_string()),
                    OasPropValue::BString(vec![1, 2, 3]),
                ],
                standard: false,
            }],
        }
        .into(),
    );
    top.elems.push(
        OasPath {
            layer: 2,
            datatype: 0,
            x: 0,
            y: 200,
            half_width: 5,
            start_ext: 0,
            end_ext: 5,
            points: vec![OasPoint::new(0, 0), OasPoint::new(100, 0)],
            repetition: Some(Repetition::row(OasVector::new(0, 40), 3)),
            properties: Vec::new(),
        }
        .into(),
    );
    top.elems.push(rect(3, 500, 500, 10, 20));
    top.elems.push(
        OasPolygon {
            layer: 1,
            datatype: 2,
            x: 1000,
            y: 0,
            points: vec![
                OasPoint::new(0, 0),
                OasPoint::new(100, 0),
                OasPoint::new(100, 100),
                OasPoint::new(0, 100),
            ],
            repetition: None,
            properties: Vec::new(),
        }
        .into(),
    );
    top.elems.push(
        OasTextElem {
            string: "VDD".to_string(),
            layer: 2,
            texttype: 1,
            x: 50,
            y: 50,
            repetition: None,
            properties: Vec::new(),
        }
        .into(),
    );
    top.elems.push(
        OasPlacement {
            cell: "other".to_string(),
            x: 200,
            y: 300,
            mag: 1.0,
            angle: 90.0,
            flip: false,
            repetition: None,
            properties: Vec::new(),
        }
        .into(),
    );
    lib.cells.push(top);
    lib.cells.push(OasCell::new("other"));
    roundtrip(&lib)
}

#[test]
fn identical_shapes_become_repetitions() -> OasResult<()> {
    let mut cell = OasCell::new("top");
    for k in 0..3 {
        cell.elems.push(rect(1, 0, k * 10, 100, 5));
    }
    let mut lib = OasLibrary::new();
    lib.cells.push(cell);

    let bytes = write_bytes(&lib, OasWriterOpts::default())?;
    let lib2 = parse_bytes(&bytes, OasReaderOpts::default())?;
    assert_eq!(lib2.cells.len(), 1);
    assert_eq!(lib2.cells[0].elems.len(), 1);
    let elem = &lib2.cells[0].elems[0];
    assert_eq!(elem.pos(), OasPoint::new(0, 0));
    assert_eq!(
        elem.repetition(),
        Some(&Repetition::row(OasVector::new(0, 10), 3))
    );
    Ok(())
}

#[test]
fn grids_become_two_dimensional_repetitions() -> OasResult<()> {
    let mut cell = OasCell::new("top");
    for i in 0..3 {
        for j in 0..4 {
            cell.elems.push(rect(1, i * 100, j * 50, 10, 20));
        }
    }
    let mut lib = OasLibrary::new();
    lib.cells.push(cell);

    let opts = OasWriterOpts {
        compression_level: 4,
        ..Default::default()
    };
    let bytes = write_bytes(&lib, opts)?;
    let lib2 = parse_bytes(&bytes, OasReaderOpts::default())?;
    assert_eq!(lib2.cells[0].elems.len(), 1);
    let rep = lib2.cells[0].elems[0].repetition().unwrap();
    assert_eq!(rep.size(), 12);
    assert!(rep.is_regular().is_some());
    Ok(())
}

#[test]
fn level_zero_never_groups() -> OasResult<()> {
    let mut cell = OasCell::new("top");
    for k in 0..3 {
        cell.elems.push(rect(1, 0, k * 10, 100, 5));
    }
    let mut lib = OasLibrary::new();
    lib.cells.push(cell);

    let opts = OasWriterOpts {
        compression_level: 0,
        ..Default::default()
    };
    let bytes = write_bytes(&lib, opts)?;
    let lib2 = parse_bytes(&bytes, OasReaderOpts::default())?;
    assert_eq!(lib2, lib);
    Ok(())
}

#[test]
fn recompression_regroups_existing_arrays() -> OasResult<()> {
    let mut elem = match rect(1, 5, 5, 10, 20) {
        OasElement::OasRectangle(r) => r,
        _ => unreachable!(),
    };
    elem.repetition = Some(Repetition::Irregular(vec![
        OasVector::new(0, 10),
        OasVector::new(0, 20),
    ]));
    let mut cell = OasCell::new("top");
    cell.elems.push(elem.into());
    let mut lib = OasLibrary::new();
    lib.cells.push(cell);

    let opts = OasWriterOpts {
        recompress: true,
        ..Default::default()
    };
    let bytes = write_bytes(&lib, opts)?;
    let lib2 = parse_bytes(&bytes, OasReaderOpts::default())?;
    assert_eq!(lib2.cells[0].elems.len(), 1);
    let elem = &lib2.cells[0].elems[0];
    assert_eq!(elem.pos(), OasPoint::new(5, 5));
    assert_eq!(
        elem.repetition(),
        Some(&Repetition::row(OasVector::new(0, 10), 3))
    );
    Ok(())
}

#[test]
fn cblocks_shrink_and_roundtrip() -> OasResult<()> {
    let mut cell = OasCell::new("top");
    for k in 0..30i64 {
        cell.elems.push(rect(1, k * 100, 0, 10 + k as u64, 500));
    }
    let mut lib = OasLibrary::new();
    lib.cells.push(cell);

    let plain = write_bytes(&lib, OasWriterOpts::default())?;
    let opts = OasWriterOpts {
        write_cblocks: true,
        ..Default::default()
    };
    let packed = write_bytes(&lib, opts)?;
    assert!(packed.len() < plain.len());
    assert_eq!(parse_bytes(&packed, OasReaderOpts::default())?, lib);
    assert_eq!(parse_bytes(&plain, OasReaderOpts::default())?, lib);
    Ok(())
}

#[test]
fn strict_mode_roundtrips() -> OasResult<()> {
    let mut lib = OasLibrary::new();
    let mut cell = OasCell::new("top");
    cell.elems.push(rect(1, 0, 0, 10, 20));
    lib.cells.push(cell);

    let opts = OasWriterOpts {
        strict_mode: true,
        ..Default::default()
    };
    let bytes = write_bytes(&lib, opts)?;

    // A strict-expecting reader accepts it
    let opts = OasReaderOpts {
        expect_strict: Some(true),
        ..Default::default()
    };
    assert_eq!(parse_bytes(&bytes, opts)?, lib);

    // A strictness-rejecting reader does not
    let opts = OasReaderOpts {
        expect_strict: Some(false),
        ..Default::default()
    };
    assert!(parse_bytes(&bytes, opts).is_err());
    Ok(())
}

#[test]
fn deferred_tables_roundtrip() -> OasResult<()> {
    let mut lib = OasLibrary::new();
    let mut cell = OasCell::new("top");
    cell.elems.push(
        OasTextElem {
            string: "VSS".to_string(),
            layer: 2,
            texttype: 0,
            x: 0,
            y: 0,
            repetition: None,
            properties: Vec::new(),
        }
        .into(),
    );
    lib.cells.push(cell);

    // Name tables land after the cells; every reference resolves forward
    let opts = OasWriterOpts {
        tables_at_end: true,
        ..Default::default()
    };
    let bytes = write_bytes(&lib, opts)?;
    assert_eq!(parse_bytes(&bytes, OasReaderOpts::default())?, lib);
    Ok(())
}

#[test]
fn bounding_boxes_roundtrip() -> OasResult<()> {
    let mut lib = OasLibrary::new();
    let mut cell = OasCell::new("top");
    cell.elems.push(rect(1, -10, -20, 110, 220));
    cell.bbox = Some(OasBbox {
        x: -10,
        y: -20,
        width: 110,
        height: 220,
    });
    lib.cells.push(cell);

    let opts = OasWriterOpts {
        write_std_properties: 2,
        ..Default::default()
    };
    let bytes = write_bytes(&lib, opts)?;
    let lib2 = parse_bytes(&bytes, OasReaderOpts::default())?;
    assert_eq!(lib2, lib);
    assert!(lib2.cells[0].properties.is_empty());
    Ok(())
}

#[test]
fn std_properties_can_stay_generic() -> OasResult<()> {
    let mut lib = OasLibrary::new();
    lib.top_cell = Some("top".to_string());
    lib.cells.push(OasCell::new("top"));

    let bytes = write_bytes(&lib, OasWriterOpts::default())?;
    let opts = OasReaderOpts {
        read_all_properties: true,
        ..Default::default()
    };
    let lib2 = parse_bytes(&bytes, opts)?;
    assert_eq!(lib2.top_cell, None);
    assert_eq!(lib2.properties.len(), 1);
    assert_eq!(lib2.properties[0].name, "S_TOP_CELL");
    assert!(lib2.properties[0].standard);
    Ok(())
}

#[test]
fn illegal_name_characters_are_substituted() -> OasResult<()> {
    let mut lib = OasLibrary::new();
    lib.cells.push(OasCell::new("my cell"));

    // Without a substitution character, an illegal name is a writer error
    assert!(write_bytes(&lib, OasWriterOpts::default()).is_err());

    let opts = OasWriterOpts {
        subst_char: Some('_'),
        ..Default::default()
    };
    let bytes = write_bytes(&lib, opts)?;
    let lib2 = parse_bytes(&bytes, OasReaderOpts::default())?;
    assert_eq!(lib2.cells[0].name, "my_cell");
    Ok(())
}

#[test]
fn degenerate_geometry_is_dropped_when_permissive() -> OasResult<()> {
    let mut cell = OasCell::new("top");
    cell.elems.push(
        OasPolygon {
            layer: 1,
            datatype: 0,
            x: 0,
            y: 0,
            points: vec![OasPoint::new(0, 0), OasPoint::new(10, 0)],
            repetition: None,
            properties: vec![OasProperty {
                name: "KEEP".to_string(),
                values: Vec::new(),
                standard: false,
            }],
        }
        .into(),
    );
    let mut lib = OasLibrary::new();
    lib.cells.push(cell);

    assert!(write_bytes(&lib, OasWriterOpts::default()).is_err());

    let mut bytes: Vec<u8> = Vec::new();
    {
        let opts = OasWriterOpts {
            permissive: true,
            ..Default::default()
        };
        let mut writer = OasWriter::new(&mut bytes, opts);
        writer.write_lib(&lib)?;
        assert_eq!(writer.warnings().len(), 1);
    }
    let lib2 = parse_bytes(&bytes, OasReaderOpts::default())?;
    assert!(lib2.cells[0].elems.is_empty());
    Ok(())
}

#[test]
fn placements_of_undefined_cells_warn() -> OasResult<()> {
    let mut cell = OasCell::new("top");
    cell.elems.push(
        OasPlacement {
            cell: "missing".to_string(),
            x: 0,
            y: 0,
            mag: 1.0,
            angle: 0.0,
            flip: false,
            repetition: None,
            properties: Vec::new(),
        }
        .into(),
    );
    let mut lib = OasLibrary::new();
    lib.cells.push(cell);

    let bytes = write_bytes(&lib, OasWriterOpts::default())?;
    let mut parser = OasParser::from_bytes(&bytes, OasReaderOpts::default());
    let lib2 = parser.parse_lib()?;
    assert_eq!(lib2.cells[0].elems[0], lib.cells[0].elems[0]);
    assert_eq!(parser.warnings().len(), 1);
    assert_eq!(parser.warnings()[0].level, 1);

    // And escalates when warnings are fatal
    let opts = OasReaderOpts {
        warnings_as_errors: true,
        ..Default::default()
    };
    assert!(parse_bytes(&bytes, opts).is_err());
    Ok(())
}

#[test]
fn json_serialization_roundtrips() -> OasResult<()> {
    let mut lib = OasLibrary::new();
    let mut cell = OasCell::new("top");
    cell.elems.push(rect(1, 0, 0, 10, 20));
    lib.cells.push(cell);

    let json = serde_json::to_string(&lib).map_err(|e| OasError::Other(e.to_string()))?;
    let lib2: OasLibrary =
        serde_json::from_str(&json).map_err(|e| OasError::Other(e.to_string()))?;
    assert_eq!(lib2, lib);
    Ok(())
}
