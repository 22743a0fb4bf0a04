//!
//! # Oasis Modal Variable Store
//!
//! OASIS records omit any field whose value matches "modal state" carried over
//! from earlier records. Each codec instance (one reader, one writer) owns one
//! [ModalStore], passed by reference through its dispatch loop; stores are
//! never shared across streams. Every CELL boundary resets the full store.
//!
//! Reading an unset modal variable during decode means the stream relied on
//! state it never established, which the standard deems ill-formed: it is a
//! fatal [OasError::Modal]. During encode it is an internal error; the writer
//! always sets a modal value before relying on omission semantics.
//!

// Local Imports
use crate::data::{OasError, OasPoint, OasResult};
use crate::rep::Repetition;
use crate::tables::NameRef;
use crate::props::OasPropValue;

/// # Modal Variable
///
/// A named slot which is unset until written. The stale value is retained
/// across `reset()` to avoid reallocation; only the `set` flag is cleared.
#[derive(Debug, Clone)]
pub struct ModalVar<T> {
    name: &'static str,
    value: T,
    set: bool,
}
impl<T: Default> ModalVar<T> {
    /// Create a new, unset [ModalVar] named `name`
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            value: T::default(),
            set: false,
        }
    }
    /// Get a reference to the value, or an [OasError::Modal] if unset
    pub fn get(&self) -> OasResult<&T> {
        if self.set {
            Ok(&self.value)
        } else {
            Err(OasError::Modal {
                variable: self.name,
            })
        }
    }
    /// Mutable access without marking the slot set,
    /// for in-place edits prior to [ModalVar::mark_set]
    pub fn get_mut_uninit(&mut self) -> &mut T {
        &mut self.value
    }
    /// Mark the slot set, after in-place edits via [ModalVar::get_mut_uninit]
    pub fn mark_set(&mut self) {
        self.set = true;
    }
    /// Set the value
    pub fn set(&mut self, value: T) {
        self.value = value;
        self.set = true;
    }
    /// Clear the slot back to unset
    pub fn reset(&mut self) {
        self.set = false;
    }
    /// Boolean indication of whether the slot holds a value
    pub fn is_set(&self) -> bool {
        self.set
    }
}
impl<T: Default + PartialEq> ModalVar<T> {
    /// Writer-side tracking: returns `true` if `value` differs from the
    /// current modal state (and must be emitted), updating the slot either way.
    pub fn track(&mut self, value: &T) -> bool
    where
        T: Clone,
    {
        if self.set && self.value == *value {
            return false;
        }
        self.set(value.clone());
        true
    }
}

///
/// # Oasis Modal Variable Store
///
/// One field per modal variable defined by the standard (less those of the
/// unsupported trapezoid/circle records). The three position pairs and the
/// xy-mode are defined-at-reset rather than unset-at-reset, per the standard.
///
#[derive(Debug, Clone)]
pub struct ModalStore {
    /// Coordinate mode: absolute (`true`) or relative
    pub xy_absolute: bool,
    pub placement_x: i64,
    pub placement_y: i64,
    pub geometry_x: i64,
    pub geometry_y: i64,
    pub text_x: i64,
    pub text_y: i64,

    pub repetition: ModalVar<Repetition>,
    pub layer: ModalVar<u32>,
    pub datatype: ModalVar<u32>,
    pub textlayer: ModalVar<u32>,
    pub texttype: ModalVar<u32>,
    pub text_string: ModalVar<NameRef>,
    pub placement_cell: ModalVar<NameRef>,
    pub geometry_w: ModalVar<u64>,
    pub geometry_h: ModalVar<u64>,
    pub path_half_width: ModalVar<u64>,
    pub path_start_ext: ModalVar<i64>,
    pub path_end_ext: ModalVar<i64>,
    pub polygon_points: ModalVar<Vec<OasPoint>>,
    pub path_points: ModalVar<Vec<OasPoint>>,
    pub prop_name: ModalVar<NameRef>,
    pub prop_values: ModalVar<Vec<OasPropValue>>,
    pub prop_standard: ModalVar<bool>,
}
impl ModalStore {
    /// Create a fully-reset store
    pub fn new() -> Self {
        Self {
            xy_absolute: true,
            placement_x: 0,
            placement_y: 0,
            geometry_x: 0,
            geometry_y: 0,
            text_x: 0,
            text_y: 0,
            repetition: ModalVar::new("repetition"),
            layer: ModalVar::new("layer"),
            datatype: ModalVar::new("datatype"),
            textlayer: ModalVar::new("textlayer"),
            texttype: ModalVar::new("texttype"),
            text_string: ModalVar::new("text-string"),
            placement_cell: ModalVar::new("placement-cell"),
            geometry_w: ModalVar::new("geometry-w"),
            geometry_h: ModalVar::new("geometry-h"),
            path_half_width: ModalVar::new("path-halfwidth"),
            path_start_ext: ModalVar::new("path-start-extension"),
            path_end_ext: ModalVar::new("path-end-extension"),
            polygon_points: ModalVar::new("polygon-point-list"),
            path_points: ModalVar::new("path-point-list"),
            prop_name: ModalVar::new("last-property-name"),
            prop_values: ModalVar::new("last-value-list"),
            prop_standard: ModalVar::new("last-property-standard"),
        }
    }
    /// Reset every slot, as required at each cell-body boundary
    pub fn reset(&mut self) {
        self.xy_absolute = true;
        self.placement_x = 0;
        self.placement_y = 0;
        self.geometry_x = 0;
        self.geometry_y = 0;
        self.text_x = 0;
        self.text_y = 0;
        self.repetition.reset();
        self.layer.reset();
        self.datatype.reset();
        self.textlayer.reset();
        self.texttype.reset();
        self.text_string.reset();
        self.placement_cell.reset();
        self.geometry_w.reset();
        self.geometry_h.reset();
        self.path_half_width.reset();
        self.path_start_ext.reset();
        self.path_end_ext.reset();
        self.polygon_points.reset();
        self.path_points.reset();
        self.prop_name.reset();
        self.prop_values.reset();
        self.prop_standard.reset();
    }
}
impl Default for ModalStore {
    fn default() -> Self {
        Self::new()
    }
}
