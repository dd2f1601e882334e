// SPDX-License-Identifier: GPL-3.0-only

//! Typed controls and control lists
//!
//! Controls are identified by numeric ids. Camera-level ids live in
//! [`ids`]; V4L2 devices use the kernel's own control ids with the same
//! container types.

use std::collections::BTreeMap;
use std::fmt;

/// Numeric control identifier
pub type ControlId = u32;

/// Well-known camera control ids
pub mod ids {
    use super::ControlId;

    /// Enable the auto-exposure algorithm (bool)
    pub const AE_ENABLE: ControlId = 1;
    /// Auto-exposure has converged (bool, metadata)
    pub const AE_LOCKED: ControlId = 2;
    /// Brightness offset in -1.0..1.0 (float)
    pub const BRIGHTNESS: ControlId = 3;
    /// Contrast multiplier in 0.0..2.0 (float)
    pub const CONTRAST: ControlId = 4;
    /// Saturation multiplier in 0.0..2.0 (float)
    pub const SATURATION: ControlId = 5;
    /// Start-of-exposure timestamp in nanoseconds (int64, metadata)
    pub const SENSOR_TIMESTAMP: ControlId = 6;
    /// Exposure time in microseconds (int32)
    pub const EXPOSURE_TIME: ControlId = 7;
    /// Analogue gain multiplier (float)
    pub const ANALOGUE_GAIN: ControlId = 8;
    /// Sensor model name (string, property)
    pub const MODEL: ControlId = 100;
    /// Pixel array size as [width, height] bytes (property)
    pub const PIXEL_ARRAY_SIZE: ControlId = 101;

    /// Human-readable name of a camera control id
    pub fn name(id: ControlId) -> &'static str {
        match id {
            AE_ENABLE => "AeEnable",
            AE_LOCKED => "AeLocked",
            BRIGHTNESS => "Brightness",
            CONTRAST => "Contrast",
            SATURATION => "Saturation",
            SENSOR_TIMESTAMP => "SensorTimestamp",
            EXPOSURE_TIME => "ExposureTime",
            ANALOGUE_GAIN => "AnalogueGain",
            MODEL => "Model",
            PIXEL_ARRAY_SIZE => "PixelArraySize",
            _ => "Unknown",
        }
    }
}

/// Storage type of a control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    None,
    Bool,
    Byte,
    Int32,
    Int64,
    Float,
    String,
}

impl fmt::Display for ControlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlType::None => "none",
            ControlType::Bool => "bool",
            ControlType::Byte => "byte",
            ControlType::Int32 => "int32",
            ControlType::Int64 => "int64",
            ControlType::Float => "float",
            ControlType::String => "string",
        };
        write!(f, "{}", name)
    }
}

/// A control value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ControlValue {
    #[default]
    None,
    Bool(bool),
    Byte(u8),
    Int32(i32),
    Int64(i64),
    Float(f32),
    /// Array of bytes, the only array type the kernel layer exchanges
    Bytes(Vec<u8>),
    String(String),
}

impl ControlValue {
    pub fn control_type(&self) -> ControlType {
        match self {
            ControlValue::None => ControlType::None,
            ControlValue::Bool(_) => ControlType::Bool,
            ControlValue::Byte(_) | ControlValue::Bytes(_) => ControlType::Byte,
            ControlValue::Int32(_) => ControlType::Int32,
            ControlValue::Int64(_) => ControlType::Int64,
            ControlValue::Float(_) => ControlType::Float,
            ControlValue::String(_) => ControlType::String,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, ControlValue::Bytes(_))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ControlValue::None)
    }

    /// Integer view of scalar values
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ControlValue::Bool(v) => Some(i64::from(*v)),
            ControlValue::Byte(v) => Some(i64::from(*v)),
            ControlValue::Int32(v) => Some(i64::from(*v)),
            ControlValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        self.as_i64().and_then(|v| i32::try_from(v).ok())
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            ControlValue::Float(v) => Some(*v),
            other => other.as_i64().map(|v| v as f32),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ControlValue::Bool(v) => Some(*v),
            other => other.as_i64().map(|v| v != 0),
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ControlValue::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ControlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlValue::None => write!(f, "<none>"),
            ControlValue::Bool(v) => write!(f, "{}", v),
            ControlValue::Byte(v) => write!(f, "{}", v),
            ControlValue::Int32(v) => write!(f, "{}", v),
            ControlValue::Int64(v) => write!(f, "{}", v),
            ControlValue::Float(v) => write!(f, "{:.3}", v),
            ControlValue::Bytes(v) => {
                let items: Vec<String> = v.iter().map(|b| b.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
            ControlValue::String(v) => write!(f, "\"{}\"", v),
        }
    }
}

impl From<bool> for ControlValue {
    fn from(v: bool) -> Self {
        ControlValue::Bool(v)
    }
}

impl From<u8> for ControlValue {
    fn from(v: u8) -> Self {
        ControlValue::Byte(v)
    }
}

impl From<i32> for ControlValue {
    fn from(v: i32) -> Self {
        ControlValue::Int32(v)
    }
}

impl From<i64> for ControlValue {
    fn from(v: i64) -> Self {
        ControlValue::Int64(v)
    }
}

impl From<f32> for ControlValue {
    fn from(v: f32) -> Self {
        ControlValue::Float(v)
    }
}

impl From<Vec<u8>> for ControlValue {
    fn from(v: Vec<u8>) -> Self {
        ControlValue::Bytes(v)
    }
}

impl From<&str> for ControlValue {
    fn from(v: &str) -> Self {
        ControlValue::String(v.to_string())
    }
}

/// Range and default of a control
#[derive(Debug, Clone, PartialEq)]
pub struct ControlInfo {
    pub min: ControlValue,
    pub max: ControlValue,
    pub def: ControlValue,
}

impl ControlInfo {
    pub fn new(
        min: impl Into<ControlValue>,
        max: impl Into<ControlValue>,
        def: impl Into<ControlValue>,
    ) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
            def: def.into(),
        }
    }

    /// Clamp a float value into the control's range
    pub fn clamp_f32(&self, value: f32) -> f32 {
        let lo = self.min.as_f32().unwrap_or(f32::MIN);
        let hi = self.max.as_f32().unwrap_or(f32::MAX);
        value.clamp(lo, hi)
    }

    /// Clamp an integer value into the control's range
    pub fn clamp_i64(&self, value: i64) -> i64 {
        let lo = self.min.as_i64().unwrap_or(i64::MIN);
        let hi = self.max.as_i64().unwrap_or(i64::MAX);
        value.clamp(lo, hi)
    }
}

impl fmt::Display for ControlInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{}] default {}", self.min, self.max, self.def)
    }
}

/// Supported controls of a camera or device, keyed by id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlInfoMap {
    infos: BTreeMap<ControlId, ControlInfo>,
}

impl ControlInfoMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ControlId, info: ControlInfo) {
        self.infos.insert(id, info);
    }

    pub fn get(&self, id: ControlId) -> Option<&ControlInfo> {
        self.infos.get(&id)
    }

    pub fn contains(&self, id: ControlId) -> bool {
        self.infos.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ControlId, &ControlInfo)> {
        self.infos.iter().map(|(id, info)| (*id, info))
    }
}

/// Ordered list of control values
///
/// Entries are kept in ascending id order; kernel writes follow that order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlList {
    values: BTreeMap<ControlId, ControlValue>,
}

impl ControlList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: ControlId, value: impl Into<ControlValue>) {
        self.values.insert(id, value.into());
    }

    pub fn get(&self, id: ControlId) -> Option<&ControlValue> {
        self.values.get(&id)
    }

    pub fn get_mut(&mut self, id: ControlId) -> Option<&mut ControlValue> {
        self.values.get_mut(&id)
    }

    pub fn contains(&self, id: ControlId) -> bool {
        self.values.contains_key(&id)
    }

    pub fn remove(&mut self, id: ControlId) -> Option<ControlValue> {
        self.values.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn ids(&self) -> Vec<ControlId> {
        self.values.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ControlId, &ControlValue)> {
        self.values.iter().map(|(id, value)| (*id, value))
    }

    /// Copy every entry of `other` into this list, overwriting existing ids
    pub fn merge(&mut self, other: &ControlList) {
        for (id, value) in other.iter() {
            self.values.insert(id, value.clone());
        }
    }
}

impl FromIterator<(ControlId, ControlValue)> for ControlList {
    fn from_iter<T: IntoIterator<Item = (ControlId, ControlValue)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversions() {
        assert_eq!(ControlValue::from(true).as_i64(), Some(1));
        assert_eq!(ControlValue::Int64(i64::MAX).as_i32(), None);
        assert_eq!(ControlValue::Int32(-4).as_f32(), Some(-4.0));
        assert_eq!(ControlValue::Bytes(vec![1, 2]).control_type(), ControlType::Byte);
        assert!(ControlValue::Bytes(vec![]).is_array());
        assert!(!ControlValue::Byte(1).is_array());
    }

    #[test]
    fn test_list_is_ordered_by_id() {
        let mut list = ControlList::new();
        list.set(ids::SATURATION, 1.0f32);
        list.set(ids::AE_ENABLE, true);
        list.set(ids::BRIGHTNESS, 0.5f32);

        assert_eq!(
            list.ids(),
            vec![ids::AE_ENABLE, ids::BRIGHTNESS, ids::SATURATION]
        );
    }

    #[test]
    fn test_merge_overwrites() {
        let mut a = ControlList::new();
        a.set(ids::AE_LOCKED, false);
        let mut b = ControlList::new();
        b.set(ids::AE_LOCKED, true);
        b.set(ids::SENSOR_TIMESTAMP, 42i64);

        a.merge(&b);
        assert_eq!(a.get(ids::AE_LOCKED), Some(&ControlValue::Bool(true)));
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_info_clamp() {
        let info = ControlInfo::new(-1.0f32, 1.0f32, 0.0f32);
        assert_eq!(info.clamp_f32(3.0), 1.0);
        let info = ControlInfo::new(0i32, 255i32, 128i32);
        assert_eq!(info.clamp_i64(-5), 0);
    }
}
