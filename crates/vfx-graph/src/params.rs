//! Typed operator parameters.
//!
//! A [`Params`] bag maps knob names to [`ParamValue`]s. It deserialises
//! from any `serde` format (the graph builder reads it from YAML) and the
//! typed getters turn a missing knob into its default and a mistyped one
//! into [`GraphError::Config`].
//!
//! # Usage
//!
//! ```rust
//! use vfx_graph::Params;
//!
//! let params = Params::new().with("size", 4.5).with("filter", "cubic");
//! assert_eq!(params.double("size", 0.0).unwrap(), 4.5);
//! assert_eq!(params.choice("filter", &["box", "cubic"], 0).unwrap(), 1);
//! assert_eq!(params.int("missing", 3).unwrap(), 3);
//! assert!(params.int("filter", 0).is_err());
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use vfx_core::{ChannelSet, World};

use crate::{GraphError, Result};

/// One parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Floating point.
    Double(f64),
    /// String, enumeration or channel list.
    String(String),
    /// Sequence, e.g. a colour or a 2x3 matrix.
    List(Vec<ParamValue>),
}

impl ParamValue {
    fn kind(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "int",
            ParamValue::Double(_) => "double",
            ParamValue::String(_) => "string",
            ParamValue::List(_) => "list",
        }
    }

    /// Numeric value of an int or double.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::Double(d) => Some(*d),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::Double(d) => write!(f, "{d}"),
            ParamValue::String(s) => write!(f, "{s:?}"),
            ParamValue::List(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Double(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::String(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::String(v)
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(v: Vec<T>) -> Self {
        ParamValue::List(v.into_iter().map(Into::into).collect())
    }
}

/// Named parameters of one operator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, ParamValue>);

fn mismatch(name: &str, wanted: &str, got: &ParamValue) -> GraphError {
    GraphError::config(format!("parameter '{name}' must be {wanted}, got {} {got}", got.kind()))
}

impl Params {
    /// Empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value, builder style.
    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Sets a value.
    pub fn insert(&mut self, name: &str, value: impl Into<ParamValue>) {
        self.0.insert(name.to_string(), value.into());
    }

    /// Raw value.
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    /// True if `name` is set.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no value is set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Names and values in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Names not in `known`, for reporting typos.
    pub fn unknown<'a>(&'a self, known: &[&str]) -> Vec<&'a str> {
        self.0.keys().map(String::as_str).filter(|k| !known.contains(k)).collect()
    }

    /// Boolean knob.
    pub fn bool(&self, name: &str, default: bool) -> Result<bool> {
        match self.get(name) {
            None => Ok(default),
            Some(ParamValue::Bool(b)) => Ok(*b),
            Some(v) => Err(mismatch(name, "a bool", v)),
        }
    }

    /// Integer knob.
    pub fn int(&self, name: &str, default: i64) -> Result<i64> {
        match self.get(name) {
            None => Ok(default),
            Some(ParamValue::Int(i)) => Ok(*i),
            Some(v) => Err(mismatch(name, "an int", v)),
        }
    }

    /// Integer knob that must fit an `i32`.
    pub fn int32(&self, name: &str, default: i32) -> Result<i32> {
        let v = self.int(name, default as i64)?;
        i32::try_from(v).map_err(|_| GraphError::config(format!("parameter '{name}' out of range: {v}")))
    }

    /// Floating point knob; integers are accepted.
    pub fn double(&self, name: &str, default: f64) -> Result<f64> {
        match self.get(name) {
            None => Ok(default),
            Some(v) => v.as_f64().ok_or_else(|| mismatch(name, "a number", v)),
        }
    }

    /// String knob.
    pub fn string(&self, name: &str) -> Result<Option<&str>> {
        match self.get(name) {
            None => Ok(None),
            Some(ParamValue::String(s)) => Ok(Some(s.as_str())),
            Some(v) => Err(mismatch(name, "a string", v)),
        }
    }

    /// List of numbers; a single number is a list of one.
    pub fn doubles(&self, name: &str) -> Result<Option<Vec<f64>>> {
        match self.get(name) {
            None => Ok(None),
            Some(ParamValue::List(items)) => items
                .iter()
                .map(|v| v.as_f64().ok_or_else(|| mismatch(name, "a list of numbers", v)))
                .collect::<Result<Vec<_>>>()
                .map(Some),
            Some(v) => v
                .as_f64()
                .map(|d| Some(vec![d]))
                .ok_or_else(|| mismatch(name, "a list of numbers", v)),
        }
    }

    /// Enumeration knob: index of the value in `options`, compared
    /// case-insensitively. An integer is taken as the index itself.
    pub fn choice(&self, name: &str, options: &[&str], default: usize) -> Result<usize> {
        match self.get(name) {
            None => Ok(default),
            Some(ParamValue::String(s)) => options
                .iter()
                .position(|o| o.eq_ignore_ascii_case(s))
                .ok_or_else(|| GraphError::config(format!("parameter '{name}': '{s}' is not one of {options:?}"))),
            Some(ParamValue::Int(i)) if (*i as usize) < options.len() && *i >= 0 => Ok(*i as usize),
            Some(v) => Err(mismatch(name, "one of the listed names", v)),
        }
    }

    /// Channel-set knob.
    ///
    /// Accepts `"all"`, `"none"`, `"rgb"`, `"rgba"`, `"alpha"`, or channel
    /// names (`"r"`, `"depth.Z"`, ...) separated by spaces or commas, or a
    /// list of such strings. Names are resolved in `world`.
    pub fn channels(&self, name: &str, world: &World, default: ChannelSet) -> Result<ChannelSet> {
        let words: Vec<String> = match self.get(name) {
            None => return Ok(default),
            Some(ParamValue::String(s)) => s.split([' ', ',']).filter(|w| !w.is_empty()).map(str::to_string).collect(),
            Some(ParamValue::List(items)) => items
                .iter()
                .map(|v| match v {
                    ParamValue::String(s) => Ok(s.clone()),
                    other => Err(mismatch(name, "a list of channel names", other)),
                })
                .collect::<Result<_>>()?,
            Some(v) => return Err(mismatch(name, "channel names", v)),
        };
        let mut set = ChannelSet::none();
        for w in words {
            match w.as_str() {
                "all" => set.insert_set(&ChannelSet::all()),
                "none" => {}
                "rgb" => set.insert_set(&ChannelSet::rgb()),
                "rgba" => set.insert_set(&ChannelSet::rgba()),
                "alpha" => set.insert_set(&ChannelSet::alpha()),
                other => set.insert(world.channels.parse(other)?),
            }
        }
        Ok(set)
    }
}

impl FromIterator<(String, ParamValue)> for Params {
    fn from_iter<I: IntoIterator<Item = (String, ParamValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vfx_core::Channel;

    #[test]
    fn test_typed_getters() {
        let p = Params::new()
            .with("on", true)
            .with("count", 3)
            .with("gain", 0.5)
            .with("name", "x")
            .with("color", vec![1.0, 0.5, 0.25]);
        assert!(p.bool("on", false).unwrap());
        assert_eq!(p.int("count", 0).unwrap(), 3);
        assert_eq!(p.double("count", 0.0).unwrap(), 3.0);
        assert_eq!(p.string("name").unwrap(), Some("x"));
        assert_eq!(p.doubles("color").unwrap(), Some(vec![1.0, 0.5, 0.25]));
        assert_eq!(p.doubles("gain").unwrap(), Some(vec![0.5]));
    }

    #[test]
    fn test_mismatch_is_config_error() {
        let p = Params::new().with("gain", "loud");
        let err = p.double("gain", 1.0).unwrap_err();
        assert!(matches!(err, GraphError::Config(_)));
        assert!(err.to_string().contains("gain"));
        assert!(p.int32("big", 0).is_ok());
        assert!(Params::new().with("big", 1i64 << 40).int32("big", 0).is_err());
    }

    #[test]
    fn test_choice() {
        let p = Params::new().with("mode", "ADD").with("idx", 2);
        let opts = ["merge", "add", "over"];
        assert_eq!(p.choice("mode", &opts, 0).unwrap(), 1);
        assert_eq!(p.choice("idx", &opts, 0).unwrap(), 2);
        assert_eq!(p.choice("other", &opts, 2).unwrap(), 2);
        assert!(Params::new().with("mode", "xor").choice("mode", &opts, 0).is_err());
        assert!(Params::new().with("mode", 7).choice("mode", &opts, 0).is_err());
    }

    #[test]
    fn test_channels() {
        let world = World::new();
        let p = Params::new()
            .with("a", "rgb")
            .with("b", "r, alpha")
            .with("c", vec!["depth.Z", "rgba.green"]);
        assert_eq!(p.channels("a", &world, ChannelSet::none()).unwrap(), ChannelSet::rgb());
        let b = p.channels("b", &world, ChannelSet::none()).unwrap();
        assert_eq!(b, ChannelSet::from_slice(&[Channel::RED, Channel::ALPHA]));
        let c = p.channels("c", &world, ChannelSet::none()).unwrap();
        assert!(c.contains(Channel::Z) && c.contains(Channel::GREEN));
        assert_eq!(p.channels("d", &world, ChannelSet::alpha()).unwrap(), ChannelSet::alpha());
    }

    #[test]
    fn test_unknown_names() {
        let p = Params::new().with("size", 1).with("sizee", 2);
        assert_eq!(p.unknown(&["size"]), vec!["sizee"]);
    }
}
