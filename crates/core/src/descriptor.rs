//! Declarative pipeline descriptors
//!
//! A [`PipelineDescriptor`] is the ordered list of stages a client asks for.
//! It is immutable once built and is turned into the engine's native launch
//! syntax (`type key=value ! type key=value`) by [`PipelineDescriptor::to_launch_line`].

use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{Error, Result};

/// Separator between linked stages in the launch syntax
pub const LINK_SEPARATOR: &str = " ! ";

/// One processing stage (source, filter or sink) with named properties
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Stage type name, e.g. `videotestsrc`
    #[serde(rename = "type")]
    pub stage_type: String,

    #[serde(default, skip_serializing_if = "StageProperties::is_empty")]
    pub properties: StageProperties,
}

impl StageSpec {
    pub fn new(stage_type: impl Into<String>) -> Self {
        Self {
            stage_type: stage_type.into(),
            properties: StageProperties::default(),
        }
    }

    /// Builder-style property setter
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name, value);
        self
    }

    fn write_launch_fragment(&self, out: &mut String) {
        out.push_str(&self.stage_type);
        for (name, value) in self.properties.iter() {
            out.push(' ');
            out.push_str(name);
            out.push('=');
            push_property_value(out, &launch_value(value));
        }
    }
}

/// Stage properties in the order the client listed them
///
/// Some engines apply properties in sequence (a preset can reset values set
/// before it), so the order is carried through to the launch line. Values
/// keep their JSON type and are only turned into text when rendered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageProperties(Vec<(String, Value)>);

impl StageProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property; an existing name keeps its position
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for StageProperties {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for StageProperties {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_option(PropertiesVisitor)
    }
}

struct PropertiesVisitor;

impl<'de> Visitor<'de> for PropertiesVisitor {
    type Value = StageProperties;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of property names to values")
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
        Ok(StageProperties::default())
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
        Ok(StageProperties::default())
    }

    fn visit_some<D>(self, deserializer: D) -> std::result::Result<Self::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(self)
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut properties = StageProperties::default();
        while let Some((name, value)) = map.next_entry::<String, Value>()? {
            properties.insert(name, value);
        }
        Ok(properties)
    }
}

/// Ordered, non-empty sequence of stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineDescriptor {
    elements: Vec<StageSpec>,
}

impl PipelineDescriptor {
    /// Build a descriptor, rejecting an empty stage list
    pub fn new(elements: Vec<StageSpec>) -> Result<Self> {
        if elements.is_empty() {
            return Err(Error::InvalidPipeline);
        }
        Ok(Self { elements })
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Always false: an empty descriptor cannot be constructed
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Render the engine's native description for this descriptor
    pub fn to_launch_line(&self) -> String {
        let mut line = String::new();
        for (index, stage) in self.elements.iter().enumerate() {
            if index > 0 {
                line.push_str(LINK_SEPARATOR);
            }
            stage.write_launch_fragment(&mut line);
        }
        line
    }
}

/// Text form of a property value; strings are used as-is, other JSON values verbatim
fn launch_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn push_property_value(out: &mut String, value: &str) {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '!' || c == '"');
    if !needs_quotes {
        out.push_str(value);
        return;
    }
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}
