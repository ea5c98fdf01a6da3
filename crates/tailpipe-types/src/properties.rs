//! Property descriptors and property storage

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::{DataType, Value};

/// Shared handle to a property descriptor
pub type Property = &'static PropertyDescriptor;

/// Describes one source-level property
pub struct PropertyDescriptor {
    id: &'static str,
    display_name: &'static str,
    default: Value,
}

impl PropertyDescriptor {
    pub const fn new(id: &'static str, display_name: &'static str, default: Value) -> Self {
        Self {
            id,
            display_name,
            default,
        }
    }

    pub fn id(&self) -> &'static str {
        self.id
    }

    pub fn display_name(&self) -> &'static str {
        self.display_name
    }

    pub fn data_type(&self) -> DataType {
        self.default.data_type()
    }

    pub fn default_value(&self) -> Value {
        self.default.clone()
    }
}

impl PartialEq for PropertyDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PropertyDescriptor {}

impl Hash for PropertyDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for PropertyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyDescriptor")
            .field("id", &self.id)
            .field("data_type", &self.data_type())
            .finish()
    }
}

// ============================================================================
// Well-known properties
// ============================================================================

pub static NAME: PropertyDescriptor = PropertyDescriptor::new("name", "Name", Value::Text(None));

pub static START_TIMESTAMP: PropertyDescriptor =
    PropertyDescriptor::new("start_timestamp", "First Timestamp", Value::Timestamp(None));

pub static END_TIMESTAMP: PropertyDescriptor =
    PropertyDescriptor::new("end_timestamp", "Last Timestamp", Value::Timestamp(None));

pub static DURATION: PropertyDescriptor =
    PropertyDescriptor::new("duration", "Duration", Value::TimeSpan(None));

pub static LAST_MODIFIED: PropertyDescriptor =
    PropertyDescriptor::new("last_modified", "Last Modified", Value::Timestamp(None));

pub static CREATED: PropertyDescriptor =
    PropertyDescriptor::new("created", "Created", Value::Timestamp(None));

/// Size of the underlying data in bytes
pub static SIZE: PropertyDescriptor = PropertyDescriptor::new("size", "Size", Value::Size(None));

/// How much of the available data has been processed, in [0, 1]
pub static PERCENTAGE_PROCESSED: PropertyDescriptor =
    PropertyDescriptor::new("percentage_processed", "Processed", Value::Percentage(0.0));

pub static EMPTY_REASON: PropertyDescriptor =
    PropertyDescriptor::new("empty_reason", "Empty Reason", Value::EmptyReason(None));

/// Number of rows currently exposed
pub static LOG_ENTRY_COUNT: PropertyDescriptor =
    PropertyDescriptor::new("log_entry_count", "Count", Value::Integer(0));

/// Length of the longest line, in characters
pub static MAX_CHARACTERS_PER_LINE: PropertyDescriptor = PropertyDescriptor::new(
    "max_characters_per_line",
    "Max Characters Per Line",
    Value::Integer(0),
);

/// Properties every log source provides
pub static MINIMUM: [Property; 11] = [
    &NAME,
    &START_TIMESTAMP,
    &END_TIMESTAMP,
    &DURATION,
    &LAST_MODIFIED,
    &CREATED,
    &SIZE,
    &PERCENTAGE_PROCESSED,
    &EMPTY_REASON,
    &LOG_ENTRY_COUNT,
    &MAX_CHARACTERS_PER_LINE,
];

// ============================================================================
// Storage
// ============================================================================

/// Ordered property/value pairs
#[derive(Clone, Debug, Default)]
pub struct PropertiesBuffer {
    values: Vec<(Property, Value)>,
}

impl PropertiesBuffer {
    /// Buffer holding every given property at its default value
    pub fn new(properties: impl IntoIterator<Item = Property>) -> Self {
        let mut buffer = Self::default();
        for property in properties {
            buffer.add(property);
        }
        buffer
    }

    /// Buffer with the minimum property set
    pub fn minimum() -> Self {
        Self::new(MINIMUM)
    }

    /// Register `property` at its default value unless already present
    pub fn add(&mut self, property: Property) {
        if !self.contains(property) {
            self.values.push((property, property.default_value()));
        }
    }

    pub fn contains(&self, property: Property) -> bool {
        self.values.iter().any(|(p, _)| *p == property)
    }

    pub fn properties(&self) -> Vec<Property> {
        self.values.iter().map(|(p, _)| *p).collect()
    }

    pub fn get(&self, property: Property) -> Option<&Value> {
        self.values
            .iter()
            .find(|(p, _)| *p == property)
            .map(|(_, v)| v)
    }

    /// Value of `property`, its default when absent
    pub fn value(&self, property: Property) -> Value {
        self.get(property)
            .cloned()
            .unwrap_or_else(|| property.default_value())
    }

    /// Store `value`, adding the property if needed.
    ///
    /// Returns false and leaves the buffer untouched when the value has the wrong type.
    pub fn set(&mut self, property: Property, value: Value) -> bool {
        if value.data_type() != property.data_type() {
            return false;
        }
        match self.values.iter_mut().find(|(p, _)| *p == property) {
            Some((_, slot)) => *slot = value,
            None => self.values.push((property, value)),
        }
        true
    }

    /// Reset every value to its default, keeping the property set
    pub fn reset(&mut self) {
        for (property, value) in &mut self.values {
            *value = property.default_value();
        }
    }

    /// Copy all values into `destination`, overwriting what's there
    pub fn copy_all_to(&self, destination: &mut PropertiesBuffer) {
        for (property, value) in &self.values {
            destination.set(*property, value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Property, &Value)> {
        self.values.iter().map(|(p, v)| (*p, v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
