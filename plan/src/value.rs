//! Plain values for task arguments and emission payloads.

/// A plain value attached to a task argument or an emission payload.
///
/// The kernel never interprets these; they travel with the object and are
/// handed back to external collaborators unchanged.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    /// Boolean value.
    Bool(bool),

    /// Signed integer value.
    Int(i64),

    /// Floating point value.
    Float(f64),

    /// String value.
    Str(String),
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}
