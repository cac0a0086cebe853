//! Represent the values that PVs deliver to their listeners.
//!
//! Every update carried by a [`Pv`](crate::Pv) is a [`VType`]: the data itself as a
//! [`Value`], together with an [`Alarm`] and the timestamp of the update. The data
//! kinds, and the native type used to represent them, are:
//! - [`Value::Double`] ([`f64`])
//! - [`Value::Long`] ([`i64`])
//! - [`Value::Int`] ([`i32`])
//! - [`Value::Boolean`] ([`bool`])
//! - [`Value::String`] ([`String`])
//! - [`Value::DoubleArray`] ([`Vec<f64>`])
//! - [`Value::StringArray`] ([`Vec<String>`])
//! - [`Value::Enum`] - an index into a list of labels, which travel with the value.
//!
//! Each kind is also named by [`ValueKind`], which parses from the `VDouble`,
//! `VStringArray`, ... spelling used in local PV names such as
//! `loc://x<VLong>(42)`.
//!
//! Disconnection is not an error in this model. A PV that loses its connection
//! publishes a synthetic value built by [`VType::disconnected`], which carries the
//! last known data (if any) and an [`AlarmSeverity::Undefined`] alarm with status
//! [`AlarmStatus::Client`].
//!
use std::{
    fmt::{self, Display},
    str::FromStr,
    time::SystemTime,
};

use crate::{PvError, providers::initializer::split_initial_items};

/// Data carried by a PV update
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Double(f64),
    Long(i64),
    Int(i32),
    Boolean(bool),
    String(String),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
    Enum { index: i32, labels: Vec<String> },
}

/// The kind of a [`Value`], independent of the data
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Double,
    Long,
    Int,
    Boolean,
    String,
    DoubleArray,
    StringArray,
    Enum,
}

impl ValueKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ValueKind::Double => "VDouble",
            ValueKind::Long => "VLong",
            ValueKind::Int => "VInt",
            ValueKind::Boolean => "VBoolean",
            ValueKind::String => "VString",
            ValueKind::DoubleArray => "VDoubleArray",
            ValueKind::StringArray => "VStringArray",
            ValueKind::Enum => "VEnum",
        }
    }
}

impl Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

impl FromStr for ValueKind {
    type Err = PvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept both "VDouble" and the bare "double"
        let bare = s.strip_prefix('V').unwrap_or(s);
        Ok(match bare.to_ascii_lowercase().as_str() {
            "double" => ValueKind::Double,
            "long" => ValueKind::Long,
            "int" => ValueKind::Int,
            "boolean" => ValueKind::Boolean,
            "string" => ValueKind::String,
            "doublearray" => ValueKind::DoubleArray,
            "stringarray" => ValueKind::StringArray,
            "enum" => ValueKind::Enum,
            _ => return Err(PvError::InvalidValue(format!("Unknown value type '{s}'"))),
        })
    }
}

fn cast<T, U>(from: T) -> Result<U, PvError>
where
    T: num::NumCast + Copy + Display,
    U: num::NumCast,
{
    <U as num::NumCast>::from(from)
        .ok_or_else(|| PvError::InvalidValue(format!("Cannot represent {from} as requested type")))
}

/// Parse a number, accepting `0x` prefixed hexadecimal
pub(crate) fn parse_number(text: &str) -> Result<f64, PvError> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x") {
        return i64::from_str_radix(hex, 16)
            .map(|v| v as f64)
            .map_err(|_| PvError::InvalidValue(format!("Cannot parse number from '{text}'")));
    }
    text.parse()
        .map_err(|_| PvError::InvalidValue(format!("Cannot parse number from '{text}'")))
}

/// Split a written text like `1, 2, "three"` into its items
fn split_items(text: &str) -> Result<Vec<String>, PvError> {
    let items = split_initial_items(text).map_err(PvError::InvalidValue)?;
    Ok(items
        .unwrap_or_default()
        .into_iter()
        .map(|item| item.text)
        .collect())
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Double(_) => ValueKind::Double,
            Value::Long(_) => ValueKind::Long,
            Value::Int(_) => ValueKind::Int,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::String(_) => ValueKind::String,
            Value::DoubleArray(_) => ValueKind::DoubleArray,
            Value::StringArray(_) => ValueKind::StringArray,
            Value::Enum { .. } => ValueKind::Enum,
        }
    }

    /// Scalar numeric view of the value, if it has one
    ///
    /// Booleans read as 1 or 0 and enums as their index. Strings and arrays
    /// have no numeric view.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Long(v) => Some(*v as f64),
            Value::Int(v) => Some(f64::from(*v)),
            Value::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
            Value::Enum { index, .. } => Some(f64::from(*index)),
            Value::String(_) | Value::DoubleArray(_) | Value::StringArray(_) => None,
        }
    }

    fn is_numeric(&self) -> bool {
        self.as_f64().is_some()
    }

    /// Convert between scalar kinds
    ///
    /// Numeric conversions must be representable in the target type, so a
    /// `Double(1e20)` cannot become an `Int`. Anything can become a string.
    pub fn convert_to(&self, kind: ValueKind) -> Result<Value, PvError> {
        if self.kind() == kind {
            return Ok(self.clone());
        }
        let no_convert = || {
            PvError::InvalidValue(format!("Cannot convert {} to {kind}", self.kind()))
        };
        Ok(match kind {
            ValueKind::Double => Value::Double(match self {
                Value::String(s) => parse_number(s)?,
                _ => self.as_f64().ok_or_else(no_convert)?,
            }),
            ValueKind::Long => Value::Long(match self {
                Value::String(s) => parse_number(s)? as i64,
                Value::Long(v) => *v,
                Value::Int(v) => i64::from(*v),
                _ => cast(self.as_f64().ok_or_else(no_convert)?.trunc())?,
            }),
            ValueKind::Int => Value::Int(match self {
                Value::String(s) => parse_number(s)? as i32,
                Value::Long(v) => cast(*v)?,
                _ => cast(self.as_f64().ok_or_else(no_convert)?.trunc())?,
            }),
            ValueKind::Boolean => Value::Boolean(match self {
                Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
                _ => self.as_f64().ok_or_else(no_convert)? != 0.0,
            }),
            ValueKind::String => Value::String(self.to_string()),
            ValueKind::DoubleArray => Value::DoubleArray(match self {
                Value::DoubleArray(v) => v.clone(),
                Value::StringArray(items) => items
                    .iter()
                    .map(|s| parse_number(s))
                    .collect::<Result<_, _>>()?,
                Value::String(text) => split_items(text)?
                    .iter()
                    .map(|s| parse_number(s))
                    .collect::<Result<_, _>>()?,
                _ => vec![self.as_f64().ok_or_else(no_convert)?],
            }),
            ValueKind::StringArray => Value::StringArray(match self {
                Value::StringArray(v) => v.clone(),
                Value::DoubleArray(v) => v.iter().map(|d| d.to_string()).collect(),
                Value::String(text) => split_items(text)?,
                _ => vec![self.to_string()],
            }),
            ValueKind::Enum => return Err(no_convert()),
        })
    }

    /// Adapt a newly written value to the kind of an existing value
    ///
    /// For enums, this allows writing the index as a number, or a label as a
    /// string. For numbers, allows writing strings which are then parsed.
    ///
    /// If `change_from_double` is set, the existing value is the placeholder of a
    /// PV that was never given a type, and a value that doesn't parse as a number
    /// replaces it with its own kind instead of failing.
    pub fn adapt(new_value: Value, old_value: &Value, change_from_double: bool) -> Result<Value, PvError> {
        let kind = old_value.kind();
        if new_value.kind() == kind {
            return Ok(new_value);
        }
        match kind {
            ValueKind::Enum => {
                let Value::Enum { labels, .. } = old_value else {
                    unreachable!("kind() and variant disagree");
                };
                let index = match &new_value {
                    Value::String(label) => match labels.iter().position(|l| l == label) {
                        Some(i) => i as i32,
                        None => match label.trim().parse::<i32>() {
                            Ok(i) => i,
                            Err(_) => {
                                return Err(PvError::InvalidValue(format!(
                                    "'{label}' is not one of {labels:?}"
                                )));
                            }
                        },
                    },
                    other => match other.as_f64() {
                        Some(v) => cast(v.trunc())?,
                        None => {
                            return Err(PvError::InvalidValue(format!(
                                "Cannot write {} to an enum",
                                other.kind()
                            )));
                        }
                    },
                };
                Ok(Value::Enum {
                    index,
                    labels: labels.clone(),
                })
            }
            ValueKind::Double => match new_value.convert_to(ValueKind::Double) {
                Ok(v) => Ok(v),
                Err(_) if change_from_double => Ok(match new_value {
                    Value::StringArray(items) => match Value::StringArray(items.clone())
                        .convert_to(ValueKind::DoubleArray)
                    {
                        Ok(numbers) => numbers,
                        Err(_) => Value::StringArray(items),
                    },
                    other => other,
                }),
                Err(e) => Err(e),
            },
            _ => new_value.convert_to(kind),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Double(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::String(v) => f.write_str(v),
            Value::DoubleArray(v) => write!(
                f,
                "{}",
                v.iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Value::StringArray(v) => write!(f, "{}", v.join(", ")),
            Value::Enum { index, labels } => match usize::try_from(*index)
                .ok()
                .and_then(|i| labels.get(i))
            {
                Some(label) => f.write_str(label),
                None => write!(f, "{index}"),
            },
        }
    }
}

/// Implement From<datatype> and TryFrom<&Value> for a specific value kind
macro_rules! impl_value_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<$typ> for Value {
            fn from(value: $typ) -> Self {
                Value::$variant(value)
            }
        }
        impl TryFrom<&Value> for $typ {
            type Error = PvError;
            fn try_from(value: &Value) -> Result<Self, Self::Error> {
                match value.convert_to(ValueKind::$variant)? {
                    Value::$variant(v) => Ok(v),
                    _ => unreachable!(),
                }
            }
        }
    };
}
impl_value_conversions_between!(Double, f64);
impl_value_conversions_between!(Long, i64);
impl_value_conversions_between!(Int, i32);
impl_value_conversions_between!(Boolean, bool);
impl_value_conversions_between!(String, String);
impl_value_conversions_between!(DoubleArray, Vec<f64>);
impl_value_conversions_between!(StringArray, Vec<String>);

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

/// Severity of an alarm, ordered from least to most severe
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AlarmSeverity {
    #[default]
    None,
    Minor,
    Major,
    Invalid,
    Undefined,
}

/// Source of an alarm
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AlarmStatus {
    #[default]
    None,
    Device,
    Driver,
    Record,
    Db,
    Conf,
    Undefined,
    Client,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Alarm {
    pub severity: AlarmSeverity,
    pub status: AlarmStatus,
    pub message: String,
}

impl Alarm {
    pub fn none() -> Self {
        Alarm::default()
    }

    /// Value that was never set
    pub fn udf() -> Self {
        Alarm {
            severity: AlarmSeverity::Undefined,
            status: AlarmStatus::Undefined,
            message: "UDF".to_owned(),
        }
    }

    pub fn disconnected() -> Self {
        Alarm {
            severity: AlarmSeverity::Undefined,
            status: AlarmStatus::Client,
            message: "Disconnected".to_owned(),
        }
    }
}

/// A value, its alarm state, and when it was produced
#[derive(Clone, Debug, PartialEq)]
pub struct VType {
    pub value: Value,
    pub alarm: Alarm,
    pub timestamp: SystemTime,
}

impl VType {
    /// A value without alarm, stamped now
    pub fn new(value: impl Into<Value>) -> Self {
        Self::with_alarm(value, Alarm::none())
    }

    pub fn with_alarm(value: impl Into<Value>, alarm: Alarm) -> Self {
        VType {
            value: value.into(),
            alarm,
            timestamp: SystemTime::now(),
        }
    }

    /// The synthetic value published when a PV loses its connection
    ///
    /// Keeps the data of the last known value so that displays can still show
    /// what was last seen.
    pub fn disconnected(last: Option<&VType>) -> Self {
        let value = last
            .map(|v| v.value.clone())
            .unwrap_or(Value::Double(0.0));
        Self::with_alarm(value, Alarm::disconnected())
    }

    pub fn is_disconnected(&self) -> bool {
        self.alarm.severity == AlarmSeverity::Undefined && self.alarm.status == AlarmStatus::Client
    }
}

impl Display for VType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.alarm.severity == AlarmSeverity::None {
            write!(f, "{}", self.value)
        } else {
            write!(
                f,
                "{} {:?} {}",
                self.value, self.alarm.severity, self.alarm.message
            )
        }
    }
}
