//! Parse local PV names, `name<VType>(initial, "values")`

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{escaped_transform, is_not, tag, take_while, take_while1},
    character::complete::{char, multispace0, satisfy},
    combinator::{all_consuming, opt, recognize, value},
    multi::separated_list1,
    sequence::{delimited, pair},
};

use crate::{
    PvError,
    vtype::{Alarm, VType, Value, ValueKind, parse_number},
};

/// One item from the initial value list
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct InitialItem {
    /// Text of the item, with quotes removed and escapes resolved
    pub text: String,
    pub quoted: bool,
}

/// A local PV name split into its parts
#[derive(Debug)]
pub(crate) struct LocalName<'a> {
    pub name: &'a str,
    pub kind: Option<ValueKind>,
    /// `None` when no initial value was given
    pub initial: Option<Vec<InitialItem>>,
}

/// A letter, followed by letters, digits or any of `-:_.`
pub(crate) fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic()),
        take_while(|c: char| c.is_ascii_alphanumeric() || "-:_.".contains(c)),
    ))
    .parse(input)
}

fn type_tag(input: &str) -> IResult<&str, &str> {
    delimited(
        char('<'),
        take_while1(|c: char| c.is_ascii_alphanumeric()),
        char('>'),
    )
    .parse(input)
}

fn quoted_item(input: &str) -> IResult<&str, InitialItem> {
    delimited(
        char('"'),
        opt(escaped_transform(
            is_not("\\\""),
            '\\',
            alt((value("\\", tag("\\")), value("\"", tag("\"")))),
        )),
        char('"'),
    )
    .map(|text: Option<String>| InitialItem {
        text: text.unwrap_or_default(),
        quoted: true,
    })
    .parse(input)
}

fn bare_item(input: &str) -> IResult<&str, InitialItem> {
    is_not(",\"")
        .map(|text: &str| InitialItem {
            text: text.trim().to_owned(),
            quoted: false,
        })
        .parse(input)
}

/// Split the text between the parentheses of an initial value into items
///
/// Empty text means there is no initial value.
pub(crate) fn split_initial_items(text: &str) -> Result<Option<Vec<InitialItem>>, String> {
    if text.trim().is_empty() {
        return Ok(None);
    }
    all_consuming(separated_list1(
        char(','),
        delimited(multispace0, alt((quoted_item, bare_item)), multispace0),
    ))
    .parse(text)
    .map(|(_, items)| Some(items))
    .map_err(|_| format!("Cannot split initial value '{text}' into items"))
}

/// Parse the part of a local PV name after `loc://`
pub(crate) fn parse_local_name(base_name: &str) -> Result<LocalName<'_>, PvError> {
    let invalid = |reason: String| PvError::InvalidName {
        name: base_name.to_owned(),
        reason,
    };
    let (rest, (name, kind)) = (identifier, opt(type_tag))
        .parse(base_name)
        .map_err(|_: nom::Err<nom::error::Error<&str>>| invalid("Missing PV name".into()))?;
    let kind = kind.map(str::parse::<ValueKind>).transpose()?;
    if rest.is_empty() {
        return Ok(LocalName {
            name,
            kind,
            initial: None,
        });
    }
    let Some(inner) = rest.strip_prefix('(') else {
        return Err(invalid(format!("Unexpected '{rest}' after name")));
    };
    let Some(inner) = inner.strip_suffix(')') else {
        return Err(invalid("Missing ')' of initial value".into()));
    };
    Ok(LocalName {
        name,
        kind,
        initial: split_initial_items(inner).map_err(invalid)?,
    })
}

fn infer_kind(items: Option<&[InitialItem]>) -> ValueKind {
    match items {
        None => ValueKind::Double,
        Some(items) if items.iter().any(|i| i.quoted) => {
            if items.len() == 1 {
                ValueKind::String
            } else {
                ValueKind::StringArray
            }
        }
        Some([_]) => ValueKind::Double,
        Some(_) => ValueKind::DoubleArray,
    }
}

/// Build the initial value of a local PV
///
/// Without an explicit kind, the kind is inferred: quoted items give strings,
/// anything else numbers, and more than one item an array. A PV without any
/// initial value starts as an undefined `0.0`.
pub(crate) fn initial_value(
    items: Option<&[InitialItem]>,
    kind: Option<ValueKind>,
) -> Result<VType, PvError> {
    let kind = kind.unwrap_or_else(|| infer_kind(items));
    let expected_one = |what: &str| {
        let got: Vec<_> = items
            .unwrap_or_default()
            .iter()
            .map(|i| i.text.as_str())
            .collect();
        PvError::InvalidValue(format!("Expected one {what}, got {got:?}"))
    };
    let value = match (kind, items) {
        (ValueKind::Double, None) => return Ok(VType::with_alarm(0.0, Alarm::udf())),
        (ValueKind::Double, Some([item])) => Value::Double(parse_number(&item.text)?),
        (ValueKind::Long, Some([item])) => Value::Long(parse_number(&item.text)? as i64),
        (ValueKind::Int, Some([item])) => Value::Int(parse_number(&item.text)? as i32),
        (ValueKind::Double | ValueKind::Long | ValueKind::Int, _) => {
            return Err(expected_one("number"));
        }
        (ValueKind::Boolean, None) => Value::Boolean(false),
        (ValueKind::Boolean, Some([item])) => {
            Value::Boolean(item.text.eq_ignore_ascii_case("true"))
        }
        (ValueKind::Boolean, _) => return Err(expected_one("boolean")),
        (ValueKind::String, None) => Value::String(String::new()),
        (ValueKind::String, Some([item])) => Value::String(item.text.clone()),
        (ValueKind::String, _) => return Err(expected_one("string")),
        (ValueKind::DoubleArray, None) => Value::DoubleArray(Vec::new()),
        (ValueKind::DoubleArray, Some(items)) => Value::DoubleArray(
            items
                .iter()
                .map(|i| parse_number(&i.text))
                .collect::<Result<_, _>>()?,
        ),
        (ValueKind::StringArray, None) => Value::StringArray(vec![String::new()]),
        (ValueKind::StringArray, Some(items)) => {
            Value::StringArray(items.iter().map(|i| i.text.clone()).collect())
        }
        (ValueKind::Enum, Some([index, labels @ ..])) if !labels.is_empty() => Value::Enum {
            index: index.text.parse().map_err(|_| {
                PvError::InvalidValue(format!("Cannot parse enum index '{}'", index.text))
            })?,
            labels: labels.iter().map(|l| l.text.clone()).collect(),
        },
        (ValueKind::Enum, _) => {
            return Err(PvError::InvalidValue(
                "VEnum needs at least '(index, \"Label0\")'".into(),
            ));
        }
    };
    Ok(VType::new(value))
}
