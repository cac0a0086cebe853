//! Parse PV names of the form `[type://]name` and `=formula`

use std::{collections::BTreeSet, fmt};

/// Separator between the type prefix and the rest of a PV name
pub const SEPARATOR: &str = "://";

/// Type used for names that start with `=`
pub const FORMULA_TYPE: &str = "eq";

/// A PV name split into its type prefix and the remaining name
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TypedName {
    pub pv_type: String,
    pub name: String,
}

impl TypedName {
    /// Split a PV name, using `default_type` when the name carries no prefix
    ///
    /// A leading `=` always selects the formula type, even when the formula
    /// itself references names that contain `://`.
    pub fn analyze(name: &str, default_type: &str) -> TypedName {
        if let Some(formula) = name.strip_prefix('=') {
            return TypedName {
                pv_type: FORMULA_TYPE.to_owned(),
                name: formula.to_owned(),
            };
        }
        match name.find(SEPARATOR) {
            Some(sep) if sep > 0 => TypedName {
                pv_type: name[..sep].to_owned(),
                name: name[sep + SEPARATOR.len()..].to_owned(),
            },
            _ => TypedName {
                pv_type: default_type.to_owned(),
                name: name.to_owned(),
            },
        }
    }

    /// Join a type and a name into `type://name`
    pub fn format(pv_type: &str, name: &str) -> String {
        format!("{pv_type}{SEPARATOR}{name}")
    }
}

impl fmt::Display for TypedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.pv_type, self.name)
    }
}

/// Spellings of a name under a set of interchangeable protocol prefixes
///
/// When `name` carries one of the `equivalent_prefixes`, the result holds the
/// name itself, the bare name, and the bare name under every equivalent prefix.
/// Any other name (no prefix, or a prefix outside the set) only maps to itself.
pub fn name_variants<S: AsRef<str>>(name: &str, equivalent_prefixes: &[S]) -> BTreeSet<String> {
    let mut variants = BTreeSet::new();
    variants.insert(name.to_owned());

    let Some((prefix, base)) = name.split_once(SEPARATOR) else {
        return variants;
    };
    if !equivalent_prefixes.iter().any(|p| p.as_ref() == prefix) {
        return variants;
    }
    variants.insert(base.to_owned());
    for equivalent in equivalent_prefixes {
        variants.insert(TypedName::format(equivalent.as_ref(), base));
    }
    variants
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analyze_names() {
        let t = TypedName::analyze("ca://fred", "loc");
        assert_eq!(t.pv_type, "ca");
        assert_eq!(t.name, "fred");

        let t = TypedName::analyze("fred", "loc");
        assert_eq!(t.pv_type, "loc");
        assert_eq!(t.name, "fred");

        let t = TypedName::analyze("loc://x(42)", "ca");
        assert_eq!(t.to_string(), "loc://x(42)");

        let t = TypedName::analyze("=`loc://a` + 2", "ca");
        assert_eq!(t.pv_type, FORMULA_TYPE);
        assert_eq!(t.name, "`loc://a` + 2");

        // Leading separator is not a type
        let t = TypedName::analyze("://odd", "ca");
        assert_eq!(t.pv_type, "ca");
        assert_eq!(t.name, "://odd");
    }

    #[test]
    fn variants() {
        let v = name_variants("ca://fred", &["ca", "pva"]);
        assert_eq!(
            v.into_iter().collect::<Vec<_>>(),
            vec!["ca://fred", "fred", "pva://fred"]
        );
        let v = name_variants("fred", &["ca", "pva"]);
        assert_eq!(v.into_iter().collect::<Vec<_>>(), vec!["fred"]);
        let v = name_variants("loc://fred", &["ca", "pva"]);
        assert_eq!(v.into_iter().collect::<Vec<_>>(), vec!["loc://fred"]);
        let v = name_variants::<&str>("ca://fred", &[]);
        assert_eq!(v.len(), 1);
    }
}
