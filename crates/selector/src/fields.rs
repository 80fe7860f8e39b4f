//! Kubernetes field-selector grammar.
//!
//! Comma-joined `key=value`, `key==value`, `key!=value` terms. Commas,
//! equals signs, and backslashes inside values are escaped with `\`. Terms
//! are sorted before parsing, which fixes SQL argument order downstream.

use crate::SelectorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldOperator {
    Equals,
    DoubleEquals,
    NotEquals,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FieldRequirement {
    pub field: String,
    pub op: FieldOperator,
    pub value: String,
}

pub(crate) fn parse(selector: &str) -> Result<Vec<FieldRequirement>, SelectorError> {
    let mut terms = split_terms(selector);
    terms.sort_unstable();
    let mut reqs = Vec::new();
    for term in terms {
        if term.is_empty() {
            continue;
        }
        let Some((field, op, value)) = split_term(term) else {
            return Err(SelectorError::Field(format!(
                "invalid selector: can't understand '{term}'"
            )));
        };
        reqs.push(FieldRequirement {
            field: field.to_string(),
            op,
            value: unescape_value(value)?,
        });
    }
    Ok(reqs)
}

// Split on unescaped commas.
fn split_terms(selector: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let mut start = 0;
    let mut in_slash = false;
    for (i, c) in selector.char_indices() {
        if in_slash {
            in_slash = false;
        } else if c == '\\' {
            in_slash = true;
        } else if c == ',' {
            terms.push(&selector[start..i]);
            start = i + 1;
        }
    }
    terms.push(&selector[start..]);
    terms
}

// First operator occurrence wins; `!=` is tried before `==` before `=`.
fn split_term(term: &str) -> Option<(&str, FieldOperator, &str)> {
    for (i, _) in term.char_indices() {
        let rest = &term[i..];
        if let Some(value) = rest.strip_prefix("!=") {
            return Some((&term[..i], FieldOperator::NotEquals, value));
        }
        if let Some(value) = rest.strip_prefix("==") {
            return Some((&term[..i], FieldOperator::DoubleEquals, value));
        }
        if let Some(value) = rest.strip_prefix('=') {
            return Some((&term[..i], FieldOperator::Equals, value));
        }
    }
    None
}

fn unescape_value(value: &str) -> Result<String, SelectorError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(e @ ('\\' | ',' | '=')) => out.push(e),
            Some(e) => {
                return Err(SelectorError::Field(format!(
                    "invalid escape sequence '\\{e}' in value '{value}'"
                )))
            }
            None => {
                return Err(SelectorError::Field(format!(
                    "unterminated escape sequence in value '{value}'"
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(field: &str, op: FieldOperator, value: &str) -> FieldRequirement {
        FieldRequirement { field: field.into(), op, value: value.into() }
    }

    #[test]
    fn parses_the_three_operators() {
        assert_eq!(
            parse("spec.nodeName=node1").unwrap(),
            vec![req("spec.nodeName", FieldOperator::Equals, "node1")]
        );
        assert_eq!(
            parse("status.phase==Running").unwrap(),
            vec![req("status.phase", FieldOperator::DoubleEquals, "Running")]
        );
        assert_eq!(
            parse("status.phase!=Failed").unwrap(),
            vec![req("status.phase", FieldOperator::NotEquals, "Failed")]
        );
    }

    #[test]
    fn terms_sort_before_parsing() {
        assert_eq!(
            parse("status.phase=Running,metadata.name=web").unwrap(),
            vec![
                req("metadata.name", FieldOperator::Equals, "web"),
                req("status.phase", FieldOperator::Equals, "Running"),
            ]
        );
    }

    #[test]
    fn escaped_values_round_trip() {
        assert_eq!(
            parse(r"metadata.name=a\,b\=c\\d").unwrap(),
            vec![req("metadata.name", FieldOperator::Equals, r"a,b=c\d")]
        );
    }

    #[test]
    fn rejects_invalid_terms() {
        assert!(parse("no-operator").is_err());
        assert!(parse(r"a=b\x").is_err());
        assert!(parse("a=b\\").is_err());
        assert_eq!(parse("").unwrap(), Vec::new());
    }
}
