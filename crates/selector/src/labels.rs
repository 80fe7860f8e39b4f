//! Kubernetes label-selector grammar.
//!
//! Comma-joined requirements: `!key`, `key`, `key op value`, and
//! `key in (v1,v2)` / `key notin (v1,v2)`. Requirements come back sorted by
//! key and set-operator values are sorted, deduplicated sets; both orders
//! drive SQL argument order downstream.

use std::collections::BTreeSet;

use crate::SelectorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operator {
    Equals,
    DoubleEquals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
    GreaterThan,
    LessThan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Requirement {
    pub key: String,
    pub op: Operator,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Comma,
    Open,
    Close,
    Bang,
    Eq,
    DoubleEq,
    NotEq,
    Gt,
    Lt,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => format!("'{s}'"),
            Token::Comma => "','".into(),
            Token::Open => "'('".into(),
            Token::Close => "')'".into(),
            Token::Bang => "'!'".into(),
            Token::Eq => "'='".into(),
            Token::DoubleEq => "'=='".into(),
            Token::NotEq => "'!='".into(),
            Token::Gt => "'>'".into(),
            Token::Lt => "'<'".into(),
        }
    }
}

fn lex(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '>' => {
                chars.next();
                tokens.push(Token::Gt);
            }
            '<' => {
                chars.next();
                tokens.push(Token::Lt);
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::DoubleEq);
                } else {
                    tokens.push(Token::Eq);
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Bang);
                }
            }
            _ => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || "(),><=!".contains(c) {
                        break;
                    }
                    ident.push(c);
                    chars.next();
                }
                tokens.push(Token::Ident(ident));
            }
        }
    }
    tokens
}

pub(crate) fn parse(input: &str) -> Result<Vec<Requirement>, SelectorError> {
    let tokens = lex(input);
    let mut reqs = Vec::new();
    let mut pos = 0;
    while pos < tokens.len() {
        reqs.push(parse_requirement(&tokens, &mut pos)?);
        match tokens.get(pos) {
            None => break,
            Some(Token::Comma) => {
                pos += 1;
                if pos == tokens.len() {
                    return Err(SelectorError::Label(
                        "found ',', expected another requirement".into(),
                    ));
                }
            }
            Some(t) => {
                return Err(SelectorError::Label(format!(
                    "found {}, expected ',' or end of selector",
                    t.describe()
                )))
            }
        }
    }
    reqs.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(reqs)
}

fn parse_requirement(tokens: &[Token], pos: &mut usize) -> Result<Requirement, SelectorError> {
    match tokens.get(*pos) {
        Some(Token::Bang) => {
            *pos += 1;
            let key = expect_ident(tokens, pos)?;
            Ok(Requirement { key, op: Operator::DoesNotExist, values: Vec::new() })
        }
        Some(Token::Ident(key)) => {
            let key = key.clone();
            if key.is_empty() {
                return Err(SelectorError::Label("empty label key".into()));
            }
            *pos += 1;
            match tokens.get(*pos) {
                None | Some(Token::Comma) => {
                    Ok(Requirement { key, op: Operator::Exists, values: Vec::new() })
                }
                Some(Token::Eq) => single_value(tokens, pos, key, Operator::Equals),
                Some(Token::DoubleEq) => single_value(tokens, pos, key, Operator::DoubleEquals),
                Some(Token::NotEq) => single_value(tokens, pos, key, Operator::NotEquals),
                Some(Token::Gt) => single_value(tokens, pos, key, Operator::GreaterThan),
                Some(Token::Lt) => single_value(tokens, pos, key, Operator::LessThan),
                Some(Token::Ident(word)) if word == "in" => {
                    *pos += 1;
                    let values = parse_value_set(tokens, pos)?;
                    Ok(Requirement { key, op: Operator::In, values })
                }
                Some(Token::Ident(word)) if word == "notin" => {
                    *pos += 1;
                    let values = parse_value_set(tokens, pos)?;
                    Ok(Requirement { key, op: Operator::NotIn, values })
                }
                Some(t) => Err(SelectorError::Label(format!(
                    "found {}, expected an operator after '{key}'",
                    t.describe()
                ))),
            }
        }
        Some(t) => Err(SelectorError::Label(format!(
            "found {}, expected identifier or '!'",
            t.describe()
        ))),
        None => Err(SelectorError::Label("expected a requirement".into())),
    }
}

fn single_value(
    tokens: &[Token],
    pos: &mut usize,
    key: String,
    op: Operator,
) -> Result<Requirement, SelectorError> {
    *pos += 1;
    let value = match tokens.get(*pos) {
        Some(Token::Ident(v)) => {
            let v = v.clone();
            *pos += 1;
            v
        }
        // `key=` selects the empty value.
        None | Some(Token::Comma) => String::new(),
        Some(t) => {
            return Err(SelectorError::Label(format!(
                "found {}, expected a value for '{key}'",
                t.describe()
            )))
        }
    };
    if matches!(op, Operator::GreaterThan | Operator::LessThan) && value.parse::<i64>().is_err() {
        return Err(SelectorError::Label(format!(
            "value '{value}' for '{key}' must be an integer"
        )));
    }
    Ok(Requirement { key, op, values: vec![value] })
}

fn parse_value_set(tokens: &[Token], pos: &mut usize) -> Result<Vec<String>, SelectorError> {
    if tokens.get(*pos) != Some(&Token::Open) {
        return Err(SelectorError::Label("expected '(' after set operator".into()));
    }
    *pos += 1;
    let mut values = BTreeSet::new();
    let mut expect_value = true;
    loop {
        match tokens.get(*pos) {
            Some(Token::Close) => {
                if expect_value && !values.is_empty() {
                    values.insert(String::new());
                }
                *pos += 1;
                break;
            }
            Some(Token::Comma) => {
                if expect_value {
                    values.insert(String::new());
                }
                expect_value = true;
                *pos += 1;
            }
            Some(Token::Ident(v)) if expect_value => {
                values.insert(v.clone());
                expect_value = false;
                *pos += 1;
            }
            Some(t) => {
                return Err(SelectorError::Label(format!(
                    "found {} inside value set",
                    t.describe()
                )))
            }
            None => return Err(SelectorError::Label("unterminated value set".into())),
        }
    }
    if values.is_empty() {
        return Err(SelectorError::Label(
            "for 'in' and 'notin' operators the value set cannot be empty".into(),
        ));
    }
    Ok(values.into_iter().collect())
}

fn expect_ident(tokens: &[Token], pos: &mut usize) -> Result<String, SelectorError> {
    match tokens.get(*pos) {
        Some(Token::Ident(s)) if !s.is_empty() => {
            let s = s.clone();
            *pos += 1;
            Ok(s)
        }
        Some(t) => Err(SelectorError::Label(format!(
            "found {}, expected identifier after '!'",
            t.describe()
        ))),
        None => Err(SelectorError::Label("expected identifier after '!'".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(key: &str, op: Operator, values: &[&str]) -> Requirement {
        Requirement {
            key: key.into(),
            op,
            values: values.iter().map(|v| (*v).to_string()).collect(),
        }
    }

    #[test]
    fn parses_all_operators() {
        assert_eq!(parse("app=web").unwrap(), vec![req("app", Operator::Equals, &["web"])]);
        assert_eq!(parse("app==web").unwrap(), vec![req("app", Operator::DoubleEquals, &["web"])]);
        assert_eq!(parse("app!=web").unwrap(), vec![req("app", Operator::NotEquals, &["web"])]);
        assert_eq!(parse("env").unwrap(), vec![req("env", Operator::Exists, &[])]);
        assert_eq!(parse("!env").unwrap(), vec![req("env", Operator::DoesNotExist, &[])]);
        assert_eq!(parse("p>5").unwrap(), vec![req("p", Operator::GreaterThan, &["5"])]);
        assert_eq!(parse("p<5").unwrap(), vec![req("p", Operator::LessThan, &["5"])]);
        assert_eq!(
            parse("tier in (web,api)").unwrap(),
            vec![req("tier", Operator::In, &["api", "web"])]
        );
        assert_eq!(
            parse("tier notin (web,api)").unwrap(),
            vec![req("tier", Operator::NotIn, &["api", "web"])]
        );
    }

    #[test]
    fn requirements_sort_by_key_and_values_dedupe() {
        assert_eq!(
            parse("b=2, a = 1, tier in (c,a,c,b)").unwrap(),
            vec![
                req("a", Operator::Equals, &["1"]),
                req("b", Operator::Equals, &["2"]),
                req("tier", Operator::In, &["a", "b", "c"]),
            ]
        );
    }

    #[test]
    fn empty_values_are_selectable() {
        assert_eq!(parse("app=").unwrap(), vec![req("app", Operator::Equals, &[""])]);
        assert_eq!(
            parse("app=,env").unwrap(),
            vec![req("app", Operator::Equals, &[""]), req("env", Operator::Exists, &[])]
        );
    }

    #[test]
    fn whitespace_only_selector_has_no_requirements() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse("   ").unwrap().is_empty());
    }

    #[test]
    fn rejects_malformed_selectors() {
        assert!(parse("app=web,").is_err());
        assert!(parse("=web").is_err());
        assert!(parse("tier in web").is_err());
        assert!(parse("tier in ()").is_err());
        assert!(parse("tier in (a").is_err());
        assert!(parse("!").is_err());
        assert!(parse("p>abc").is_err());
        assert!(parse("a==,b=(").is_err());
    }
}
