//! The declarative query language accepted by the in-memory service.
//!
//! ```text
//! query     := TYPE [ "where" condition { "and" condition } ]
//! condition := ATTRIBUTE "=" literal
//! literal   := "string" | integer | true | false
//! ```
//!
//! The pseudo-attribute `id` matches the server identifier.

use tessera_types::Scalar;

use crate::error::{RemoteError, RemoteResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    pub type_name: String,
    pub criteria: Vec<(String, Scalar)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Word(String),
    Text(String),
    Int(i64),
    Equals,
}

fn tokenize(input: &str) -> RemoteResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '=' {
            chars.next();
            tokens.push(Token::Equals);
        } else if c == '"' {
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(escaped) => text.push(escaped),
                        None => return Err(RemoteError::InvalidQuery("unterminated string".into())),
                    },
                    Some(other) => text.push(other),
                    None => return Err(RemoteError::InvalidQuery("unterminated string".into())),
                }
            }
            tokens.push(Token::Text(text));
        } else if c == '-' || c.is_ascii_digit() {
            let mut digits = String::new();
            while let Some(&d) = chars.peek() {
                if d == '-' || d.is_ascii_digit() {
                    digits.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = digits
                .parse()
                .map_err(|_| RemoteError::InvalidQuery(format!("bad number {digits}")))?;
            tokens.push(Token::Int(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut word = String::new();
            while let Some(&w) = chars.peek() {
                if w.is_alphanumeric() || w == '_' {
                    word.push(w);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Word(word));
        } else {
            return Err(RemoteError::InvalidQuery(format!("unexpected character {c:?}")));
        }
    }
    Ok(tokens)
}

pub fn parse_query(input: &str) -> RemoteResult<Query> {
    let tokens = tokenize(input)?;
    let mut tokens = tokens.into_iter();
    let type_name = match tokens.next() {
        Some(Token::Word(name)) => name,
        _ => return Err(RemoteError::InvalidQuery("expected a type name".into())),
    };
    let mut criteria = Vec::new();
    match tokens.next() {
        None => return Ok(Query { type_name, criteria }),
        Some(Token::Word(w)) if w.eq_ignore_ascii_case("where") => {}
        Some(other) => {
            return Err(RemoteError::InvalidQuery(format!("expected `where`, found {other:?}")))
        }
    }
    loop {
        let attribute = match tokens.next() {
            Some(Token::Word(name)) => name,
            _ => return Err(RemoteError::InvalidQuery("expected an attribute".into())),
        };
        if tokens.next() != Some(Token::Equals) {
            return Err(RemoteError::InvalidQuery(format!("expected `=` after {attribute}")));
        }
        let literal = match tokens.next() {
            Some(Token::Text(s)) => Scalar::Text(s),
            Some(Token::Int(i)) => Scalar::Int(i),
            Some(Token::Word(w)) if w == "true" => Scalar::Bool(true),
            Some(Token::Word(w)) if w == "false" => Scalar::Bool(false),
            _ => return Err(RemoteError::InvalidQuery(format!("expected a literal for {attribute}"))),
        };
        criteria.push((attribute, literal));
        match tokens.next() {
            None => break,
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("and") => continue,
            Some(other) => {
                return Err(RemoteError::InvalidQuery(format!("expected `and`, found {other:?}")))
            }
        }
    }
    Ok(Query { type_name, criteria })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_type() {
        let q = parse_query("Person").unwrap();
        assert_eq!(q.type_name, "Person");
        assert!(q.criteria.is_empty());
    }

    #[test]
    fn conditions() {
        let q = parse_query(r#"Account where number = "ACC-001" and active = true and id = 4"#).unwrap();
        assert_eq!(
            q.criteria,
            vec![
                ("number".to_string(), Scalar::Text("ACC-001".into())),
                ("active".to_string(), Scalar::Bool(true)),
                ("id".to_string(), Scalar::Int(4)),
            ]
        );
    }

    #[test]
    fn escaped_quotes() {
        let q = parse_query(r#"Site where name = "The \"Lab\"""#).unwrap();
        assert_eq!(q.criteria[0].1, Scalar::Text("The \"Lab\"".into()));
    }

    #[test]
    fn malformed_queries() {
        for bad in ["", "Person name = 1", "Person where name", "Person where name = ", "Person where a = 1 or b = 2", "Person where a = \"x"] {
            assert!(
                matches!(parse_query(bad), Err(RemoteError::InvalidQuery(_))),
                "accepted {bad:?}"
            );
        }
    }
}
