//! Reader and writer for the parenthesised data syntax every file format in
//! the pipeline is written in: lexicon entries, alignment files, decision
//! trees, regular grammars and the body of WFST files. This is not a scheme
//! interpreter, it only reads nested lists of atoms - which is all those
//! formats need.
//!
//! Atoms are integers, floats, double-quoted strings or bare symbols. Unlike
//! a split-on-whitespace tokenizer the scanner here keeps quoted strings
//! intact, so `( "b c" )` is a one element list.
use crate::error::LtsError;
use std::collections::VecDeque;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    /// A double-quoted string. The quotes are stripped on read and restored
    /// on write.
    Str(String),
    Sym(String),
    List(Vec<Value>),
}

impl Value {
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Symbol or string contents, the two atom kinds that name things.
    pub fn text(&self) -> Option<&str> {
        match self {
            Value::Sym(s) | Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Any atom rendered back to its token text. Numeric atoms come out the
    /// way `Display` writes them, so `0` stays `0` when a letter value in a
    /// tree condition happens to be the padding token.
    pub fn atom_text(&self) -> Option<String> {
        match self {
            Value::List(_) => None,
            Value::Sym(s) | Value::Str(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            // Keep a decimal point on round floats so rereading the text
            // yields a float again.
            Value::Float(x) if x.fract() == 0.0 && x.is_finite() => write!(f, "{:.1}", x),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "\"{}\"", s),
            Value::Sym(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}

enum Token {
    Open,
    Close,
    Atom(String),
    Quoted(String),
}

fn tokenize(input: &str) -> Result<VecDeque<Token>, LtsError> {
    let mut tokens = VecDeque::new();
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '(' => tokens.push_back(Token::Open),
            ')' => tokens.push_back(Token::Close),
            c if c.is_whitespace() => {}
            '"' => {
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(c) => s.push(c),
                        None => {
                            return Err(LtsError::MalformedInput(
                                "unterminated string literal".into(),
                            ))
                        }
                    }
                }
                tokens.push_back(Token::Quoted(s));
            }
            c => {
                let mut s = String::from(c);
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || next == '(' || next == ')' || next == '"' {
                        break;
                    }
                    s.push(next);
                    chars.next();
                }
                tokens.push_back(Token::Atom(s));
            }
        }
    }
    Ok(tokens)
}

fn atom(token: String) -> Value {
    if let Ok(i) = token.parse::<i64>() {
        Value::Int(i)
    } else if let Ok(f) = token.parse::<f64>() {
        Value::Float(f)
    } else {
        Value::Sym(token)
    }
}

fn read_from_tokens(tokens: &mut VecDeque<Token>) -> Result<Value, LtsError> {
    match tokens.pop_front() {
        None => Err(LtsError::MalformedInput(
            "unexpected end of input while reading".into(),
        )),
        Some(Token::Open) => {
            let mut items = Vec::new();
            loop {
                match tokens.front() {
                    None => {
                        return Err(LtsError::MalformedInput(
                            "unbalanced parentheses: missing )".into(),
                        ))
                    }
                    Some(Token::Close) => {
                        tokens.pop_front();
                        return Ok(Value::List(items));
                    }
                    Some(_) => items.push(read_from_tokens(tokens)?),
                }
            }
        }
        Some(Token::Close) => Err(LtsError::MalformedInput("unexpected )".into())),
        Some(Token::Atom(s)) => Ok(atom(s)),
        Some(Token::Quoted(s)) => Ok(Value::Str(s)),
    }
}

/// Reads exactly one expression from `input`. Empty input, unbalanced
/// parentheses and trailing data are all malformed.
pub fn parse(input: &str) -> Result<Value, LtsError> {
    let mut tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(LtsError::MalformedInput("empty input".into()));
    }
    let value = read_from_tokens(&mut tokens)?;
    if !tokens.is_empty() {
        return Err(LtsError::MalformedInput(
            "trailing data after expression".into(),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(s: &str) -> Value {
        Value::Sym(s.to_string())
    }

    #[test]
    fn mixed_atoms() {
        let parsed = parse(r#"(a "b c" 3 (d 4.5))"#).unwrap();
        assert_eq!(
            parsed,
            Value::List(vec![
                sym("a"),
                Value::Str("b c".into()),
                Value::Int(3),
                Value::List(vec![sym("d"), Value::Float(4.5)]),
            ])
        );
    }

    #[test]
    fn bare_atom_and_nesting() {
        assert_eq!(parse("42").unwrap(), Value::Int(42));
        assert_eq!(parse("(())").unwrap(), Value::List(vec![Value::List(vec![])]));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse("").is_err());
        assert!(parse("   ").is_err());
        assert!(parse("(a (b)").is_err());
        assert!(parse("(a)) ").is_err());
        assert!(parse(")").is_err());
        assert!(parse("(\"unterminated)").is_err());
        assert!(parse("(a) (b)").is_err());
    }

    #[test]
    fn display_round_trips() {
        let input = r#"(x ("quoted str" 1 2.5) nil)"#;
        let parsed = parse(input).unwrap();
        assert_eq!(parse(&parsed.to_string()).unwrap(), parsed);
        // Round floats keep their decimal point through a reread
        let v = Value::Float(1.0);
        assert_eq!(parse(&v.to_string()).unwrap(), v);
    }

    #[test]
    fn atom_text_preserves_tokens() {
        assert_eq!(parse("0").unwrap().atom_text().as_deref(), Some("0"));
        assert_eq!(parse("nil").unwrap().atom_text().as_deref(), Some("nil"));
        assert_eq!(parse("\"w\"").unwrap().atom_text().as_deref(), Some("w"));
        assert_eq!(parse("(a)").unwrap().atom_text(), None);
    }
}
