//! The policy DSL parser.
//!
//! Line-oriented: every non-blank, non-`#` line is one rule, a verb
//! followed by an optional condition expression.
//!
//! ```text
//! require :authenticated
//! deny context.banned == true
//! allow context.role in ["admin", "operator"] and present(resource.id)
//! deny environment.load > 0.9
//! allow
//! ```

use crate::ast::{CompareOp, Condition, Path, PathRoot, Rule, RuleVerb, Value};
use crate::error::PolicyError;

/// Maximum condition nesting accepted by the parser.
const MAX_NESTING: usize = 100;

/// Parse DSL source into ordered rules.
///
/// # Errors
///
/// Returns [`PolicyError::Parse`] with a line number on the first
/// malformed rule.
pub fn parse_rules(source: &str) -> Result<Vec<Rule>, PolicyError> {
    let mut rules = Vec::new();
    for (index, raw_line) in source.lines().enumerate() {
        let line_no = index.saturating_add(1);
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        rules.push(parse_line(line, line_no)?);
    }
    Ok(rules)
}

fn parse_line(line: &str, line_no: usize) -> Result<Rule, PolicyError> {
    let tokens = lex(line, line_no)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        line: line_no,
    };

    let verb = match parser.next_ident()?.as_str() {
        "require" => RuleVerb::Require,
        "allow" => RuleVerb::Allow,
        "deny" => RuleVerb::Deny,
        other => {
            return Err(parser.error(format!("expected require/allow/deny, found `{other}`")));
        },
    };

    let condition = if parser.at_end() {
        Condition::True
    } else {
        let condition = parser.or_expr(0)?;
        if !parser.at_end() {
            return Err(parser.error("trailing tokens after condition"));
        }
        condition
    };

    Ok(Rule { verb, condition })
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Symbol(String),
    Str(String),
    Num(f64),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Op(&'static str),
}

fn lex(line: &str, line_no: usize) -> Result<Vec<Token>, PolicyError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            },
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            },
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            },
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            },
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            },
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            },
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            },
            '=' | '!' | '<' | '>' => {
                chars.next();
                let eq = chars.peek() == Some(&'=');
                if eq {
                    chars.next();
                }
                let op = match (c, eq) {
                    ('=', true) => "==",
                    ('!', true) => "!=",
                    ('<', true) => "<=",
                    ('>', true) => ">=",
                    ('<', false) => "<",
                    ('>', false) => ">",
                    _ => {
                        return Err(PolicyError::Parse {
                            line: line_no,
                            message: format!("unexpected character `{c}`"),
                        });
                    },
                };
                tokens.push(Token::Op(op));
            },
            '"' => {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == '"' {
                        closed = true;
                        break;
                    }
                    text.push(next);
                }
                if !closed {
                    return Err(PolicyError::Parse {
                        line: line_no,
                        message: "unterminated string literal".to_string(),
                    });
                }
                tokens.push(Token::Str(text));
            },
            ':' => {
                chars.next();
                let name = take_ident(&mut chars);
                if name.is_empty() {
                    return Err(PolicyError::Parse {
                        line: line_no,
                        message: "expected a name after `:`".to_string(),
                    });
                }
                tokens.push(Token::Symbol(name));
            },
            c if c.is_ascii_digit() || c == '-' => {
                let mut text = String::new();
                if c == '-' {
                    text.push(c);
                    chars.next();
                }
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number: f64 = text.parse().map_err(|_| PolicyError::Parse {
                    line: line_no,
                    message: format!("invalid number `{text}`"),
                })?;
                tokens.push(Token::Num(number));
            },
            c if c.is_ascii_alphabetic() || c == '_' => {
                tokens.push(Token::Ident(take_ident(&mut chars)));
            },
            other => {
                return Err(PolicyError::Parse {
                    line: line_no,
                    message: format!("unexpected character `{other}`"),
                });
            },
        }
    }
    Ok(tokens)
}

fn take_ident(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut out = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
            chars.next();
        } else {
            break;
        }
    }
    out
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    line: usize,
}

impl Parser {
    fn error(&self, message: impl Into<String>) -> PolicyError {
        PolicyError::Parse {
            line: self.line,
            message: message.into(),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, PolicyError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| self.error("unexpected end of line"))?;
        self.pos = self.pos.saturating_add(1);
        Ok(token)
    }

    fn next_ident(&mut self) -> Result<String, PolicyError> {
        match self.next()? {
            Token::Ident(name) => Ok(name),
            other => Err(self.error(format!("expected identifier, found {other:?}"))),
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), PolicyError> {
        let token = self.next()?;
        if &token == expected {
            Ok(())
        } else {
            Err(self.error(format!("expected {expected:?}, found {token:?}")))
        }
    }

    fn or_expr(&mut self, depth: usize) -> Result<Condition, PolicyError> {
        self.check_depth(depth)?;
        let mut terms = vec![self.and_expr(depth.saturating_add(1))?];
        while matches!(self.peek(), Some(Token::Ident(word)) if word == "or") {
            self.pos = self.pos.saturating_add(1);
            terms.push(self.and_expr(depth.saturating_add(1))?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Condition::Or(terms)
        })
    }

    fn and_expr(&mut self, depth: usize) -> Result<Condition, PolicyError> {
        self.check_depth(depth)?;
        let mut terms = vec![self.unary(depth.saturating_add(1))?];
        while matches!(self.peek(), Some(Token::Ident(word)) if word == "and") {
            self.pos = self.pos.saturating_add(1);
            terms.push(self.unary(depth.saturating_add(1))?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Condition::And(terms)
        })
    }

    fn unary(&mut self, depth: usize) -> Result<Condition, PolicyError> {
        self.check_depth(depth)?;
        if matches!(self.peek(), Some(Token::Ident(word)) if word == "not") {
            self.pos = self.pos.saturating_add(1);
            return Ok(Condition::Not(Box::new(self.unary(depth.saturating_add(1))?)));
        }
        self.primary(depth)
    }

    fn primary(&mut self, depth: usize) -> Result<Condition, PolicyError> {
        self.check_depth(depth)?;
        match self.next()? {
            Token::LParen => {
                let inner = self.or_expr(depth.saturating_add(1))?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            },
            Token::Symbol(name) => Ok(Condition::Flag(name)),
            Token::Ident(word) => match word.as_str() {
                "true" => Ok(Condition::True),
                "false" => Ok(Condition::Not(Box::new(Condition::True))),
                "present" => {
                    self.expect(&Token::LParen)?;
                    let path = self.path()?;
                    self.expect(&Token::RParen)?;
                    Ok(Condition::Present(path))
                },
                "blank" => {
                    self.expect(&Token::LParen)?;
                    let path = self.path()?;
                    self.expect(&Token::RParen)?;
                    Ok(Condition::Blank(path))
                },
                "role" => {
                    self.expect(&Token::LParen)?;
                    let name = match self.next()? {
                        Token::Str(s) => s,
                        other => {
                            return Err(self.error(format!("expected role string, found {other:?}")));
                        },
                    };
                    self.expect(&Token::RParen)?;
                    Ok(Condition::Role(name))
                },
                root @ ("context" | "resource" | "action" | "environment") => {
                    let path = self.path_from_root(root)?;
                    self.comparison(path)
                },
                other => Err(self.error(format!("unknown term `{other}`"))),
            },
            other => Err(self.error(format!("unexpected token {other:?}"))),
        }
    }

    fn comparison(&mut self, path: Path) -> Result<Condition, PolicyError> {
        match self.next()? {
            Token::Op(op) => {
                let op = match op {
                    "==" => CompareOp::Eq,
                    "!=" => CompareOp::Neq,
                    ">" => CompareOp::Gt,
                    ">=" => CompareOp::Gte,
                    "<" => CompareOp::Lt,
                    "<=" => CompareOp::Lte,
                    _ => return Err(self.error(format!("unknown operator `{op}`"))),
                };
                let value = self.value()?;
                Ok(Condition::Compare { path, op, value })
            },
            Token::Ident(word) if word == "in" => {
                self.expect(&Token::LBracket)?;
                let mut values = vec![self.value()?];
                while self.peek() == Some(&Token::Comma) {
                    self.pos = self.pos.saturating_add(1);
                    values.push(self.value()?);
                }
                self.expect(&Token::RBracket)?;
                Ok(Condition::In { path, values })
            },
            other => Err(self.error(format!(
                "expected comparison or `in` after path, found {other:?}"
            ))),
        }
    }

    fn value(&mut self) -> Result<Value, PolicyError> {
        match self.next()? {
            Token::Str(s) => Ok(Value::String(s)),
            Token::Num(n) => Ok(Value::Number(n)),
            Token::Ident(word) if word == "true" => Ok(Value::Bool(true)),
            Token::Ident(word) if word == "false" => Ok(Value::Bool(false)),
            other => Err(self.error(format!("expected literal, found {other:?}"))),
        }
    }

    fn path(&mut self) -> Result<Path, PolicyError> {
        let root = self.next_ident()?;
        self.path_from_root(&root)
    }

    fn path_from_root(&mut self, root: &str) -> Result<Path, PolicyError> {
        let root = match root {
            "context" => PathRoot::Context,
            "resource" => PathRoot::Resource,
            "action" => PathRoot::Action,
            "environment" => PathRoot::Environment,
            other => {
                return Err(self.error(format!(
                    "paths start with context/resource/action/environment, found `{other}`"
                )));
            },
        };
        let mut segments = Vec::new();
        while self.peek() == Some(&Token::Dot) {
            self.pos = self.pos.saturating_add(1);
            segments.push(self.next_ident()?);
        }
        Ok(Path { root, segments })
    }

    fn check_depth(&self, depth: usize) -> Result<(), PolicyError> {
        if depth > MAX_NESTING {
            Err(self.error("condition nesting too deep"))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_verbs() {
        let rules = parse_rules("allow\ndeny").unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].verb, RuleVerb::Allow);
        assert_eq!(rules[0].condition, Condition::True);
        assert_eq!(rules[1].verb, RuleVerb::Deny);
    }

    #[test]
    fn test_flag_rule() {
        let rules = parse_rules("require :authenticated\nallow").unwrap();
        assert_eq!(rules[0].verb, RuleVerb::Require);
        assert_eq!(
            rules[0].condition,
            Condition::Flag("authenticated".to_string())
        );
    }

    #[test]
    fn test_comparison_rule() {
        let rules = parse_rules("deny context.banned == true").unwrap();
        let Condition::Compare { path, op, value } = &rules[0].condition else {
            panic!("expected comparison");
        };
        assert_eq!(path.to_string(), "context.banned");
        assert_eq!(*op, CompareOp::Eq);
        assert_eq!(*value, Value::Bool(true));
    }

    #[test]
    fn test_in_and_boolean_operators() {
        let rules = parse_rules(
            "allow context.role in [\"admin\", \"operator\"] and present(resource.id)",
        )
        .unwrap();
        let Condition::And(terms) = &rules[0].condition else {
            panic!("expected and");
        };
        assert_eq!(terms.len(), 2);
        assert!(matches!(terms[0], Condition::In { .. }));
        assert!(matches!(terms[1], Condition::Present(_)));
    }

    #[test]
    fn test_not_and_parens() {
        let rules = parse_rules("deny not (context.age >= 18 or :trusted)").unwrap();
        assert!(matches!(rules[0].condition, Condition::Not(_)));
    }

    #[test]
    fn test_role_and_numbers() {
        let rules = parse_rules("allow role(\"admin\") or environment.load < 0.5").unwrap();
        let Condition::Or(terms) = &rules[0].condition else {
            panic!("expected or");
        };
        assert_eq!(terms[0], Condition::Role("admin".to_string()));
    }

    #[test]
    fn test_comments_and_blanks_skipped() {
        let rules = parse_rules("# header\n\nallow\n# tail\n").unwrap();
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn test_parse_errors_carry_line() {
        let err = parse_rules("allow\npermit :x").unwrap_err();
        assert!(matches!(err, PolicyError::Parse { line: 2, .. }));

        let err = parse_rules("deny context.x ==").unwrap_err();
        assert_eq!(err.kind(), "parse_error");

        let err = parse_rules("deny \"unterminated").unwrap_err();
        assert_eq!(err.kind(), "parse_error");
    }

    #[test]
    fn test_bare_path_is_rejected() {
        assert!(parse_rules("allow context.thing").is_err());
    }

    #[test]
    fn test_deep_nesting_rejected() {
        let nested = format!("allow {}:x", "not ".repeat(200));
        let err = parse_rules(&nested).unwrap_err();
        assert_eq!(err.kind(), "parse_error");
    }
}
