use crate::error::{ExprError, ParseErrorKind};
use crate::symbol::{SymbolEntry, SymbolTable};
use crate::tree::{Func, Operator, Value};

#[derive(Clone, Debug)]
pub(crate) enum Token {
    Value(Value),
    Op(Operator),
    Func { func: Func, name: String },
    LParen,
    RParen,
}

impl Token {
    /// A following `+`/`-` is binary after a value or a closing bracket.
    fn ends_operand(&self) -> bool {
        matches!(self, Token::Value(_) | Token::RParen)
    }
}

pub(crate) struct Lexer<'a> {
    src: &'a [u8],
    i: usize,
    symbols: &'a SymbolTable,
    prev: Option<Token>,
}

impl<'a> Lexer<'a> {
    pub(crate) fn new(s: &'a str, symbols: &'a SymbolTable) -> Self {
        Self {
            src: s.as_bytes(),
            i: 0,
            symbols,
            prev: None,
        }
    }

    /// Tokenizes the whole input.
    pub(crate) fn tokenize(mut self) -> Result<Vec<Token>, ExprError> {
        let mut out = Vec::new();
        while let Some(tok) = self.next_token()? {
            self.prev = Some(tok.clone());
            out.push(tok);
        }
        Ok(out)
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.i).copied()
    }
    fn bump(&mut self) -> Option<u8> {
        let ch = self.src.get(self.i).copied();
        if ch.is_some() {
            self.i += 1;
        }
        ch
    }
    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_ascii_whitespace() {
                self.i += 1;
            } else {
                break;
            }
        }
    }
    fn after_operand(&self) -> bool {
        self.prev.as_ref().is_some_and(Token::ends_operand)
    }
    fn next_token(&mut self) -> Result<Option<Token>, ExprError> {
        self.skip_ws();
        let c = match self.peek() {
            Some(c) => c,
            None => return Ok(None),
        };
        let tok = match c {
            b'(' => {
                self.bump();
                Token::LParen
            }
            b')' => {
                self.bump();
                Token::RParen
            }
            b'+' => {
                self.bump();
                if self.after_operand() {
                    Token::Op(Operator::Add)
                } else {
                    Token::Op(Operator::Plus)
                }
            }
            b'-' => {
                self.bump();
                if self.after_operand() {
                    Token::Op(Operator::Sub)
                } else {
                    Token::Op(Operator::Neg)
                }
            }
            b'*' => {
                self.bump();
                Token::Op(Operator::Mul)
            }
            b'/' => {
                self.bump();
                Token::Op(Operator::Div)
            }
            b'^' => {
                self.bump();
                Token::Op(Operator::Pow)
            }
            b',' => {
                self.bump();
                Token::Op(Operator::Comma)
            }
            b'=' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    Token::Op(Operator::Eq)
                } else if matches!(
                    self.prev,
                    Some(Token::Value(Value::Var(_) | Value::Input(_)))
                ) {
                    Token::Op(Operator::Assign)
                } else {
                    return Err(ExprError::parse(
                        ParseErrorKind::InvalidAssignTarget,
                        format!("'=' at {} does not follow a variable or input", self.i - 1),
                    ));
                }
            }
            b'!' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    Token::Op(Operator::Ne)
                } else {
                    return Err(ExprError::parse(
                        ParseErrorKind::UnknownToken,
                        format!("expected '=' after '!' at {}", self.i - 1),
                    ));
                }
            }
            b'<' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    Token::Op(Operator::Le)
                } else {
                    Token::Op(Operator::Lt)
                }
            }
            b'>' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    Token::Op(Operator::Ge)
                } else {
                    Token::Op(Operator::Gt)
                }
            }
            c if c.is_ascii_digit() || c == b'.' => self.lex_number()?,
            _ => self.lex_ident()?,
        };
        Ok(Some(tok))
    }
    fn lex_number(&mut self) -> Result<Token, ExprError> {
        let start = self.i;
        let mut seen_dot = false;
        let mut seen_exp = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.i += 1;
            } else if c == b'.' && !seen_dot && !seen_exp {
                seen_dot = true;
                self.i += 1;
            } else if (c == b'e' || c == b'E') && !seen_exp {
                seen_exp = true;
                self.i += 1;
                if let Some(sign) = self.peek() {
                    if sign == b'+' || sign == b'-' {
                        self.i += 1;
                    }
                }
                while let Some(d) = self.peek() {
                    if d.is_ascii_digit() {
                        self.i += 1;
                    } else {
                        break;
                    }
                }
            } else {
                break;
            }
        }
        let s = String::from_utf8_lossy(&self.src[start..self.i]);
        let v: f64 = s.parse().map_err(|e| {
            ExprError::parse(
                ParseErrorKind::UnknownToken,
                format!("invalid number '{}': {}", s, e),
            )
        })?;
        Ok(Token::Value(Value::Const(v)))
    }
    fn lex_ident(&mut self) -> Result<Token, ExprError> {
        let start = self.i;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.i += 1;
            } else {
                break;
            }
        }
        if self.i == start {
            let ch = self.src[start] as char;
            return Err(ExprError::parse(
                ParseErrorKind::UnknownToken,
                format!("unexpected character '{}' at {}", ch, start),
            ));
        }
        let name = String::from_utf8_lossy(&self.src[start..self.i]).into_owned();
        let entry = self.symbols.find(&name).ok_or_else(|| {
            ExprError::parse(
                ParseErrorKind::UndefinedSymbol,
                format!("undefined symbol '{}'", name),
            )
        })?;
        Ok(match entry {
            SymbolEntry::Constant(v) => Token::Value(Value::Const(*v)),
            SymbolEntry::Variable(var) => Token::Value(Value::Var(var.clone())),
            SymbolEntry::Input(i) => Token::Value(Value::Input(*i)),
            SymbolEntry::Function(f) => Token::Func {
                func: Func::Native(*f),
                name,
            },
            SymbolEntry::FuncSymbol(s) => Token::Func {
                func: Func::Symbol(*s),
                name,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str, t: &SymbolTable) -> Vec<String> {
        Lexer::new(src, t)
            .tokenize()
            .unwrap()
            .iter()
            .map(|tok| match tok {
                Token::Value(_) => "v".to_string(),
                Token::Op(op) => format!("{:?}", op),
                Token::Func { name, .. } => name.clone(),
                Token::LParen => "(".into(),
                Token::RParen => ")".into(),
            })
            .collect()
    }

    #[test]
    fn sign_is_unary_at_operand_position() {
        let mut t = SymbolTable::new();
        t.define_input("x", 0);
        assert_eq!(kinds("-x - -1", &t), ["Neg", "v", "Sub", "Neg", "v"]);
        assert_eq!(kinds("(x)+x", &t), ["(", "v", ")", "Add", "v"]);
        assert_eq!(kinds("sin(-x)", &t), ["sin", "(", "Neg", "v", ")"]);
    }

    #[test]
    fn assignment_needs_assignable_left() {
        let mut t = SymbolTable::new();
        t.define_input("x", 0).define_const("k", 1.0);
        assert_eq!(kinds("x = 2", &t), ["v", "Assign", "v"]);
        let err = Lexer::new("k = 2", &t).tokenize().unwrap_err();
        assert_eq!(err.parse_kind(), Some(ParseErrorKind::InvalidAssignTarget));
    }

    #[test]
    fn bang_requires_equals() {
        let t = SymbolTable::new();
        let err = Lexer::new("1 ! 2", &t).tokenize().unwrap_err();
        assert_eq!(err.parse_kind(), Some(ParseErrorKind::UnknownToken));
    }
}
