//! The reader turns source text into values, stamping every produced node
//! with the location of its first character. Lists are cons chains stamped
//! with the opening paren; `'`/`` ` ``/`,` expand to `quote`, `quasiquote`
//! and `unquote` forms.

use crate::error::{Error, ErrorKind, Result, SourceLoc};
use crate::state::State;
use crate::value::Value;

fn is_delim(c: u8) -> bool {
    c.is_ascii_whitespace() || matches!(c, b'(' | b')' | b'\'' | b'"' | b';' | b'`' | b',')
}

struct Reader<'a> {
    state: &'a mut State,
    bytes: &'a [u8],
    src: &'a str,
    name: &'a str,
    pos: usize,
    line: usize,
    col: usize,
}

impl<'a> Reader<'a> {
    fn new(state: &'a mut State, src: &'a str, name: &'a str) -> Reader<'a> {
        Reader {
            state,
            bytes: src.as_bytes(),
            src,
            name,
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn here(&self) -> SourceLoc {
        SourceLoc {
            file: self.name.to_string(),
            line: self.line,
            col: self.col,
            label: String::new(),
        }
    }

    fn skip_ws_and_comments(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_ascii_whitespace() {
                self.advance();
            } else if c == b';' {
                while let Some(c) = self.peek() {
                    if c == b'\n' {
                        break;
                    }
                    self.advance();
                }
            } else {
                break;
            }
        }
    }

    /// Parse the next form; nil at end of input.
    fn next_form(&mut self) -> Result<Value> {
        self.skip_ws_and_comments();
        let Some(c) = self.peek() else {
            return Ok(Value::nil());
        };
        match c {
            b')' => Err(Error::at(ErrorKind::UnexpectedClose, self.here())),
            b'(' => self.read_list(),
            b'\'' => self.read_prefixed("quote"),
            b'`' => self.read_prefixed("quasiquote"),
            b',' => self.read_prefixed("unquote"),
            b'"' => self.read_string(),
            _ => self.read_atom(),
        }
    }

    fn read_list(&mut self) -> Result<Value> {
        let open = self.here();
        self.advance();
        let mut items: Vec<Value> = Vec::new();
        let mut tail = Value::nil();
        loop {
            self.skip_ws_and_comments();
            match self.peek() {
                None => return Err(Error::at(ErrorKind::UnterminatedList, open)),
                Some(b')') => {
                    self.advance();
                    break;
                }
                _ => {}
            }
            let e = self.next_form()?;
            if e.is_symbol_named(".") {
                self.skip_ws_and_comments();
                if self.peek().is_none() {
                    return Err(Error::at(ErrorKind::EofAfterDot, open));
                }
                tail = self.next_form()?;
                self.skip_ws_and_comments();
                if self.peek() != Some(b')') {
                    return Err(Error::at(ErrorKind::UnclosedDottedTail, open));
                }
                self.advance();
                break;
            }
            items.push(e);
        }
        let mut head = tail;
        for item in items.into_iter().rev() {
            head = self.state.make_pair(item, head);
            self.state
                .set_source_loc(&head, self.name, open.line, open.col);
        }
        Ok(head)
    }

    fn read_prefixed(&mut self, expansion: &str) -> Result<Value> {
        let at = self.here();
        self.advance();
        let inner = self.next_form()?;
        let sym = self.state.make_symbol(expansion);
        let res = self.state.list_of([sym, inner]);
        self.state.set_source_loc(&res, self.name, at.line, at.col);
        Ok(res)
    }

    fn read_string(&mut self) -> Result<Value> {
        let at = self.here();
        self.advance();
        let mut out: Vec<u8> = Vec::new();
        loop {
            match self.peek() {
                None => return Err(Error::at(ErrorKind::UnterminatedString, at)),
                Some(b'"') => break,
                Some(b'\\') if self.pos + 1 < self.bytes.len() => {
                    self.advance();
                    let esc = self.peek().unwrap_or(b'\\');
                    out.push(match esc {
                        b'n' => b'\n',
                        b't' => b'\t',
                        b'r' => b'\r',
                        other => other,
                    });
                    self.advance();
                }
                Some(c) => {
                    out.push(c);
                    self.advance();
                }
            }
        }
        self.advance();
        let text = String::from_utf8_lossy(&out).into_owned();
        let v = self.state.make_string(&text);
        self.state.set_source_loc(&v, self.name, at.line, at.col);
        Ok(v)
    }

    fn read_atom(&mut self) -> Result<Value> {
        let at = self.here();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if is_delim(c) {
                break;
            }
            self.advance();
        }
        let tok = &self.src[start..self.pos];
        if let Ok(n) = tok.parse::<f64>() {
            let v = Value::number(n);
            self.state.set_source_loc(&v, self.name, at.line, at.col);
            return Ok(v);
        }
        if tok == "nil" {
            return Ok(Value::nil());
        }
        let v = self.state.make_symbol(tok);
        self.state.set_source_loc(&v, self.name, at.line, at.col);
        Ok(v)
    }

    fn at_eof(&mut self) -> bool {
        self.skip_ws_and_comments();
        self.peek().is_none()
    }
}

impl State {
    /// Parse the first form of `src`; nil when the input holds none.
    pub fn parse(&mut self, src: &str, name: &str) -> Result<Value> {
        self.sources.insert(name.to_string(), src.to_string());
        let mut r = Reader::new(self, src, name);
        r.next_form()
    }

    /// Parse every top-level form of `src`, returned as a list in source
    /// order.
    pub fn parse_all(&mut self, src: &str, name: &str) -> Result<Value> {
        self.sources.insert(name.to_string(), src.to_string());
        let mut forms = Vec::new();
        {
            let mut r = Reader::new(self, src, name);
            while !r.at_eof() {
                let form = r.next_form()?;
                forms.push(form);
            }
        }
        Ok(self.list_of(forms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Type;

    fn parse_one(src: &str) -> (State, Value) {
        let mut s = State::new();
        let v = s.parse(src, "test.lisp").unwrap();
        (s, v)
    }

    #[test]
    fn atoms() {
        let (_, v) = parse_one("42");
        assert_eq!(v.as_number(), 42.0);
        let (_, v) = parse_one("-1.5e3");
        assert_eq!(v.as_number(), -1500.0);
        let (_, v) = parse_one("nil");
        assert!(v.is_nil());
        let (_, v) = parse_one("foo-bar");
        assert_eq!(v.symbol_name(), Some("foo-bar"));
    }

    #[test]
    fn proper_list() {
        let (_, v) = parse_one("(a b c)");
        assert_eq!(v.render(), "(a b c)");
    }

    #[test]
    fn dotted_pair() {
        let (_, v) = parse_one("(a b . c)");
        assert_eq!(v.render(), "(a b . c)");
        assert_eq!(v.cdr().cdr().symbol_name(), Some("c"));
    }

    #[test]
    fn junk_after_dotted_tail_is_an_error() {
        let mut s = State::new();
        let err = s.parse("(a . b c)", "t").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnclosedDottedTail));
    }

    #[test]
    fn quote_sugar() {
        let (_, v) = parse_one("'x");
        assert_eq!(v.render(), "(quote x)");
        let (_, v) = parse_one("`(a ,b)");
        assert_eq!(v.render(), "(quasiquote (a (unquote b)))");
    }

    #[test]
    fn string_escapes() {
        let (_, v) = parse_one(r#""a\tb\n\"q\\z""#);
        assert_eq!(v.string_value(), Some("a\tb\n\"q\\z"));
        // Unknown escapes collapse to the escaped character.
        let (_, v) = parse_one(r#""\x""#);
        assert_eq!(v.string_value(), Some("x"));
    }

    #[test]
    fn comments_are_skipped() {
        let (_, v) = parse_one("; header\n(a) ; trailing");
        assert_eq!(v.render(), "(a)");
    }

    #[test]
    fn unexpected_close_carries_location() {
        let mut s = State::new();
        let err = s.parse("\n  )", "t.lisp").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnexpectedClose));
        let loc = err.loc.unwrap();
        assert_eq!((loc.line, loc.col), (2, 3));
    }

    #[test]
    fn unterminated_constructs() {
        let mut s = State::new();
        assert!(matches!(
            s.parse("(a b", "t").unwrap_err().kind,
            ErrorKind::UnterminatedList
        ));
        assert!(matches!(
            s.parse("\"abc", "t").unwrap_err().kind,
            ErrorKind::UnterminatedString
        ));
        assert!(matches!(
            s.parse("(a .", "t").unwrap_err().kind,
            ErrorKind::EofAfterDot
        ));
    }

    #[test]
    fn parse_all_returns_forms_in_order() {
        let mut s = State::new();
        let forms = s.parse_all("1 2 3\n", "t").unwrap();
        assert_eq!(forms.render(), "(1 2 3)");
        let empty = s.parse_all("  ; nothing\n", "t").unwrap();
        assert!(empty.is_nil());
    }

    #[test]
    fn produced_values_have_locations() {
        let mut s = State::new();
        let v = s.parse("(foo 1)", "loc.lisp").unwrap();
        let loc = s.source_loc_of(&v).unwrap();
        assert_eq!((loc.line, loc.col), (1, 1));
        assert_eq!(v.kind(), Type::Pair);
        let sym = v.car();
        let loc = s.source_loc_of(&sym).unwrap();
        assert_eq!((loc.line, loc.col), (1, 2));
    }
}
