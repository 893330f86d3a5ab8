//! Tokenizer for cell source, including indentation tracking.

use super::ParseError;

pub const KEYWORDS: &[&str] = &[
    "and", "as", "break", "continue", "def", "elif", "else", "for", "from", "global", "if",
    "import", "in", "lambda", "nonlocal", "not", "or", "pass", "return", "while", "True",
    "False", "None",
];

// Longest first so `**=` wins over `**` and `*`.
const OPERATORS: &[&str] = &[
    "**=", "//=", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "+", "-", "*",
    "/", "%", "<", ">", "=", "(", ")", "[", "]", ",", ":", ".", ";",
];

const TAB_WIDTH: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Keyword(&'static str),
    Int(i64),
    Float(f64),
    Str(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    brackets: usize,
    indents: Vec<usize>,
    tokens: Vec<Token>,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            brackets: 0,
            indents: vec![0],
            tokens: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Vec<Token>, ParseError> {
        let mut at_line_start = true;
        while self.pos < self.chars.len() {
            if at_line_start && self.brackets == 0 {
                if self.handle_indentation()? {
                    continue;
                }
                at_line_start = false;
            }
            let c = self.chars[self.pos];
            match c {
                '\n' => {
                    self.pos += 1;
                    if self.brackets == 0 {
                        self.push_newline();
                        at_line_start = true;
                    }
                    self.line += 1;
                }
                ' ' | '\t' | '\r' => self.pos += 1,
                '#' => self.skip_comment(),
                '\\' if self.peek(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '\'' | '"' => self.string(c)?,
                c if c.is_ascii_digit() => self.number()?,
                '.' if self.peek(1).is_some_and(|n| n.is_ascii_digit()) => self.number()?,
                c if c.is_alphabetic() || c == '_' => self.word(),
                _ => self.operator()?,
            }
        }
        self.push_newline();
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        self.push(Tok::Eof);
        Ok(self.tokens)
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, tok: Tok) {
        self.tokens.push(Token {
            tok,
            line: self.line,
        });
    }

    fn push_newline(&mut self) {
        if !matches!(
            self.tokens.last().map(|t| &t.tok),
            None | Some(Tok::Newline) | Some(Tok::Indent) | Some(Tok::Dedent)
        ) {
            self.push(Tok::Newline);
        }
    }

    fn skip_comment(&mut self) {
        while self.pos < self.chars.len() && self.chars[self.pos] != '\n' {
            self.pos += 1;
        }
    }

    /// Measures leading whitespace and emits INDENT/DEDENT. Returns true when the
    /// line is blank or comment-only and was consumed entirely.
    fn handle_indentation(&mut self) -> Result<bool, ParseError> {
        let mut width = 0;
        let mut cursor = self.pos;
        while let Some(&c) = self.chars.get(cursor) {
            match c {
                ' ' => width += 1,
                '\t' => width = (width / TAB_WIDTH + 1) * TAB_WIDTH,
                '\r' => {}
                _ => break,
            }
            cursor += 1;
        }
        match self.chars.get(cursor) {
            None => {
                self.pos = cursor;
                return Ok(true);
            }
            Some('\n') => {
                self.pos = cursor + 1;
                self.line += 1;
                return Ok(true);
            }
            Some('#') => {
                self.pos = cursor;
                self.skip_comment();
                if self.pos < self.chars.len() {
                    self.pos += 1;
                    self.line += 1;
                }
                return Ok(true);
            }
            _ => {}
        }
        self.pos = cursor;
        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.push(Tok::Indent);
        } else if width < current {
            while self.indents.last().is_some_and(|&w| w > width) {
                self.indents.pop();
                self.push(Tok::Dedent);
            }
            if self.indents.last().copied().unwrap_or(0) != width {
                return Err(ParseError::new(
                    self.line,
                    "unindent does not match any outer indentation level",
                ));
            }
        }
        Ok(false)
    }

    fn string(&mut self, quote: char) -> Result<(), ParseError> {
        let start_line = self.line;
        self.pos += 1;
        let mut text = String::new();
        loop {
            let Some(c) = self.peek(0) else {
                return Err(ParseError::new(start_line, "unterminated string literal"));
            };
            self.pos += 1;
            match c {
                '\n' => return Err(ParseError::new(start_line, "unterminated string literal")),
                '\\' => {
                    let Some(escaped) = self.peek(0) else {
                        return Err(ParseError::new(start_line, "unterminated string literal"));
                    };
                    self.pos += 1;
                    match escaped {
                        'n' => text.push('\n'),
                        't' => text.push('\t'),
                        'r' => text.push('\r'),
                        '0' => text.push('\0'),
                        '\\' | '\'' | '"' => text.push(escaped),
                        '\n' => self.line += 1,
                        other => {
                            text.push('\\');
                            text.push(other);
                        }
                    }
                }
                c if c == quote => break,
                c => text.push(c),
            }
        }
        self.push(Tok::Str(text));
        Ok(())
    }

    fn number(&mut self) -> Result<(), ParseError> {
        let start = self.pos;
        let mut is_float = false;
        while let Some(c) = self.peek(0) {
            if c.is_ascii_digit() || c == '_' {
                self.pos += 1;
            } else if c == '.' && !is_float {
                is_float = true;
                self.pos += 1;
            } else if (c == 'e' || c == 'E')
                && self
                    .peek(1)
                    .is_some_and(|n| n.is_ascii_digit() || n == '+' || n == '-')
            {
                is_float = true;
                self.pos += 2;
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|&&c| c != '_')
            .collect();
        let tok = if is_float {
            text.parse::<f64>()
                .map(Tok::Float)
                .map_err(|_| ParseError::new(self.line, format!("invalid number '{text}'")))?
        } else {
            text.parse::<i64>().map(Tok::Int).map_err(|_| {
                ParseError::new(self.line, format!("integer literal '{text}' is too large"))
            })?
        };
        self.push(tok);
        Ok(())
    }

    fn word(&mut self) {
        let start = self.pos;
        while self
            .peek(0)
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        let tok = match KEYWORDS.iter().find(|&&kw| kw == word) {
            Some(kw) => Tok::Keyword(kw),
            None => Tok::Name(word),
        };
        self.push(tok);
    }

    fn operator(&mut self) -> Result<(), ParseError> {
        for op in OPERATORS {
            let len = op.chars().count();
            let matches = op
                .chars()
                .enumerate()
                .all(|(i, c)| self.peek(i) == Some(c));
            if matches {
                self.pos += len;
                match *op {
                    "(" | "[" => self.brackets += 1,
                    ")" | "]" => self.brackets = self.brackets.saturating_sub(1),
                    _ => {}
                }
                self.push(Tok::Op(op));
                return Ok(());
            }
        }
        let c = self.chars[self.pos];
        Err(ParseError::new(self.line, format!("invalid character '{c}'")))
    }
}
