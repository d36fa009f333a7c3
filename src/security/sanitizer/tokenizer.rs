//! Markup tokenizer.
//!
//! Splits raw markup into text, start tags and end tags. Comments, doctypes
//! and processing instructions are consumed and discarded. Text and attribute
//! values come out entity-decoded.

use super::is_raw_text;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token {
    Text(String),
    StartTag {
        name: String,
        /// Lowercased names, first occurrence wins.
        attributes: Vec<(String, String)>,
        self_closing: bool,
    },
    EndTag {
        name: String,
    },
}

/// Tokens plus the reason tokenizing stopped early, if it did.
#[derive(Debug, Default)]
pub(crate) struct Tokens {
    pub tokens: Vec<Token>,
    pub truncated: Option<String>,
}

struct Tokenizer<'a> {
    input: &'a str,
    bytes: &'a [u8],
    out: Tokens,
}

/// Tokenize `input`. An unterminated construct ends tokenizing; everything
/// from its opening `<` on is discarded.
pub(crate) fn tokenize(input: &str) -> Tokens {
    let mut tokenizer = Tokenizer {
        input,
        bytes: input.as_bytes(),
        out: Tokens::default(),
    };
    tokenizer.run();
    tokenizer.out
}

impl<'a> Tokenizer<'a> {
    fn run(&mut self) {
        let input = self.input;
        let mut text_start = 0;
        let mut cursor = 0;

        while let Some(offset) = input[cursor..].find('<') {
            let lt = cursor + offset;
            let next = self.bytes.get(lt + 1).copied();

            let outcome = match next {
                Some(b) if b.is_ascii_alphabetic() => self.start_tag(lt),
                Some(b'/') => self.end_tag(lt),
                Some(b'!') => self.markup_declaration(lt),
                Some(b'?') => self.skip_to_gt(lt, "processing instruction"),
                // A lone '<' is text.
                _ => {
                    cursor = lt + 1;
                    continue;
                }
            };

            self.push_text(&input[text_start..lt]);
            match outcome {
                Step::Emit(tokens, end) => {
                    self.out.tokens.extend(tokens);
                    cursor = end;
                    text_start = end;
                }
                Step::Skip(end) => {
                    cursor = end;
                    text_start = end;
                }
                Step::Unterminated(what) => {
                    self.out.truncated = Some(format!("unterminated {} at byte {}", what, lt));
                    return;
                }
            }
        }

        self.push_text(&input[text_start..]);
    }

    fn push_text(&mut self, raw: &str) {
        if raw.is_empty() {
            return;
        }
        let decoded = decode_entities(raw);
        match self.out.tokens.last_mut() {
            Some(Token::Text(existing)) => existing.push_str(&decoded),
            _ => self.out.tokens.push(Token::Text(decoded)),
        }
    }

    fn start_tag(&self, lt: usize) -> Step {
        let mut pos = lt + 1;
        let name_end = self.scan_until(pos, |b| b.is_ascii_whitespace() || b == b'/' || b == b'>');
        let name = self.input[pos..name_end].to_ascii_lowercase();
        pos = name_end;

        let mut attributes: Vec<(String, String)> = Vec::new();
        let mut self_closing = false;

        loop {
            pos = self.skip_whitespace(pos);
            let Some(&b) = self.bytes.get(pos) else {
                return Step::Unterminated("start tag");
            };
            match b {
                b'>' => {
                    pos += 1;
                    break;
                }
                b'/' => {
                    if self.bytes.get(pos + 1) == Some(&b'>') {
                        self_closing = true;
                        pos += 2;
                        break;
                    }
                    pos += 1;
                    continue;
                }
                _ => {}
            }

            // An attribute name may start with '=', as in HTML.
            let name_start = pos;
            let name_end = self.scan_until(pos + 1, |b| {
                b.is_ascii_whitespace() || b == b'/' || b == b'>' || b == b'='
            });
            let attr_name = self.input[name_start..name_end].to_ascii_lowercase();
            pos = self.skip_whitespace(name_end);

            let mut value = String::new();
            if self.bytes.get(pos) == Some(&b'=') {
                pos = self.skip_whitespace(pos + 1);
                match self.bytes.get(pos) {
                    None => return Step::Unterminated("attribute"),
                    Some(&quote) if quote == b'"' || quote == b'\'' => {
                        let Some(close) = self.input[pos + 1..].find(quote as char) else {
                            return Step::Unterminated("attribute value");
                        };
                        value = decode_entities(&self.input[pos + 1..pos + 1 + close]);
                        pos = pos + 1 + close + 1;
                    }
                    Some(_) => {
                        let end = self.scan_until(pos, |b| b.is_ascii_whitespace() || b == b'>');
                        value = decode_entities(&self.input[pos..end]);
                        pos = end;
                    }
                }
            }

            if !attributes.iter().any(|(existing, _)| *existing == attr_name) {
                attributes.push((attr_name, value));
            }
        }

        let mut tokens = vec![Token::StartTag {
            name: name.clone(),
            attributes,
            self_closing,
        }];

        if is_raw_text(&name) && !self_closing {
            let Some((content_end, close_end)) = self.find_raw_text_end(pos, &name) else {
                return Step::Unterminated("raw text element");
            };
            if content_end > pos {
                tokens.push(Token::Text(self.input[pos..content_end].to_string()));
            }
            tokens.push(Token::EndTag { name });
            pos = close_end;
        }

        Step::Emit(tokens, pos)
    }

    fn end_tag(&self, lt: usize) -> Step {
        match self.bytes.get(lt + 2).copied() {
            Some(b) if b.is_ascii_alphabetic() => {
                let name_start = lt + 2;
                let name_end =
                    self.scan_until(name_start, |b| b.is_ascii_whitespace() || b == b'/' || b == b'>');
                let Some(gt) = self.input[name_end..].find('>') else {
                    return Step::Unterminated("end tag");
                };
                let name = self.input[name_start..name_end].to_ascii_lowercase();
                Step::Emit(vec![Token::EndTag { name }], name_end + gt + 1)
            }
            Some(b'>') => Step::Skip(lt + 3),
            None => Step::Unterminated("end tag"),
            Some(_) => self.skip_to_gt(lt, "bogus comment"),
        }
    }

    fn markup_declaration(&self, lt: usize) -> Step {
        if self.input[lt..].starts_with("<!--") {
            let body = lt + 4;
            // `<!-->` and `<!--->` close immediately.
            if self.input[body..].starts_with('>') {
                return Step::Skip(body + 1);
            }
            if self.input[body..].starts_with("->") {
                return Step::Skip(body + 2);
            }
            return match self.input[body..].find("-->") {
                Some(end) => Step::Skip(body + end + 3),
                None => Step::Unterminated("comment"),
            };
        }
        self.skip_to_gt(lt, "declaration")
    }

    fn skip_to_gt(&self, lt: usize, what: &'static str) -> Step {
        match self.input[lt..].find('>') {
            Some(gt) => Step::Skip(lt + gt + 1),
            None => Step::Unterminated(what),
        }
    }

    /// Locate `</name` followed by whitespace, `/` or `>`, case-insensitively.
    /// Returns (start of close tag, end of close tag).
    fn find_raw_text_end(&self, from: usize, name: &str) -> Option<(usize, usize)> {
        let mut search = from;
        while let Some(offset) = self.input[search..].find("</") {
            let close = search + offset;
            let name_start = close + 2;
            let name_end = name_start + name.len();
            let matches_name = self
                .bytes
                .get(name_start..name_end)
                .map(|candidate| candidate.eq_ignore_ascii_case(name.as_bytes()))
                .unwrap_or(false);
            let terminated = matches!(
                self.bytes.get(name_end),
                Some(b) if b.is_ascii_whitespace() || *b == b'/' || *b == b'>'
            );
            if matches_name && terminated {
                let gt = self.input[name_end..].find('>')?;
                return Some((close, name_end + gt + 1));
            }
            search = close + 2;
        }
        None
    }

    fn scan_until(&self, from: usize, stop: impl Fn(u8) -> bool) -> usize {
        let from = from.min(self.bytes.len());
        self.bytes[from..]
            .iter()
            .position(|&b| stop(b))
            .map(|p| from + p)
            .unwrap_or(self.bytes.len())
    }

    fn skip_whitespace(&self, from: usize) -> usize {
        self.scan_until(from, |b| !b.is_ascii_whitespace())
    }
}

enum Step {
    Emit(Vec<Token>, usize),
    Skip(usize),
    Unterminated(&'static str),
}

/// Decode character references. Named references need their `;`; numeric
/// ones may omit it. Anything unrecognized stays literal.
pub(crate) fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        match decode_reference(after) {
            Some((ch, consumed)) => {
                out.push(ch);
                rest = &after[consumed..];
            }
            None => {
                out.push('&');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

const NAMED_REFERENCES: &[(&str, char)] = &[
    ("amp", '&'),
    ("lt", '<'),
    ("gt", '>'),
    ("quot", '"'),
    ("apos", '\''),
    ("nbsp", '\u{a0}'),
    ("tab", '\t'),
    ("newline", '\n'),
    ("colon", ':'),
    ("lpar", '('),
    ("rpar", ')'),
    ("sol", '/'),
    ("bsol", '\\'),
    ("semi", ';'),
    ("equals", '='),
    ("grave", '`'),
];

/// Returns the decoded char and how many bytes after `&` were consumed.
fn decode_reference(after: &str) -> Option<(char, usize)> {
    if let Some(numeric) = after.strip_prefix('#') {
        let (radix, digits_at) = match numeric.as_bytes().first() {
            Some(b'x') | Some(b'X') => (16, 2),
            _ => (10, 1),
        };
        let digits = &after[digits_at..];
        let len = digits
            .bytes()
            .take_while(|b| if radix == 16 { b.is_ascii_hexdigit() } else { b.is_ascii_digit() })
            .count();
        if len == 0 {
            return None;
        }
        let significant = digits[..len].trim_start_matches('0');
        let code = if significant.len() > 8 {
            u32::MAX
        } else if significant.is_empty() {
            0
        } else {
            u32::from_str_radix(significant, radix).unwrap_or(u32::MAX)
        };
        let ch = match char::from_u32(code) {
            Some('\0') | None => '\u{fffd}',
            Some(ch) => ch,
        };
        let mut consumed = digits_at + len;
        if digits[len..].starts_with(';') {
            consumed += 1;
        }
        return Some((ch, consumed));
    }

    let name_len = after.bytes().take_while(|b| b.is_ascii_alphanumeric()).count();
    if !after[name_len..].starts_with(';') {
        return None;
    }
    let name = &after[..name_len];
    NAMED_REFERENCES
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(_, ch)| (*ch, name_len + 1))
}
