use crate::error::StructuralError;
use memchr::{memchr2, memchr3};

/// Byte offsets of the `[` opening each array of interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub data: usize,
    pub included: Option<usize>,
}

/// One complete JSON object from an array, plus its byte span in the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element<'a> {
    pub text: &'a str,
    pub start: usize,
    /// First byte after the closing brace; a valid resume point.
    pub end: usize,
}

/// Accepts `{"data": [...], "included": [...]}` (keys in any order, other keys
/// skipped) or a bare top-level array, which has no side table.
pub fn locate_envelope(raw: &str) -> Result<Envelope, StructuralError> {
    let bytes = raw.as_bytes();
    let start = skip_whitespace(bytes, 0);
    match bytes.get(start) {
        None => Err(StructuralError::Empty),
        Some(b'[') => Ok(Envelope {
            data: start,
            included: None,
        }),
        Some(b'{') => scan_object_keys(raw, start),
        Some(_) => Err(unexpected(bytes, start)),
    }
}

fn scan_object_keys(raw: &str, start: usize) -> Result<Envelope, StructuralError> {
    let bytes = raw.as_bytes();
    let mut data = None;
    let mut included = None;
    let mut pos = start + 1;

    loop {
        pos = skip_whitespace(bytes, pos);
        match bytes.get(pos) {
            None | Some(b'}') => break,
            Some(b',') => {
                pos += 1;
                continue;
            }
            Some(b'"') => {}
            Some(_) => return Err(unexpected(bytes, pos)),
        }

        let Some(key_end) = string_end(bytes, pos) else {
            break;
        };
        let key = &raw[pos + 1..key_end - 1];

        pos = skip_whitespace(bytes, key_end);
        match bytes.get(pos) {
            None => break,
            Some(b':') => {}
            Some(_) => return Err(unexpected(bytes, pos)),
        }
        pos = skip_whitespace(bytes, pos + 1);

        if bytes.get(pos) == Some(&b'[') {
            match key {
                "data" => data = Some(pos),
                "included" => included = Some(pos),
                _ => {}
            }
        }

        match skip_value(bytes, pos) {
            Ok(end) => pos = end,
            // A torn tail after `data` surfaces while streaming, once every
            // element before the tear has been committed.
            Err(_) if data.is_some() => break,
            Err(e) => return Err(e),
        }
    }

    data.map(|data| Envelope { data, included })
        .ok_or(StructuralError::MissingArray)
}

/// Lazy iterator over the objects of one array, handing out each object as a
/// borrowed substring. Brace depth is only counted outside string literals,
/// and a backslash inside a string always escapes the following byte.
///
/// Not re-entrant mid-element: the only restart points are the array start and
/// the `end` offset of a yielded element.
pub struct Elements<'a> {
    raw: &'a str,
    array_start: usize,
    pos: usize,
    finished: bool,
}

impl<'a> Elements<'a> {
    pub fn new(raw: &'a str, array_start: usize) -> Result<Self, StructuralError> {
        let bytes = raw.as_bytes();
        match bytes.get(array_start) {
            Some(b'[') => Ok(Self {
                raw,
                array_start,
                pos: array_start + 1,
                finished: false,
            }),
            Some(_) => Err(unexpected(bytes, array_start)),
            None => Err(StructuralError::UnterminatedArray {
                offset: array_start,
            }),
        }
    }

    /// Restart after a previously yielded element ending at `offset`, or at
    /// the array start. Only those offsets are accepted; the elements before
    /// `offset` are re-scanned, not parsed.
    pub fn resume(raw: &'a str, array_start: usize, offset: usize) -> Result<Self, StructuralError> {
        let mut elements = Self::new(raw, array_start)?;
        if offset == elements.pos {
            return Ok(elements);
        }
        while let Some(element) = elements.next() {
            let element = element?;
            if element.end == offset {
                return Ok(elements);
            }
            if element.end > offset {
                break;
            }
        }
        Err(StructuralError::BadResumeOffset { offset })
    }

    /// Byte offset the next call to `next` starts scanning from.
    pub fn offset(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for Elements<'a> {
    type Item = Result<Element<'a>, StructuralError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let bytes = self.raw.as_bytes();
        let mut pos = self.pos;

        loop {
            match bytes.get(pos) {
                None => {
                    self.finished = true;
                    return Some(Err(StructuralError::UnterminatedArray {
                        offset: self.array_start,
                    }));
                }
                Some(b) if b.is_ascii_whitespace() || *b == b',' => pos += 1,
                Some(b']') => {
                    self.finished = true;
                    self.pos = pos + 1;
                    return None;
                }
                Some(b'{') => break,
                Some(_) => {
                    self.finished = true;
                    return Some(Err(unexpected(bytes, pos)));
                }
            }
        }

        match balanced_end(bytes, pos, b'{', b'}') {
            Some(end) => {
                self.pos = end;
                Some(Ok(Element {
                    text: &self.raw[pos..end],
                    start: pos,
                    end,
                }))
            }
            None => {
                self.finished = true;
                Some(Err(StructuralError::UnterminatedElement { offset: pos }))
            }
        }
    }
}

fn skip_whitespace(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
        pos += 1;
    }
    pos
}

fn unexpected(bytes: &[u8], offset: usize) -> StructuralError {
    StructuralError::UnexpectedByte {
        byte: bytes[offset] as char,
        offset,
    }
}

/// End (exclusive) of the string literal whose opening quote is at `start`.
fn string_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut pos = start + 1;
    while let Some(rel) = memchr2(b'"', b'\\', &bytes[pos..]) {
        let at = pos + rel;
        if bytes[at] == b'\\' {
            pos = at + 2;
            if pos > bytes.len() {
                return None;
            }
        } else {
            return Some(at + 1);
        }
    }
    None
}

/// End (exclusive) of the container opened at `start`. Only `open`/`close`
/// are counted; in well-formed input the other bracket kind is balanced
/// inside it anyway.
fn balanced_end(bytes: &[u8], start: usize, open: u8, close: u8) -> Option<usize> {
    let mut depth = 0usize;
    let mut pos = start;
    while let Some(rel) = memchr3(b'"', open, close, &bytes[pos..]) {
        let at = pos + rel;
        let b = bytes[at];
        if b == b'"' {
            pos = string_end(bytes, at)?;
            continue;
        }
        if b == open {
            depth += 1;
        } else {
            depth -= 1;
            if depth == 0 {
                return Some(at + 1);
            }
        }
        pos = at + 1;
    }
    None
}

fn skip_value(bytes: &[u8], start: usize) -> Result<usize, StructuralError> {
    let torn = StructuralError::UnterminatedElement { offset: start };
    match bytes.get(start) {
        None => Err(torn),
        Some(b'"') => string_end(bytes, start).ok_or(StructuralError::UnterminatedString { offset: start }),
        Some(b'{') => balanced_end(bytes, start, b'{', b'}').ok_or(torn),
        Some(b'[') => balanced_end(bytes, start, b'[', b']')
            .ok_or(StructuralError::UnterminatedArray { offset: start }),
        Some(_) => {
            let mut pos = start;
            while pos < bytes.len()
                && !bytes[pos].is_ascii_whitespace()
                && !matches!(bytes[pos], b',' | b'}' | b']')
            {
                pos += 1;
            }
            if pos == start {
                Err(unexpected(bytes, start))
            } else {
                Ok(pos)
            }
        }
    }
}
