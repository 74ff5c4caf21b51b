//! Golden description parser
//!
//! Line oriented, fed one byte at a time through a transition table
//! indexed by `[state][token]`:
//!
//! ```text
//! # comment
//! FRAME_ID 7
//! NET_ID 0
//! COMPARATOR reordered
//! 3 /data/golden/av3.bin
//! ```

use std::path::PathBuf;

use log::trace;

use super::comparator::ComparatorKind;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    Begin,
    Hdr,
    HdrSep,
    HdrParam,
    Comment,
    GoldenIdx,
    GoldenSep,
    GoldenFile,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Alpha,
    Digit,
    Space,
    Newline,
    Hash,
    Invalid,
}

const STATES: usize = 9;
const TOKENS: usize = 6;

impl Token {
    fn classify(b: u8) -> Self {
        match b {
            b'0'..=b'9' => Token::Digit,
            b'a'..=b'z' | b'A'..=b'Z' | b'_' | b'/' | b'.' | b'-' => Token::Alpha,
            b' ' | b'\t' | b'\r' => Token::Space,
            b'\n' => Token::Newline,
            b'#' => Token::Hash,
            _ => Token::Invalid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    None,
    /// Append the byte to the current token
    Push,
    EndHdrName,
    EndHdrParam,
    EndIdx,
    EndFile,
    Fail,
}

#[derive(Clone, Copy)]
struct Transition {
    next: ParseState,
    action: Action,
}

const fn t(next: ParseState, action: Action) -> Transition {
    Transition { next, action }
}

const FAIL: Transition = t(ParseState::Invalid, Action::Fail);

use Action as A;
use ParseState as S;

//                      Alpha                       Digit                       Space                          Newline                     Hash                    Invalid
#[rustfmt::skip]
static PARSE_TABLE: [[Transition; TOKENS]; STATES] = [
    /* Begin */      [t(S::Hdr, A::Push),        t(S::GoldenIdx, A::Push),   t(S::Begin, A::None),          t(S::Begin, A::None),       t(S::Comment, A::None), FAIL],
    /* Hdr */        [t(S::Hdr, A::Push),        t(S::Hdr, A::Push),         t(S::HdrSep, A::EndHdrName),   FAIL,                       FAIL,                   FAIL],
    /* HdrSep */     [t(S::HdrParam, A::Push),   t(S::HdrParam, A::Push),    t(S::HdrSep, A::None),         FAIL,                       FAIL,                   FAIL],
    /* HdrParam */   [t(S::HdrParam, A::Push),   t(S::HdrParam, A::Push),    t(S::HdrParam, A::Push),       t(S::Begin, A::EndHdrParam), FAIL,                  FAIL],
    /* Comment */    [t(S::Comment, A::None),    t(S::Comment, A::None),     t(S::Comment, A::None),        t(S::Begin, A::None),       t(S::Comment, A::None), t(S::Comment, A::None)],
    /* GoldenIdx */  [FAIL,                      t(S::GoldenIdx, A::Push),   t(S::GoldenSep, A::EndIdx),    FAIL,                       FAIL,                   FAIL],
    /* GoldenSep */  [t(S::GoldenFile, A::Push), t(S::GoldenFile, A::Push),  t(S::GoldenSep, A::None),      FAIL,                       FAIL,                   FAIL],
    /* GoldenFile */ [t(S::GoldenFile, A::Push), t(S::GoldenFile, A::Push),  FAIL,                          t(S::Begin, A::EndFile),    FAIL,                   FAIL],
    /* Invalid */    [FAIL,                      FAIL,                       FAIL,                          FAIL,                       FAIL,                   FAIL],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Header {
    FrameId,
    NetId,
    Comparator,
}

static HEADERS: &[(&str, Header)] = &[
    ("FRAME_ID", Header::FrameId),
    ("NET_ID", Header::NetId),
    ("COMPARATOR", Header::Comparator),
];

/// Golden reference for one address vector, before loading
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoldenEntry {
    pub av_index: u32,
    pub path: PathBuf,
}

/// Parsed description
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Description {
    pub frame_id: Option<u32>,
    pub net_id: Option<u32>,
    pub comparator: ComparatorKind,
    pub entries: Vec<GoldenEntry>,
}

pub struct Parser {
    state: ParseState,
    token: String,
    header: Option<Header>,
    av_index: u32,
    line: usize,
    column: usize,
    desc: Description,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            state: ParseState::Begin,
            token: String::new(),
            header: None,
            av_index: 0,
            line: 1,
            column: 0,
            desc: Description::default(),
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Feed a chunk; stops at the first malformed byte
    pub fn feed(&mut self, bytes: &[u8]) -> Result<()> {
        bytes.iter().try_for_each(|&b| self.step(b))
    }

    /// Finish the stream; a line left open is an unexpected EOF
    pub fn finish(self) -> Result<Description> {
        if self.state != ParseState::Begin {
            return Err(Error::Parse {
                line: self.line,
                column: self.column,
                reason: "unexpected EOF".into(),
            });
        }
        Ok(self.desc)
    }

    fn step(&mut self, b: u8) -> Result<()> {
        self.column += 1;
        let token = Token::classify(b);
        let tr = PARSE_TABLE[self.state as usize][token as usize];
        trace!("golden: {:?} + {:?} -> {:?}", self.state, token, tr.next);

        let result = match tr.action {
            Action::None => Ok(()),
            Action::Push => {
                self.token.push(b as char);
                Ok(())
            }
            Action::EndHdrName => self.end_hdr_name(),
            Action::EndHdrParam => self.end_hdr_param(),
            Action::EndIdx => self.end_idx(),
            Action::EndFile => {
                let path = PathBuf::from(std::mem::take(&mut self.token));
                self.desc.entries.push(GoldenEntry {
                    av_index: self.av_index,
                    path,
                });
                Ok(())
            }
            Action::Fail => Err(if self.state == ParseState::Invalid {
                "input after a parse error".to_string()
            } else {
                format!("unexpected {:?} in {:?}", b as char, self.state)
            }),
        };

        match result {
            Ok(()) => {
                self.state = tr.next;
                if token == Token::Newline {
                    self.line += 1;
                    self.column = 0;
                }
                Ok(())
            }
            Err(reason) => {
                self.state = ParseState::Invalid;
                Err(Error::Parse {
                    line: self.line,
                    column: self.column,
                    reason,
                })
            }
        }
    }

    fn end_hdr_name(&mut self) -> std::result::Result<(), String> {
        let name = std::mem::take(&mut self.token);
        match HEADERS.iter().find(|(n, _)| *n == name) {
            Some((_, header)) => {
                self.header = Some(*header);
                Ok(())
            }
            None => Err(format!("unknown header {}", name)),
        }
    }

    fn end_hdr_param(&mut self) -> std::result::Result<(), String> {
        let raw = std::mem::take(&mut self.token);
        let param = raw.trim();
        let number = || {
            param
                .parse::<u32>()
                .map_err(|_| format!("bad number {:?}", param))
        };

        match self.header.take() {
            Some(Header::FrameId) => self.desc.frame_id = Some(number()?),
            Some(Header::NetId) => self.desc.net_id = Some(number()?),
            Some(Header::Comparator) => {
                self.desc.comparator = ComparatorKind::from_name(param)
                    .ok_or_else(|| format!("unknown comparator {}", param))?;
            }
            None => return Err("header value without header".into()),
        }
        Ok(())
    }

    fn end_idx(&mut self) -> std::result::Result<(), String> {
        let raw = std::mem::take(&mut self.token);
        self.av_index = raw
            .parse::<u32>()
            .map_err(|_| format!("bad address vector index {}", raw))?;
        Ok(())
    }
}
