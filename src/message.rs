//! Wire-line grammar.
//!
//! Parses a single cleaned IRC line into its components:
//!
//! ```text
//! [:prefix] (numeric | word) (SP middle)* [SP ':' trailing]
//! ```
//!
//! Parsing is zero-copy: a [`Line`] borrows from the input string.

use nom::{
    bytes::complete::take_while1,
    character::complete::char,
    combinator::opt,
    sequence::preceded,
    IResult,
};

use crate::error::ParseError;

/// Parse the message prefix (the part after `:` and before the first space).
fn parse_prefix(input: &str) -> IResult<&str, &str> {
    preceded(char(':'), take_while1(|c| c != ' '))(input)
}

/// Parse the command token (everything up to the next space).
fn parse_command(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c != ' ')(input)
}

/// Parse parameters from the remaining input after the command.
///
/// Handles space-separated middles and the trailing parameter (prefixed
/// with `:`) which may contain spaces. Runs of spaces collapse to a single
/// separator.
fn parse_params(input: &str) -> Vec<&str> {
    let mut params = Vec::new();
    let mut rest = input;

    while rest.starts_with(' ') {
        rest = rest.trim_start_matches(' ');
        if rest.is_empty() {
            break;
        }
        if let Some(trailing) = rest.strip_prefix(':') {
            params.push(trailing);
            break;
        }
        let end = rest.find(' ').unwrap_or(rest.len());
        params.push(&rest[..end]);
        rest = &rest[end..];
    }

    params
}

/// The sender of a message: either a server name or `nick!user@host`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix<'a> {
    raw: &'a str,
}

impl<'a> Prefix<'a> {
    /// Wrap a raw prefix string.
    pub fn new(raw: &'a str) -> Self {
        Self { raw }
    }

    /// The full prefix as received.
    pub fn raw(&self) -> &'a str {
        self.raw
    }

    /// The nick portion: everything before `!`, or the whole prefix.
    pub fn nick(&self) -> &'a str {
        match self.raw.find('!') {
            Some(idx) => &self.raw[..idx],
            None => self.raw,
        }
    }

    /// The `user@host` portion after `!`, if present.
    pub fn userhost(&self) -> Option<&'a str> {
        self.raw.find('!').map(|idx| &self.raw[idx + 1..])
    }
}

/// A parsed command: three-digit numerics are separated from verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    /// A numeric reply such as 001 or 433.
    Numeric(u16),
    /// A verb such as `PRIVMSG`.
    Word(&'a str),
}

/// The numeric replies this client reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// 001 - registration accepted.
    Welcome,
    /// 332 - channel topic.
    Topic,
    /// 353 - NAMES reply.
    NamReply,
    /// 372 - MOTD body.
    Motd,
    /// 376 - end of MOTD.
    EndOfMotd,
    /// 422 - no MOTD.
    NoMotd,
    /// 433 - nickname already in use.
    NicknameInUse,
}

impl Reply {
    /// Look up a recognized numeric; unknown numerics yield `None` and are
    /// dropped by the caller.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::Welcome),
            332 => Some(Self::Topic),
            353 => Some(Self::NamReply),
            372 => Some(Self::Motd),
            376 => Some(Self::EndOfMotd),
            422 => Some(Self::NoMotd),
            433 => Some(Self::NicknameInUse),
            _ => None,
        }
    }
}

/// A parsed wire line borrowing from the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line<'a> {
    /// Message source, when present.
    pub prefix: Option<Prefix<'a>>,
    /// The command or numeric.
    pub command: Command<'a>,
    /// Parameters including the trailing parameter.
    pub params: Vec<&'a str>,
}

impl<'a> Line<'a> {
    /// Parse one cleaned line (no CR/LF, no formatting control bytes).
    pub fn parse(input: &'a str) -> Result<Self, ParseError> {
        if input.is_empty() {
            return Err(ParseError::EmptyLine);
        }

        let (input, prefix) = opt(parse_prefix)(input).map_err(|_: nom::Err<nom::error::Error<&str>>| ParseError::EmptyLine)?;
        let input = input.trim_start_matches(' ');

        let (input, command) = parse_command(input)
            .map_err(|_: nom::Err<nom::error::Error<&str>>| ParseError::MissingCommand)?;

        let command = match numeric(command) {
            Some(code) => Command::Numeric(code),
            None => Command::Word(command),
        };

        Ok(Line {
            prefix: prefix.map(Prefix::new),
            command,
            params: parse_params(input),
        })
    }

    /// First parameter, if any.
    pub fn param(&self, idx: usize) -> Option<&'a str> {
        self.params.get(idx).copied()
    }
}

fn numeric(token: &str) -> Option<u16> {
    if token.len() == 3 && token.bytes().all(|b| b.is_ascii_digit()) {
        token.parse().ok()
    } else {
        None
    }
}
