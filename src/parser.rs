//! Implements a parser for beanstalkd command lines.
use std::{error, fmt};

use crate::types::job::TubeName;
use crate::types::protocol::BeanstalkCommand;
use crate::types::serialisable::BeanstalkSerialisable;

/// The longest command line accepted, including the trailing CRLF.
pub const MAX_LINE_LEN: usize = 224;

/// The longest tube name accepted.
pub const MAX_TUBE_NAME_LEN: usize = 200;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParsingError {
    BadFormat,
    UnknownCommand,
}

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::BadFormat => "bad format",
            Self::UnknownCommand => "unknown command",
        })
    }
}

impl error::Error for ParsingError {}

impl BeanstalkSerialisable for ParsingError {
    fn serialise_beanstalk(&self) -> Vec<u8> {
        match self {
            ParsingError::BadFormat => b"BAD_FORMAT\r\n".to_vec(),
            ParsingError::UnknownCommand => b"UNKNOWN_COMMAND\r\n".to_vec(),
        }
    }
}

/// Returns true if `c` may appear in a tube name at the given position.
fn char_is_name_safe(c: u8, is_first: bool) -> bool {
    match c {
        b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' => true,
        b'+' | b'/' | b';' | b'.' | b'$' | b'_' | b'(' | b')' => true,
        b'-' => !is_first, // - is only name safe outside first position
        _ => false,
    }
}

/// A minimal, zero-copy parser over a single command line.
struct ParseState<'a> {
    from: &'a [u8],
}

impl ParseState<'_> {
    /// Asserts there's no more input to take, returning `result` if so, and a
    /// `BadFormat` error otherwise.
    fn expect_done_and<R>(&self, result: R) -> Result<R, ParsingError> {
        if self.from.is_empty() {
            Ok(result)
        } else {
            Err(ParsingError::BadFormat)
        }
    }

    /// Consumes from the input, expecting a token of non-zero length.
    fn expect_next_token(&mut self) -> Result<&[u8], ParsingError> {
        match self.next_token() {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(ParsingError::BadFormat),
        }
    }

    /// Consumes a space then a decimal number that must fit in `T`.
    fn expect_next_number<T: TryFrom<u64>>(
        &mut self,
    ) -> Result<T, ParsingError> {
        self.expect_space()?;

        let mut r = 0u64;
        for v in self.expect_next_token()? {
            let digit = match v {
                b'0'..=b'9' => u64::from(v - b'0'),
                _ => return Err(ParsingError::BadFormat),
            };
            r = r
                .checked_mul(10)
                .and_then(|r| r.checked_add(digit))
                .ok_or(ParsingError::BadFormat)?;
        }

        T::try_from(r).map_err(|_| ParsingError::BadFormat)
    }

    /// Consumes a space then a tube name.
    fn expect_next_name(&mut self) -> Result<TubeName, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;
        let valid = token.len() <= MAX_TUBE_NAME_LEN
            && token
                .iter()
                .enumerate()
                .all(|(i, c)| char_is_name_safe(*c, i == 0));

        if !valid {
            return Err(ParsingError::BadFormat);
        }

        // Every name-safe byte is ASCII.
        String::from_utf8(token.to_vec()).map_err(|_| ParsingError::BadFormat)
    }

    /// Consumes a space.
    fn expect_space(&mut self) -> Result<(), ParsingError> {
        match self.from.first() {
            Some(b' ') => {
                self.from = &self.from[1..];
                Ok(())
            },
            _ => Err(ParsingError::BadFormat),
        }
    }

    /// Consumes until reaching a space byte or the end of the input. Returns
    /// None at the end of the input, and a zero-length slice on consecutive
    /// spaces.
    fn next_token(&mut self) -> Option<&[u8]> {
        if self.from.is_empty() {
            return None;
        }

        let idx = self
            .from
            .iter()
            .position(|c| *c == b' ')
            .unwrap_or(self.from.len());

        let (token, rest) = self.from.split_at(idx);
        self.from = rest;

        Some(token)
    }
}

impl<'a> From<&'a [u8]> for ParseState<'a> {
    fn from(from: &'a [u8]) -> Self {
        ParseState { from }
    }
}

impl TryFrom<&[u8]> for BeanstalkCommand {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        use BeanstalkCommand::*;

        let mut ps: ParseState = value.into();

        let cmd = match ps.expect_next_token()? {
            // <cmd>
            b"list-tube-used" => ListTubeUsed,
            b"list-tubes-watched" => ListTubesWatched,
            b"list-tubes" => ListTubes,
            b"peek-buried" => PeekBuried,
            b"peek-delayed" => PeekDelayed,
            b"peek-ready" => PeekReady,
            b"quit" => Quit,
            b"reserve" => Reserve,
            b"stats" => StatsServer,

            // <cmd> <id>
            b"delete" => Delete {
                id: ps.expect_next_number()?,
            },
            b"kick" => Kick {
                bound: ps.expect_next_number()?,
            },
            b"kick-job" => KickJob {
                id: ps.expect_next_number()?,
            },
            b"peek" => Peek {
                id: ps.expect_next_number()?,
            },
            b"reserve-job" => ReserveJob {
                id: ps.expect_next_number()?,
            },
            b"stats-job" => StatsJob {
                id: ps.expect_next_number()?,
            },
            b"touch" => Touch {
                id: ps.expect_next_number()?,
            },

            // <cmd> <timeout>
            b"reserve-with-timeout" => ReserveWithTimeout {
                timeout: ps.expect_next_number()?,
            },

            // <cmd> <tube>
            b"use" => Use {
                tube: ps.expect_next_name()?,
            },
            b"watch" => Watch {
                tube: ps.expect_next_name()?,
            },
            b"ignore" => Ignore {
                tube: ps.expect_next_name()?,
            },
            b"stats-tube" => StatsTube {
                tube: ps.expect_next_name()?,
            },

            // <cmd> <id> <pri>
            b"bury" => Bury {
                id: ps.expect_next_number()?,
                pri: ps.expect_next_number()?,
            },

            // <cmd> <tube> <delay>
            b"pause-tube" => PauseTube {
                tube: ps.expect_next_name()?,
                delay: ps.expect_next_number()?,
            },

            // <cmd> <id> <pri> <delay>
            b"release" => Release {
                id: ps.expect_next_number()?,
                pri: ps.expect_next_number()?,
                delay: ps.expect_next_number()?,
            },

            // <cmd> <pri> <delay> <ttr> <n_bytes>
            b"put" => Put {
                pri: ps.expect_next_number()?,
                delay: ps.expect_next_number()?,
                ttr: ps.expect_next_number()?,
                n_bytes: ps.expect_next_number()?,
            },

            _ => return Err(ParsingError::UnknownCommand),
        };

        ps.expect_done_and(cmd)
    }
}
