// Copyright (c) Facebook, Inc. and its affiliates.

//! Length-prefixed token framing.
//!
//! Every message on a sync connection is `0x%08x` followed by that many
//! bytes of body. The body is `<command> <payload>`. Sync protocol tokens
//! further lead the payload with the job nonce, giving
//! `<command> <nonce> <payload>`.
use log::trace;
use std::fmt;
use std::io::{self, prelude::*};
use std::str::FromStr;
use thiserror::Error;

pub const PREFIX_LEN: usize = 10;
pub const MAX_BODY_LEN: usize = u32::MAX as usize;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed length prefix {0:?}")]
    BadPrefix(String),
    #[error("connection closed after {got} of {want} bytes")]
    Truncated { got: usize, want: usize },
    #[error("body of {0} bytes exceeds the frame limit")]
    Oversize(usize),
    #[error("body is not valid UTF-8")]
    NotUtf8(#[from] std::string::FromUtf8Error),
    #[error("unparseable token {0:?}")]
    Unparseable(String),
    #[error("{0}")]
    Io(#[from] io::Error),
}

/// Frame and write `command + " " + payload`.
pub fn write_token<W: Write>(w: &mut W, command: &str, payload: &str) -> Result<(), TokenError> {
    let len = command.len() + 1 + payload.len();
    if len > MAX_BODY_LEN {
        return Err(TokenError::Oversize(len));
    }

    let mut buf = Vec::with_capacity(PREFIX_LEN + len);
    buf.extend_from_slice(format!("0x{:08x}", len).as_bytes());
    buf.extend_from_slice(command.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(payload.as_bytes());

    // write_all() loops over partial writes and EINTR.
    w.write_all(&buf)?;
    w.flush()?;
    trace!("token: wrote {} bytes ({:?})", len, command);
    Ok(())
}

fn read_prefix<R: Read>(r: &mut R) -> Result<Option<usize>, TokenError> {
    let mut prefix = [0u8; PREFIX_LEN];
    let mut got = 0;
    while got < PREFIX_LEN {
        match r.read(&mut prefix[got..]) {
            Ok(0) if got == 0 => return Ok(None),
            Ok(0) => {
                return Err(TokenError::Truncated {
                    got,
                    want: PREFIX_LEN,
                })
            }
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let text = String::from_utf8_lossy(&prefix).to_string();
    if !text.starts_with("0x") {
        return Err(TokenError::BadPrefix(text));
    }
    match usize::from_str_radix(&text[2..], 16) {
        Ok(len) => Ok(Some(len)),
        Err(_) => Err(TokenError::BadPrefix(text)),
    }
}

/// Read one framed body. `Ok(None)` means the peer closed the stream before
/// sending anything.
pub fn read_token<R: Read>(r: &mut R) -> Result<Option<String>, TokenError> {
    let len = match read_prefix(r)? {
        Some(v) => v,
        None => return Ok(None),
    };

    // Don't trust the prefix for the allocation size.
    let mut body = Vec::with_capacity(len.min(1 << 16));
    r.by_ref().take(len as u64).read_to_end(&mut body)?;
    if body.len() < len {
        return Err(TokenError::Truncated {
            got: body.len(),
            want: len,
        });
    }
    trace!("token: read {} bytes", len);
    Ok(Some(String::from_utf8(body)?))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Sync,
    Time,
    Tnet,
    Rslt,
    Fail,
    Nsrq,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Sync => "sync",
            Command::Time => "time",
            Command::Tnet => "tnet",
            Command::Rslt => "rslt",
            Command::Fail => "fail",
            Command::Nsrq => "nsrq",
        }
    }

    pub fn is_time(&self) -> bool {
        matches!(self, Command::Time | Command::Tnet)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, TokenError> {
        Ok(match s {
            "sync" => Command::Sync,
            "time" => Command::Time,
            "tnet" => Command::Tnet,
            "rslt" => Command::Rslt,
            "fail" => Command::Fail,
            "nsrq" => Command::Nsrq,
            _ => return Err(TokenError::Unparseable(s.to_string())),
        })
    }
}

/// A sync protocol message.
#[derive(Clone, PartialEq)]
pub struct Token {
    pub command: Command,
    pub nonce: String,
    pub payload: String,
}

// Keep the nonce out of logs.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("command", &self.command)
            .field("payload", &self.payload)
            .finish()
    }
}

impl Token {
    pub fn new(command: Command, nonce: &str, payload: &str) -> Self {
        Self {
            command,
            nonce: nonce.to_string(),
            payload: payload.to_string(),
        }
    }

    pub fn parse(body: &str) -> Result<Self, TokenError> {
        let mut split = body.splitn(3, ' ');
        let command = split
            .next()
            .unwrap_or("")
            .parse::<Command>()
            .map_err(|_| TokenError::Unparseable(body.chars().take(32).collect()))?;
        let nonce = match split.next() {
            Some(v) if v.len() > 0 => v,
            _ => return Err(TokenError::Unparseable(command.to_string())),
        };
        Ok(Self {
            command,
            nonce: nonce.to_string(),
            payload: split.next().unwrap_or("").to_string(),
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), TokenError> {
        write_token(
            w,
            self.command.as_str(),
            &format!("{} {}", &self.nonce, &self.payload),
        )
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Option<Self>, TokenError> {
        match read_token(r)? {
            Some(body) => Ok(Some(Self::parse(&body)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{read_token, write_token, Command, Token, TokenError};
    use std::io::{self, Cursor, Read};

    /// Hands out at most `chunk` bytes per read() to exercise the loops.
    struct Trickle {
        inner: Cursor<Vec<u8>>,
        chunk: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.chunk);
            self.inner.read(&mut buf[..n])
        }
    }

    #[test]
    fn test_framing() {
        let payloads: Vec<String> = vec![
            "".into(),
            "x".into(),
            "{\"a\": [1, 2, \"0x00000010\"]}".into(),
            "z".repeat(70000),
        ];
        for payload in payloads.iter() {
            let mut wire = Vec::new();
            write_token(&mut wire, "rslt", payload).unwrap();
            assert_eq!(&wire[..2], b"0x");
            assert_eq!(wire.len(), 10 + 5 + payload.len());

            let mut r = Trickle {
                inner: Cursor::new(wire),
                chunk: 3,
            };
            let body = read_token(&mut r).unwrap().unwrap();
            assert_eq!(body, format!("rslt {}", payload));
            assert!(read_token(&mut r).unwrap().is_none());
        }
    }

    #[test]
    fn test_prefix_format() {
        let mut wire = Vec::new();
        write_token(&mut wire, "sync", "ab").unwrap();
        assert_eq!(String::from_utf8(wire).unwrap(), "0x00000007sync ab");
    }

    #[test]
    fn test_malformed() {
        let mut r = Cursor::new(b"0x0000".to_vec());
        assert!(matches!(
            read_token(&mut r),
            Err(TokenError::Truncated { got: 6, want: 10 })
        ));

        let mut r = Cursor::new(b"0x00000010sync".to_vec());
        assert!(matches!(
            read_token(&mut r),
            Err(TokenError::Truncated { got: 4, want: 16 })
        ));

        let mut r = Cursor::new(b"GET / HTTP/1.1\r\n".to_vec());
        assert!(matches!(read_token(&mut r), Err(TokenError::BadPrefix(_))));

        let mut r = Cursor::new(b"0xzzzzzzzz".to_vec());
        assert!(matches!(read_token(&mut r), Err(TokenError::BadPrefix(_))));

        let mut r = Cursor::new(Vec::new());
        assert!(read_token(&mut r).unwrap().is_none());
    }

    #[test]
    fn test_token() {
        let tok = Token::new(Command::Time, "n0nce", "1700000000.25");
        let mut wire = Vec::new();
        tok.write_to(&mut wire).unwrap();
        let got = Token::read_from(&mut Cursor::new(wire)).unwrap().unwrap();
        assert_eq!(got, tok);

        let got = Token::parse("sync n0nce").unwrap();
        assert_eq!(got.command, Command::Sync);
        assert_eq!(got.payload, "");

        let got = Token::parse("fail n0nce disk full").unwrap();
        assert_eq!(got.payload, "disk full");

        assert!(Token::parse("bogus n0nce x").is_err());
        assert!(Token::parse("sync").is_err());
        assert!(!format!("{:?}", &tok).contains("n0nce"));
    }
}
