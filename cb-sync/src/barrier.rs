// Copyright (c) Facebook, Inc. and its affiliates.

//! One barrier round.
//!
//! A round accepts connections until `expected` of them have delivered a
//! valid token, holding every connection open. Only then are the clients
//! answered, all in one pass. Connections with the wrong nonce or an
//! unparseable token are dropped without counting against the round. A
//! `fail` token ends the round immediately.
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::net::{SocketAddr, TcpListener, TcpStream};

use super::context::SyncServiceContext;
use super::nameserver;
use super::net::{accept_with_retry, TOKEN_READ_TIMEOUT};
use cb_intf::{parse_time_request, Command, TimeReply, TnetRequest, Token};
use cb_util::*;

#[derive(Debug, Clone, PartialEq)]
pub enum RoundStatus {
    /// All clients checked in, more rounds to come.
    Continue,
    /// A round of results, the job is over.
    Finished,
    /// A client reported failure.
    Failed(String),
}

struct HeldClient {
    conn: TcpStream,
    peer: SocketAddr,
    token: Token,
    request_time: f64,
    client_ts: Option<f64>,
}

pub struct BarrierRound<'a> {
    ctx: &'a SyncServiceContext,
    expected: u32,
    remaining: u32,
    command: Option<Command>,
    clients: Vec<HeldClient>,
    net_clients: BTreeMap<String, String>,
}

fn read_client_token(conn: &mut TcpStream, peer: &SocketAddr, nonce: &str) -> Option<Token> {
    if let Err(e) = conn.set_read_timeout(Some(TOKEN_READ_TIMEOUT)) {
        warn!("round: failed to set read timeout for {} ({})", peer, &e);
    }
    let token = match Token::read_from(conn) {
        Ok(Some(v)) => v,
        Ok(None) => {
            debug!("round: {} closed without sending a token", peer);
            return None;
        }
        Err(e) => {
            warn!("round: dropping {} ({})", peer, &e);
            return None;
        }
    };
    if token.nonce != nonce {
        warn!("round: dropping {} with a mismatched nonce", peer);
        return None;
    }
    if let Err(e) = conn.set_read_timeout(None) {
        warn!("round: failed to clear read timeout for {} ({})", peer, &e);
    }
    Some(token)
}

impl<'a> BarrierRound<'a> {
    pub fn new(ctx: &'a SyncServiceContext, expected: u32) -> Self {
        Self {
            ctx,
            expected,
            remaining: expected,
            command: None,
            clients: Vec::with_capacity(expected as usize),
            net_clients: BTreeMap::new(),
        }
    }

    pub fn run(mut self, listener: &TcpListener) -> Result<RoundStatus> {
        debug!("round: waiting for {} clients", self.expected);
        while self.remaining > 0 {
            let (conn, peer) = accept_with_retry(listener, "round")?;
            let request_time = self.ctx.reference_now();
            if let Some(status) = self.admit(conn, peer, request_time)? {
                return Ok(status);
            }
        }
        self.complete()
    }

    /// Validate and account for one connection. Returns the round's status
    /// if this connection ends the round early.
    fn admit(
        &mut self,
        mut conn: TcpStream,
        peer: SocketAddr,
        request_time: f64,
    ) -> Result<Option<RoundStatus>> {
        let token = match read_client_token(&mut conn, &peer, &self.ctx.nonce) {
            Some(v) => v,
            None => return Ok(None),
        };

        let mut client_ts = None;
        let mut addresses = None;
        match token.command {
            Command::Fail => {
                let msg = match token.payload.trim() {
                    "" => format!("worker at {} failed", peer),
                    msg => msg.to_string(),
                };
                return Ok(Some(RoundStatus::Failed(msg)));
            }
            Command::Nsrq => {
                warn!("round: dropping nameserver request from {}", peer);
                return Ok(None);
            }
            Command::Time => match parse_time_request(&token.payload) {
                Ok(ts) => client_ts = Some(ts),
                Err(e) => {
                    warn!("round: dropping {} ({:#})", peer, &e);
                    return Ok(None);
                }
            },
            Command::Tnet => match serde_json::from_str::<TnetRequest>(&token.payload) {
                Ok(req) => {
                    client_ts = Some(req.client_ts);
                    addresses = Some(req.addresses);
                }
                Err(e) => {
                    warn!("round: dropping {}, invalid tnet payload ({})", peer, &e);
                    return Ok(None);
                }
            },
            Command::Rslt => {
                if let Err(e) = serde_json::from_str::<serde_json::Value>(&token.payload) {
                    warn!("round: dropping {}, invalid result payload ({})", peer, &e);
                    return Ok(None);
                }
            }
            Command::Sync => {}
        }

        match self.command {
            Some(cmd) if cmd != token.command => bail!(
                "round: {} sent {} into a round of {} with {} of {} clients outstanding",
                peer,
                token.command,
                cmd,
                self.remaining,
                self.expected
            ),
            _ => self.command = Some(token.command),
        }

        if let Some(addresses) = addresses {
            self.net_clients.extend(addresses.into_iter());
        }
        if token.command == Command::Rslt {
            let path = self.ctx.round_result_path(self.remaining);
            fs::write(&path, &token.payload)
                .with_context(|| format!("failed to write {:?}", &path))?;
        }

        self.remaining -= 1;
        debug!(
            "round: {} from {} ({} of {} outstanding)",
            token.command, peer, self.remaining, self.expected
        );
        self.clients.push(HeldClient {
            conn,
            peer,
            token,
            request_time,
            client_ts,
        });
        Ok(None)
    }

    /// Everyone's in. Answer all clients and hand any announced addresses to
    /// the nameserver.
    fn complete(self) -> Result<RoundStatus> {
        let command = self.command.unwrap_or(Command::Sync);
        if command == Command::Sync && self.ctx.step_interval > 0.0 {
            debug!("round: delaying release by {}s", self.ctx.step_interval);
            sleep_secs(self.ctx.step_interval);
        }

        let reply_start = self.ctx.reference_now();
        let mut nr_lost = 0;
        for mut client in self.clients.into_iter() {
            let payload = match client.client_ts {
                Some(client_ts) => TimeReply {
                    client_ts,
                    request_time: client.request_time,
                    reply_start,
                    reply_time: self.ctx.reference_now(),
                }
                .encode(),
                None if command == Command::Sync => client.token.payload.clone(),
                None => String::new(),
            };
            let reply = Token::new(client.token.command, &self.ctx.nonce, &payload);
            if let Err(e) = reply.write_to(&mut client.conn) {
                warn!("round: failed to answer {} ({})", &client.peer, &e);
                nr_lost += 1;
            }
        }

        info!(
            "round: released {} {} clients in {}{}",
            self.expected,
            command,
            format_duration(self.ctx.reference_now() - reply_start),
            if nr_lost > 0 {
                format!(", {} unreachable", nr_lost)
            } else {
                "".into()
            }
        );

        if !self.net_clients.is_empty() {
            nameserver::announce(self.ctx, &self.net_clients)?;
        }

        Ok(match command {
            Command::Rslt => RoundStatus::Finished,
            _ => RoundStatus::Continue,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{BarrierRound, RoundStatus};
    use crate::context::{test_context, SyncServiceContext};
    use crate::nameserver::NameServer;
    use cb_intf::{Command, NsMessage, TimeReply, Token};
    use std::fs;
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::thread;
    use std::time::Duration;

    fn listen() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn send(addr: &SocketAddr, command: Command, nonce: &str, payload: &str) -> TcpStream {
        let mut conn = TcpStream::connect(addr).unwrap();
        Token::new(command, nonce, payload)
            .write_to(&mut conn)
            .unwrap();
        conn
    }

    fn spawn_round(
        ctx: SyncServiceContext,
        listener: TcpListener,
        expected: u32,
    ) -> thread::JoinHandle<anyhow::Result<RoundStatus>> {
        thread::spawn(move || BarrierRound::new(&ctx, expected).run(&listener))
    }

    #[test]
    fn test_sync_round() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let (listener, addr) = listen();
        let jh = spawn_round(test_context(dir.path(), 3), listener, 3);

        let clients: Vec<_> = (0..3)
            .map(|i| {
                thread::spawn(move || {
                    let mut conn = send(&addr, Command::Sync, "test-nonce", &format!("tok-{}", i));
                    Token::read_from(&mut conn).unwrap().unwrap()
                })
            })
            .collect();

        assert_eq!(jh.join().unwrap().unwrap(), RoundStatus::Continue);
        for (i, client) in clients.into_iter().enumerate() {
            let reply = client.join().unwrap();
            assert_eq!(reply.command, Command::Sync);
            assert_eq!(reply.payload, format!("tok-{}", i));
        }
    }

    #[test]
    fn test_barrier_holds_until_all_arrive() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let (listener, addr) = listen();
        let jh = spawn_round(test_context(dir.path(), 3), listener, 3);

        let mut early: Vec<TcpStream> = (0..2)
            .map(|_| send(&addr, Command::Sync, "test-nonce", ""))
            .collect();
        for conn in early.iter_mut() {
            conn.set_read_timeout(Some(Duration::from_millis(300)))
                .unwrap();
            assert!(Token::read_from(conn).is_err());
            conn.set_read_timeout(None).unwrap();
        }
        assert!(!jh.is_finished());

        let mut last = send(&addr, Command::Sync, "test-nonce", "");
        assert!(Token::read_from(&mut last).unwrap().is_some());
        for conn in early.iter_mut() {
            assert!(Token::read_from(conn).unwrap().is_some());
        }
        assert_eq!(jh.join().unwrap().unwrap(), RoundStatus::Continue);
    }

    #[test]
    fn test_bad_nonce_and_garbage_are_dropped() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let (listener, addr) = listen();
        let jh = spawn_round(test_context(dir.path(), 1), listener, 1);

        let mut bad = send(&addr, Command::Sync, "other-job", "");
        assert!(Token::read_from(&mut bad).unwrap().is_none());

        let mut garbage = TcpStream::connect(&addr).unwrap();
        std::io::Write::write_all(&mut garbage, b"GET / HTTP").unwrap();
        assert!(Token::read_from(&mut garbage).unwrap().is_none());

        let mut bad_time = send(&addr, Command::Time, "test-nonce", "not-a-number");
        assert!(Token::read_from(&mut bad_time).unwrap().is_none());

        let mut good = send(&addr, Command::Sync, "test-nonce", "");
        assert!(Token::read_from(&mut good).unwrap().is_some());
        assert_eq!(jh.join().unwrap().unwrap(), RoundStatus::Continue);
    }

    #[test]
    fn test_time_round() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let (listener, addr) = listen();
        let jh = spawn_round(test_context(dir.path(), 2), listener, 2);

        let clients: Vec<_> = (0..2)
            .map(|i| {
                thread::spawn(move || {
                    let client_ts = 1000.0 + i as f64;
                    let mut conn =
                        send(&addr, Command::Time, "test-nonce", &format!("{}", client_ts));
                    let reply = Token::read_from(&mut conn).unwrap().unwrap();
                    (client_ts, TimeReply::parse(&reply.payload).unwrap())
                })
            })
            .collect();

        assert_eq!(jh.join().unwrap().unwrap(), RoundStatus::Continue);
        for client in clients {
            let (client_ts, reply) = client.join().unwrap();
            assert_eq!(reply.client_ts, client_ts);
            assert!(reply.request_time <= reply.reply_start);
            assert!(reply.reply_start <= reply.reply_time);
        }
    }

    #[test]
    fn test_result_round() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), 2);
        let (listener, addr) = listen();
        let jh = spawn_round(ctx.clone(), listener, 2);

        let mut first = send(&addr, Command::Rslt, "test-nonce", "{\"worker\": 1}");
        thread::sleep(Duration::from_millis(100));
        let mut second = send(&addr, Command::Rslt, "test-nonce", "{\"worker\": 2}");
        assert!(Token::read_from(&mut first).unwrap().is_some());
        assert!(Token::read_from(&mut second).unwrap().is_some());

        assert_eq!(jh.join().unwrap().unwrap(), RoundStatus::Finished);
        assert_eq!(
            fs::read_to_string(ctx.round_result_path(2)).unwrap(),
            "{\"worker\": 1}"
        );
        assert_eq!(
            fs::read_to_string(ctx.round_result_path(1)).unwrap(),
            "{\"worker\": 2}"
        );
    }

    #[test]
    fn test_fail_ends_round() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let (listener, addr) = listen();
        let jh = spawn_round(test_context(dir.path(), 3), listener, 3);

        let mut waiting = send(&addr, Command::Sync, "test-nonce", "");
        let _failing = send(&addr, Command::Fail, "test-nonce", "disk full");

        assert_eq!(
            jh.join().unwrap().unwrap(),
            RoundStatus::Failed("disk full".into())
        );
        // The waiting client is never released.
        assert!(Token::read_from(&mut waiting).unwrap().is_none());
    }

    #[test]
    fn test_command_mismatch_is_fatal() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let (listener, addr) = listen();
        let jh = spawn_round(test_context(dir.path(), 2), listener, 2);

        let _sync = send(&addr, Command::Sync, "test-nonce", "");
        thread::sleep(Duration::from_millis(100));
        let _time = send(&addr, Command::Time, "test-nonce", "1.0");
        assert!(jh.join().unwrap().is_err());
    }

    #[test]
    fn test_tnet_feeds_nameserver() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let (ns_listener, ns_addr) = listen();
        thread::spawn(move || NameServer::new("test-nonce").serve(&ns_listener));

        let mut ctx = test_context(dir.path(), 2);
        ctx.nameserver_addr = ns_addr;
        let (listener, addr) = listen();
        let jh = spawn_round(ctx, listener, 2);

        let clients: Vec<_> = (0..2)
            .map(|i| {
                thread::spawn(move || {
                    let payload = format!(
                        "{{\"client_ts\": 5.0, \"addresses\": {{\"server-{}\": \"10.0.0.{}\"}}}}",
                        i, i
                    );
                    let mut conn = send(&addr, Command::Tnet, "test-nonce", &payload);
                    Token::read_from(&mut conn).unwrap().unwrap()
                })
            })
            .collect();
        assert_eq!(jh.join().unwrap().unwrap(), RoundStatus::Continue);
        for client in clients {
            assert_eq!(client.join().unwrap().command, Command::Tnet);
        }

        let rqst = NsMessage::rqst(vec!["server-0".to_string(), "server-1".to_string()]);
        let mut conn = send(
            &ns_addr,
            Command::Nsrq,
            "test-nonce",
            &serde_json::to_string(&rqst).unwrap(),
        );
        let reply = Token::read_from(&mut conn).unwrap().unwrap();
        let map: cb_intf::NsReply = serde_json::from_str(&reply.payload).unwrap();
        assert_eq!(map["server-0"], "10.0.0.0");
        assert_eq!(map["server-1"], "10.0.0.1");
    }
}
