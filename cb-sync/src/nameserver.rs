// Copyright (c) Facebook, Inc. and its affiliates.

//! Peer address rendezvous.
//!
//! Clients announce `name -> address` mappings with `have` and ask for
//! names with `rqst`. A request is answered exactly once, with the full
//! resolved map, as soon as every name it asked for is known. The
//! requesting connection is held open until then and closed after the
//! reply.
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{SocketAddr, TcpListener, TcpStream};

use super::context::SyncServiceContext;
use super::net::{accept_with_retry, TOKEN_READ_TIMEOUT};
use cb_intf::{Command, NsMessage, NsReply, Token};

struct PendingRequest {
    conn: TcpStream,
    peer: SocketAddr,
    wanted: BTreeSet<String>,
    resolved: NsReply,
}

pub struct NameServer {
    nonce: String,
    addresses: BTreeMap<String, String>,
    pending: Vec<PendingRequest>,
}

impl NameServer {
    pub fn new(nonce: &str) -> Self {
        Self {
            nonce: nonce.into(),
            addresses: BTreeMap::new(),
            pending: vec![],
        }
    }

    pub fn nr_pending(&self) -> usize {
        self.pending.len()
    }

    fn read_message(&self, conn: &mut TcpStream, peer: &SocketAddr) -> Option<NsMessage> {
        if let Err(e) = conn.set_read_timeout(Some(TOKEN_READ_TIMEOUT)) {
            warn!("nameserver: failed to set read timeout for {} ({})", peer, &e);
        }
        let token = match Token::read_from(conn) {
            Ok(Some(v)) => v,
            Ok(None) => return None,
            Err(e) => {
                warn!("nameserver: dropping {} ({})", peer, &e);
                return None;
            }
        };
        if token.nonce != self.nonce || token.command != Command::Nsrq {
            warn!(
                "nameserver: dropping {} ({} with {} nonce)",
                peer,
                token.command,
                if token.nonce == self.nonce {
                    "matching"
                } else {
                    "mismatched"
                }
            );
            return None;
        }
        match serde_json::from_str::<NsMessage>(&token.payload) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("nameserver: dropping {}, invalid message ({})", peer, &e);
                None
            }
        }
    }

    fn handle(&mut self, conn: TcpStream, peer: SocketAddr, msg: NsMessage) {
        if !msg.have.is_empty() {
            debug!("nameserver: {} announced {:?}", peer, &msg.have);
            self.addresses.extend(msg.have.into_iter());
        }
        if !msg.rqst.is_empty() {
            debug!("nameserver: {} requested {:?}", peer, &msg.rqst);
            self.pending.push(PendingRequest {
                conn,
                peer,
                wanted: msg.rqst,
                resolved: NsReply::new(),
            });
        }
        self.satisfy_requests();
    }

    fn satisfy_requests(&mut self) {
        for mut req in std::mem::take(&mut self.pending) {
            let PendingRequest {
                wanted, resolved, ..
            } = &mut req;
            wanted.retain(|name| match self.addresses.get(name) {
                Some(addr) => {
                    resolved.insert(name.clone(), addr.clone());
                    false
                }
                None => true,
            });

            if req.wanted.is_empty() {
                self.reply(req);
            } else {
                self.pending.push(req);
            }
        }
    }

    fn reply(&self, mut req: PendingRequest) {
        let payload = match serde_json::to_string(&req.resolved) {
            Ok(v) => v,
            Err(e) => {
                warn!("nameserver: failed to serialize reply to {} ({})", &req.peer, &e);
                return;
            }
        };
        match Token::new(Command::Nsrq, &self.nonce, &payload).write_to(&mut req.conn) {
            Ok(()) => debug!("nameserver: resolved {:?} for {}", &req.resolved, &req.peer),
            Err(e) => warn!("nameserver: failed to answer {} ({})", &req.peer, &e),
        }
    }

    /// Serve until the process is killed. Only returns on a persistent
    /// accept failure.
    pub fn serve(mut self, listener: &TcpListener) -> Result<()> {
        info!("nameserver: serving on {:?}", listener.local_addr()?);
        loop {
            let (mut conn, peer) = accept_with_retry(listener, "nameserver")?;
            if let Some(msg) = self.read_message(&mut conn, &peer) {
                self.handle(conn, peer, msg);
                debug!("nameserver: {} requests pending", self.nr_pending());
            }
        }
    }
}

/// Forward addresses collected during a round to the nameserver.
pub fn announce(ctx: &SyncServiceContext, have: &BTreeMap<String, String>) -> Result<()> {
    let mut conn = TcpStream::connect(&ctx.nameserver_addr)
        .with_context(|| format!("failed to connect to nameserver at {}", &ctx.nameserver_addr))?;
    let payload = serde_json::to_string(&NsMessage::have(have.clone()))?;
    Token::new(Command::Nsrq, &ctx.nonce, &payload)
        .write_to(&mut conn)
        .context("failed to send addresses to nameserver")?;
    debug!("nameserver: forwarded {} addresses", have.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::NameServer;
    use cb_intf::{Command, NsMessage, NsReply, Token};
    use std::collections::BTreeMap;
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::thread;
    use std::time::Duration;

    fn start() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || NameServer::new("ns-nonce").serve(&listener));
        addr
    }

    fn send(addr: &SocketAddr, nonce: &str, msg: &NsMessage) -> TcpStream {
        let mut conn = TcpStream::connect(addr).unwrap();
        Token::new(Command::Nsrq, nonce, &serde_json::to_string(msg).unwrap())
            .write_to(&mut conn)
            .unwrap();
        conn
    }

    fn have(name: &str, addr: &str) -> NsMessage {
        let mut map = BTreeMap::new();
        map.insert(name.to_string(), addr.to_string());
        NsMessage::have(map)
    }

    fn expect_no_reply(conn: &mut TcpStream) {
        conn.set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        assert!(Token::read_from(conn).is_err());
        conn.set_read_timeout(None).unwrap();
    }

    #[test]
    fn test_request_waits_for_all_names() {
        let _ = ::env_logger::try_init();
        let addr = start();

        let mut rqst = send(
            &addr,
            "ns-nonce",
            &NsMessage::rqst(vec!["A".to_string(), "B".to_string()]),
        );
        expect_no_reply(&mut rqst);

        drop(send(&addr, "ns-nonce", &have("A", "10.1.0.1")));
        expect_no_reply(&mut rqst);

        // Wrong nonce doesn't count.
        drop(send(&addr, "other-nonce", &have("B", "10.1.0.99")));
        expect_no_reply(&mut rqst);

        drop(send(&addr, "ns-nonce", &have("B", "10.1.0.2")));
        let reply = Token::read_from(&mut rqst).unwrap().unwrap();
        assert_eq!(reply.command, Command::Nsrq);
        let map: NsReply = serde_json::from_str(&reply.payload).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["A"], "10.1.0.1");
        assert_eq!(map["B"], "10.1.0.2");

        // Exactly one reply, then the connection is closed.
        assert!(Token::read_from(&mut rqst).unwrap().is_none());
    }

    #[test]
    fn test_known_names_resolve_immediately() {
        let _ = ::env_logger::try_init();
        let addr = start();

        drop(send(&addr, "ns-nonce", &have("server", "10.2.0.1")));
        let mut first = send(&addr, "ns-nonce", &NsMessage::rqst(vec!["server".to_string()]));
        let mut second = send(&addr, "ns-nonce", &NsMessage::rqst(vec!["server".to_string()]));

        for conn in vec![&mut first, &mut second].into_iter() {
            let reply = Token::read_from(conn).unwrap().unwrap();
            let map: NsReply = serde_json::from_str(&reply.payload).unwrap();
            assert_eq!(map["server"], "10.2.0.1");
        }
    }
}
