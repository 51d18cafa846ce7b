//! One live session to a Redis endpoint: handshake, single-command and
//! pipelined execution, push-frame reads, and `MULTI` discipline (§4.3).

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;

use crate::command::{CallOptions, Command};
use crate::error::{Redirect, RedisCoreError, Result};
use crate::resp::{Argument, Decoder, Encoder, Value};
use crate::transport::{RecvOutcome, Transport, DEFAULT_RECV_BUFFER};
use tracing::{debug, trace};

/// Commands that may only be issued on a connection dedicated to push reads
/// (§4.3 "Single command").
const RESERVED_PUSH_COMMANDS: [&str; 5] = ["MONITOR", "SUBSCRIBE", "PSUBSCRIBE", "UNSUBSCRIBE", "PUNSUBSCRIBE"];

/// The connection's lifecycle state (§3 Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Fresh,
    Handshaking,
    Ready,
    InMulti,
    AwaitingPushReplies,
    Closed,
}

/// Requested RESP protocol version for the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespVersion {
    Auto,
    Two,
    Three,
}

impl Default for RespVersion {
    fn default() -> Self {
        RespVersion::Auto
    }
}

/// Handshake and connection-scoped settings (a slice of the full `Config` in
/// §6, scoped to what one `Connection` needs to establish itself).
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_name: Option<String>,
    pub resp_version: RespVersion,
    pub database: u64,
    /// Whether this connection may run `MULTI` (a pool hands these out for
    /// `connection()`-scoped transactional use; ordinary pooled connections
    /// used for single calls should not set this).
    pub allow_multi: bool,
    pub connect_timeout: Option<Duration>,
    /// Per-call receive timeout used for every non-push read.
    pub socket_timeout: Option<Duration>,
}

/// One live connection: owns a [`Transport`], an [`Encoder`], and a
/// [`Decoder`].
#[derive(Debug)]
pub struct Connection {
    transport: Transport,
    encoder: Encoder,
    decoder: Decoder,
    recv_buf: BytesMut,
    state: ConnState,
    peer: Option<SocketAddr>,
    moved: Option<Redirect>,
    ask: Option<Redirect>,
    selected_db: u64,
    allow_multi: bool,
    socket_timeout: Option<Duration>,
}

enum DecodeOutcome {
    Value(Value),
    TimedOut,
}

impl Connection {
    /// Runs the handshake (§4.3) over an already-open transport and returns
    /// a ready-to-use connection.
    pub async fn connect(transport: Transport, opts: &ConnectOptions) -> Result<Connection> {
        let peer = transport.peer();
        let mut conn = Connection {
            transport,
            encoder: Encoder::default(),
            decoder: Decoder::new(false),
            recv_buf: BytesMut::with_capacity(DEFAULT_RECV_BUFFER),
            state: ConnState::Handshaking,
            peer,
            moved: None,
            ask: None,
            selected_db: 0,
            allow_multi: opts.allow_multi,
            socket_timeout: opts.socket_timeout,
        };
        conn.handshake(opts).await?;
        conn.state = ConnState::Ready;
        debug!(peer = ?conn.peer, resp_version = ?opts.resp_version, "connection ready");
        Ok(conn)
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Forces the connection into the `closed` state without touching the
    /// transport — used by a [`crate::pool::Pool`] when it learns a
    /// connection is unhealthy by means other than an I/O error on this
    /// connection itself (e.g. a sibling saw the peer drop).
    pub(crate) fn mark_closed(&mut self) {
        self.state = ConnState::Closed;
    }

    /// Consumes and clears the connection's last-seen `MOVED` redirect, if any.
    pub fn take_moved(&mut self) -> Option<Redirect> {
        self.moved.take()
    }

    /// Consumes and clears the connection's last-seen `ASK` redirect, if any.
    pub fn take_ask(&mut self) -> Option<Redirect> {
        self.ask.take()
    }

    async fn handshake(&mut self, opts: &ConnectOptions) -> Result<()> {
        let force2 = opts.resp_version == RespVersion::Two;
        let force3 = opts.resp_version == RespVersion::Three;

        if !force2 {
            let mut hello = Command::new("HELLO").arg("3");
            if opts.password.is_some() || opts.username.is_some() {
                hello = hello
                    .arg("AUTH")
                    .arg(opts.username.clone().unwrap_or_else(|| "default".to_string()))
                    .arg(opts.password.clone().unwrap_or_default());
            }
            if let Some(name) = &opts.client_name {
                hello = hello.arg("SETNAME").arg(name.clone());
            }
            let reply = self.send_raw_and_read(&hello).await?;
            if reply.is_error() {
                if force3 {
                    return Err(RedisCoreError::reply(reply.as_error_text().unwrap_or_default().to_string()));
                }
                self.decoder = Decoder::new(false);
                self.auth_and_setname_resp2(opts).await?;
            }
        } else {
            self.auth_and_setname_resp2(opts).await?;
        }

        if opts.database != 0 {
            let select = Command::new("SELECT").arg(opts.database.to_string());
            let reply = self.send_raw_and_read(&select).await?;
            if reply.is_error() {
                return Err(RedisCoreError::reply(reply.as_error_text().unwrap_or_default().to_string()));
            }
            self.selected_db = opts.database;
        }
        Ok(())
    }

    async fn auth_and_setname_resp2(&mut self, opts: &ConnectOptions) -> Result<()> {
        if let Some(password) = &opts.password {
            let mut auth = Command::new("AUTH");
            if let Some(username) = &opts.username {
                auth = auth.arg(username.clone());
            }
            auth = auth.arg(password.clone());
            let reply = self.send_raw_and_read(&auth).await?;
            if reply.is_error() {
                return Err(RedisCoreError::reply(reply.as_error_text().unwrap_or_default().to_string()));
            }
        }
        if let Some(name) = &opts.client_name {
            let setname = Command::new("CLIENT").arg("SETNAME").arg(name.clone());
            let reply = self.send_raw_and_read(&setname).await?;
            if reply.is_error() {
                return Err(RedisCoreError::reply(reply.as_error_text().unwrap_or_default().to_string()));
            }
        }
        Ok(())
    }

    async fn send_raw_and_read(&mut self, cmd: &Command) -> Result<Value> {
        let chunks = self.encoder.encode_command(&cmd.args)?;
        if let Err(e) = self.transport.send(&chunks).await {
            self.state = ConnState::Closed;
            return Err(e);
        }
        self.read_reply(self.socket_timeout).await
    }

    /// Validates that `cmd` may run on this connection as a plain call
    /// (not a dedicated push read), and that `MULTI` is only attempted when
    /// `allow_multi` was set on this connection.
    fn validate_call(&self, cmd: &Command) -> Result<String> {
        let name = cmd.name_uppercase().unwrap_or_default();
        if RESERVED_PUSH_COMMANDS.contains(&name.as_str()) {
            return Err(RedisCoreError::protocol(format!(
                "{name} may only be issued on a dedicated push connection via push_command()"
            )));
        }
        if name == "MULTI" && !self.allow_multi {
            return Err(RedisCoreError::protocol("MULTI is not allowed on this connection"));
        }
        Ok(name)
    }

    async fn maybe_select_database(&mut self, database: Option<u64>) -> Result<()> {
        let Some(db) = database else { return Ok(()) };
        if db == self.selected_db {
            return Ok(());
        }
        let select = Command::new("SELECT").arg(db.to_string());
        let reply = self.send_raw_and_read(&select).await?;
        if reply.is_error() {
            return Err(RedisCoreError::reply(reply.as_error_text().unwrap_or_default().to_string()));
        }
        self.selected_db = db;
        Ok(())
    }

    /// Executes exactly one command, honoring `options.database`/`asking`,
    /// and tracks `MULTI`/`SELECT`/`MOVED`/`ASK` connection state as a side
    /// effect (§4.3).
    pub async fn call(&mut self, cmd: &Command, options: &CallOptions) -> Result<Value> {
        if self.is_closed() {
            return Err(RedisCoreError::communication(self.peer, std::io::Error::new(std::io::ErrorKind::NotConnected, "connection is closed")));
        }
        let name = self.validate_call(cmd)?;
        trace!(command = %name, peer = ?self.peer, "call");
        self.maybe_select_database(options.database).await?;

        let mut arg_lists: Vec<Vec<Argument>> = Vec::with_capacity(2);
        if options.asking {
            arg_lists.push(vec![Argument::from("ASKING")]);
        }
        arg_lists.push(cmd.args.clone());

        let chunks = self.encoder.encode_pipeline(&arg_lists)?;
        if let Err(e) = self.transport.send(&chunks).await {
            self.state = ConnState::Closed;
            return Err(e);
        }

        if options.asking {
            let ask_ack = self.read_reply(self.socket_timeout).await?;
            if ask_ack.is_error() {
                return Err(RedisCoreError::reply(ask_ack.as_error_text().unwrap_or_default().to_string()));
            }
        }

        let reply = self.read_reply(self.socket_timeout).await?;
        self.update_redirect_flags(&reply);
        self.track_transaction_and_select_state(&name, cmd, &reply);

        if reply.is_error() {
            return Err(RedisCoreError::reply(reply.as_error_text().unwrap_or_default().to_string()));
        }
        Ok(reply)
    }

    /// Executes a pipeline. On success, returns every reply in order; if
    /// any reply is an error, returns `Err(PipelinedErrors { results })`
    /// carrying every positional result (§4.3 Pipelining).
    pub async fn call_pipeline(&mut self, cmds: &[Command], options: &CallOptions) -> Result<Vec<Value>> {
        if self.is_closed() {
            return Err(RedisCoreError::communication(self.peer, std::io::Error::new(std::io::ErrorKind::NotConnected, "connection is closed")));
        }
        let mut names = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            names.push(self.validate_call(cmd)?);
        }
        self.maybe_select_database(options.database).await?;

        let arg_lists: Vec<Vec<Argument>> = cmds.iter().map(|c| c.args.clone()).collect();
        let chunks = self.encoder.encode_pipeline(&arg_lists)?;
        if let Err(e) = self.transport.send(&chunks).await {
            self.state = ConnState::Closed;
            return Err(e);
        }

        let mut results = Vec::with_capacity(cmds.len());
        let mut any_error = false;
        for (cmd, name) in cmds.iter().zip(names.iter()) {
            // A transport/protocol error during the read phase kills the
            // connection and propagates directly, not wrapped in
            // PipelinedErrors (which is only for reply-level errors).
            let reply = self.read_reply(self.socket_timeout).await?;
            self.update_redirect_flags(&reply);
            self.track_transaction_and_select_state(name, cmd, &reply);
            any_error |= reply.is_error();
            results.push(Ok(reply));
        }

        if any_error {
            Err(RedisCoreError::PipelinedErrors { results })
        } else {
            Ok(results.into_iter().map(|r| r.expect("checked above")).collect())
        }
    }

    /// Writes a command without reading a reply — the push-connection
    /// write half of `SUBSCRIBE`/`PSUBSCRIBE`/etc.
    pub async fn push_command(&mut self, cmd: &Command) -> Result<()> {
        let chunks = self.encoder.encode_command(&cmd.args)?;
        if let Err(e) = self.transport.send(&chunks).await {
            self.state = ConnState::Closed;
            return Err(e);
        }
        self.state = ConnState::AwaitingPushReplies;
        Ok(())
    }

    /// Reads the next frame on a push connection. Returns `Ok(None)` on
    /// timeout without harming the connection; any transport error still
    /// closes it.
    pub async fn pushed_message(&mut self, timeout: Option<Duration>) -> Result<Option<Value>> {
        match self.fill_and_decode(timeout.or(self.socket_timeout)).await? {
            DecodeOutcome::Value(v) => Ok(Some(v)),
            DecodeOutcome::TimedOut => Ok(None),
        }
    }

    /// Best-effort `DISCARD` run when a pool releases an `allow_multi`
    /// connection that is mid-transaction; failures close the connection
    /// rather than risk a contaminated transaction leaking to the next
    /// borrower (§4.3 MULTI guard).
    pub async fn discard_pending_transaction(&mut self) {
        if self.state != ConnState::InMulti {
            return;
        }
        let discard = Command::new("DISCARD");
        let _ = self.call(&discard, &CallOptions::default()).await;
        if self.state == ConnState::InMulti {
            self.state = ConnState::Closed;
        }
    }

    fn track_transaction_and_select_state(&mut self, name: &str, cmd: &Command, reply: &Value) {
        if name == "MULTI" && !reply.is_error() {
            self.state = ConnState::InMulti;
        } else if (name == "EXEC" || name == "DISCARD") && self.state == ConnState::InMulti {
            self.state = ConnState::Ready;
        } else if name == "SELECT" && !reply.is_error() {
            if let Some(Argument::Text(db)) = cmd.args.get(1) {
                if let Ok(n) = db.parse::<u64>() {
                    self.selected_db = n;
                }
            }
        }
    }

    fn update_redirect_flags(&mut self, reply: &Value) {
        self.moved = None;
        self.ask = None;
        if let Some(text) = reply.as_error_text() {
            match RedisCoreError::reply(text.to_string()).as_redirect() {
                Some(Redirect::Moved { slot, addr }) => self.moved = Some(Redirect::Moved { slot, addr }),
                Some(Redirect::Ask { slot, addr }) => self.ask = Some(Redirect::Ask { slot, addr }),
                None => {}
            }
        }
    }

    async fn fill_and_decode(&mut self, timeout: Option<Duration>) -> Result<DecodeOutcome> {
        loop {
            match self.decoder.extract(&mut self.recv_buf) {
                Ok(Some(v)) => return Ok(DecodeOutcome::Value(v)),
                Ok(None) => {}
                Err(e) => {
                    self.state = ConnState::Closed;
                    return Err(e);
                }
            }
            match self.transport.recv(&mut self.recv_buf, timeout).await {
                Ok(RecvOutcome::Data(_)) => continue,
                Ok(RecvOutcome::Eof) => {
                    self.state = ConnState::Closed;
                    return Err(RedisCoreError::communication(
                        self.peer,
                        std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed by peer"),
                    ));
                }
                Ok(RecvOutcome::TimedOut) => return Ok(DecodeOutcome::TimedOut),
                Err(e) => {
                    self.state = ConnState::Closed;
                    return Err(e);
                }
            }
        }
    }

    async fn read_reply(&mut self, timeout: Option<Duration>) -> Result<Value> {
        match self.fill_and_decode(timeout).await? {
            DecodeOutcome::Value(v) => {
                if v.is_push() {
                    self.state = ConnState::Closed;
                    return Err(RedisCoreError::protocol("unexpected push frame outside push mode"));
                }
                Ok(v)
            }
            DecodeOutcome::TimedOut => {
                self.state = ConnState::Closed;
                Err(RedisCoreError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::ValueData;
    use tokio::io::AsyncWriteExt;

    async fn paired_transports() -> (Transport, Transport) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Transport::Tcp(client), Transport::Tcp(server))
    }

    #[tokio::test]
    async fn handshake_falls_back_to_resp2_on_hello_error() {
        let (client_t, mut server_t) = paired_transports().await;
        let server = tokio::spawn(async move {
            drain_one_command(&mut server_t).await;
            reply_error(&mut server_t, "ERR unknown command 'HELLO'").await;
        });

        let opts = ConnectOptions { resp_version: RespVersion::Auto, ..Default::default() };
        let conn = Connection::connect(client_t, &opts).await.unwrap();
        assert_eq!(conn.state(), ConnState::Ready);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn forced_resp3_fails_when_hello_errors() {
        let (client_t, mut server_t) = paired_transports().await;
        let server = tokio::spawn(async move {
            drain_one_command(&mut server_t).await;
            reply_error(&mut server_t, "ERR unknown command 'HELLO'").await;
        });

        let opts = ConnectOptions { resp_version: RespVersion::Three, ..Default::default() };
        let err = Connection::connect(client_t, &opts).await.unwrap_err();
        assert!(matches!(err, RedisCoreError::Reply { .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn reserved_push_command_rejected_on_plain_connection() {
        let (client_t, mut server_t) = paired_transports().await;
        let server = tokio::spawn(async move {
            drain_one_command(&mut server_t).await;
            reply_simple(&mut server_t, "OK").await;
        });
        let opts = ConnectOptions::default();
        let mut conn = Connection::connect(client_t, &opts).await.unwrap();
        let err = conn.call(&Command::new("SUBSCRIBE").arg("chan"), &CallOptions::default()).await.unwrap_err();
        assert!(matches!(err, RedisCoreError::Protocol(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn multi_rejected_unless_allow_multi() {
        let (client_t, mut server_t) = paired_transports().await;
        let server = tokio::spawn(async move {
            drain_one_command(&mut server_t).await;
            reply_simple(&mut server_t, "OK").await;
        });
        let mut conn = Connection::connect(client_t, &ConnectOptions::default()).await.unwrap();
        let err = conn.call(&Command::new("MULTI"), &CallOptions::default()).await.unwrap_err();
        assert!(matches!(err, RedisCoreError::Protocol(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn pipeline_collects_errors_positionally() {
        let (client_t, mut server_t) = paired_transports().await;
        let server = tokio::spawn(async move {
            drain_one_command(&mut server_t).await; // HELLO
            reply_error(&mut server_t, "ERR unknown command 'HELLO'").await;
            // SET -> OK, GET -> error
            reply_simple(&mut server_t, "OK").await;
            reply_error(&mut server_t, "ERR boom").await;
        });

        let mut conn = Connection::connect(client_t, &ConnectOptions::default()).await.unwrap();
        let cmds = vec![Command::new("SET").arg("a").arg("b"), Command::new("GET").arg("a")];
        let err = conn.call_pipeline(&cmds, &CallOptions::default()).await.unwrap_err();
        match err {
            RedisCoreError::PipelinedErrors { results } => {
                assert_eq!(results.len(), 2);
                assert!(matches!(results[0].as_ref().unwrap().data, ValueData::SimpleString(ref s) if s == "OK"));
                assert!(results[1].as_ref().unwrap().is_error());
            }
            other => panic!("expected PipelinedErrors, got {other:?}"),
        }
        server.await.unwrap();
    }

    async fn drain_one_command(transport: &mut Transport) {
        let mut buf = BytesMut::new();
        let mut decoder = Decoder::new(false);
        loop {
            if decoder.extract(&mut buf).unwrap().is_some() {
                return;
            }
            match transport.recv(&mut buf, None).await.unwrap() {
                RecvOutcome::Data(_) => continue,
                _ => panic!("expected data"),
            }
        }
    }

    async fn reply_simple(transport: &mut Transport, text: &str) {
        write_raw(transport, format!("+{text}\r\n").as_bytes()).await;
    }

    async fn reply_error(transport: &mut Transport, text: &str) {
        write_raw(transport, format!("-{text}\r\n").as_bytes()).await;
    }

    async fn write_raw(transport: &mut Transport, bytes: &[u8]) {
        match transport {
            Transport::Tcp(s) => s.write_all(bytes).await.unwrap(),
            _ => unreachable!(),
        }
    }
}
