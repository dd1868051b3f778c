//! Connection state machines
//!
//! Client: `Start -> Connecting -> Handshaking -> Sending -> Receiving -> done`
//!
//! Server: `Accepting -> Handshaking -> Receiving -> Sending -> done`
//!
//! Each `poll` advances until the endpoint would block, then parks with the
//! matching [`Interest`]. Any error ends the task with a [`Failure`]; the
//! session and endpoint it owned are dropped (and so closed) with it.
//!
//! The step helpers also work on blocking sessions, where they run to
//! completion in one call.

use super::frame::FrameDecoder;
use super::{Failure, FailureKind};
use crate::net::{Endpoint, Listener, Transport};
use crate::sched::{Interest, Step, Task};
use crate::tls::{Handshake, TlsConfig, TlsError, TlsSession};
use bytes::{Buf, Bytes};
use std::mem;
use std::sync::Arc;
use tracing::{debug, trace};

pub(crate) type TaskResult = Result<(), Failure>;

const READ_CHUNK: usize = 4096;

/// One handshake step; `None` once established
pub(crate) fn handshake_step(session: &mut TlsSession) -> Result<Option<Interest>, Failure> {
    Ok(match session.poll_handshake()? {
        Handshake::Done => None,
        Handshake::WantRead => Some(Interest::Read),
        Handshake::WantWrite => Some(Interest::Write),
    })
}

/// Write as much of `out` as the session accepts; `true` once all is sent
pub(crate) fn send_step(session: &mut TlsSession, out: &mut Bytes) -> Result<bool, Failure> {
    while out.has_remaining() {
        match session.write(out.chunk()) {
            Ok(0) => return Err(TlsError::InvalidState(session.state()).into()),
            Ok(n) => out.advance(n),
            Err(e) if e.is_would_block() => return Ok(false),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

/// Read until a complete frame is available
pub(crate) fn receive_step(
    session: &mut TlsSession,
    decoder: &mut FrameDecoder,
) -> Result<Option<Bytes>, Failure> {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        if let Some(frame) = decoder.next_frame()? {
            return Ok(Some(frame));
        }
        match session.read(&mut buf) {
            Ok(0) => {
                return Err(Failure::new(
                    FailureKind::PeerClosed,
                    format!("peer closed with {} bytes of a frame buffered", decoder.buffered()),
                ))
            }
            Ok(n) => decoder.feed(&buf[..n]),
            Err(e) if e.is_would_block() => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
}

enum Next<P> {
    Continue(P),
    Park(P, Interest),
    Finished,
}

fn session_ready(session: &TlsSession, interest: Interest) -> bool {
    match interest {
        Interest::Read => session.is_readable(),
        Interest::Write => session.is_writable(),
        Interest::Yield => true,
    }
}

enum ClientPhase {
    Start,
    Connecting(Endpoint),
    Handshaking(TlsSession),
    Sending(TlsSession, Bytes),
    Receiving(TlsSession, FrameDecoder),
    Done,
}

/// Client side of one echo exchange
pub(crate) struct ClientTask {
    name: String,
    transport: Arc<dyn Transport>,
    port: u16,
    config: Arc<TlsConfig>,
    payload: Bytes,
    phase: ClientPhase,
}

impl ClientTask {
    pub(crate) fn new(
        name: String,
        transport: Arc<dyn Transport>,
        port: u16,
        config: Arc<TlsConfig>,
        payload: Bytes,
    ) -> Self {
        ClientTask {
            name,
            transport,
            port,
            config,
            payload,
            phase: ClientPhase::Start,
        }
    }

    fn advance(&mut self, phase: ClientPhase) -> Result<Next<ClientPhase>, Failure> {
        match phase {
            ClientPhase::Start => {
                let endpoint = self.transport.start_connect(self.port)?;
                Ok(Next::Continue(ClientPhase::Connecting(endpoint)))
            }
            ClientPhase::Connecting(mut endpoint) => {
                if !endpoint.finish_connect()? {
                    return Ok(Next::Park(ClientPhase::Connecting(endpoint), Interest::Write));
                }
                let session = self.config.session(endpoint)?;
                Ok(Next::Continue(ClientPhase::Handshaking(session)))
            }
            ClientPhase::Handshaking(mut session) => match handshake_step(&mut session)? {
                Some(interest) => Ok(Next::Park(ClientPhase::Handshaking(session), interest)),
                None => {
                    trace!(task = %self.name, "handshake done");
                    let out = super::frame::encode(&self.payload);
                    Ok(Next::Continue(ClientPhase::Sending(session, out)))
                }
            },
            ClientPhase::Sending(mut session, mut out) => {
                if !send_step(&mut session, &mut out)? {
                    return Ok(Next::Park(ClientPhase::Sending(session, out), Interest::Write));
                }
                Ok(Next::Continue(ClientPhase::Receiving(session, FrameDecoder::new())))
            }
            ClientPhase::Receiving(mut session, mut decoder) => {
                let Some(echo) = receive_step(&mut session, &mut decoder)? else {
                    return Ok(Next::Park(ClientPhase::Receiving(session, decoder), Interest::Read));
                };
                if echo != self.payload {
                    return Err(Failure::assertion(format!(
                        "echo mismatch: sent {} bytes, got {} bytes back",
                        self.payload.len(),
                        echo.len()
                    )));
                }
                session.close()?;
                Ok(Next::Finished)
            }
            ClientPhase::Done => Ok(Next::Finished),
        }
    }
}

impl Task for ClientTask {
    type Output = TaskResult;

    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&mut self) -> Step<TaskResult> {
        loop {
            let phase = mem::replace(&mut self.phase, ClientPhase::Done);
            match self.advance(phase) {
                Ok(Next::Continue(next)) => self.phase = next,
                Ok(Next::Park(next, interest)) => {
                    self.phase = next;
                    return Step::Pending(interest);
                }
                Ok(Next::Finished) => return Step::Ready(Ok(())),
                Err(failure) => {
                    debug!(task = %self.name, %failure, "client task failed");
                    return Step::Ready(Err(failure));
                }
            }
        }
    }

    fn is_ready(&self, interest: Interest) -> bool {
        match &self.phase {
            ClientPhase::Connecting(endpoint) => endpoint.is_writable(),
            ClientPhase::Handshaking(session)
            | ClientPhase::Sending(session, _)
            | ClientPhase::Receiving(session, _) => session_ready(session, interest),
            ClientPhase::Start | ClientPhase::Done => true,
        }
    }
}

enum ServerPhase {
    Accepting,
    Handshaking(TlsSession),
    Receiving(TlsSession, FrameDecoder),
    Sending(TlsSession, Bytes),
    Done,
}

/// Server side of one echo exchange
///
/// Accepts whichever peer the shared listener hands out next.
pub(crate) struct ServerTask {
    name: String,
    listener: Arc<dyn Listener>,
    config: Arc<TlsConfig>,
    phase: ServerPhase,
}

impl ServerTask {
    pub(crate) fn new(name: String, listener: Arc<dyn Listener>, config: Arc<TlsConfig>) -> Self {
        ServerTask {
            name,
            listener,
            config,
            phase: ServerPhase::Accepting,
        }
    }

    fn advance(&mut self, phase: ServerPhase) -> Result<Next<ServerPhase>, Failure> {
        match phase {
            ServerPhase::Accepting => match self.listener.try_accept()? {
                Some(endpoint) => {
                    let session = self.config.session(endpoint)?;
                    Ok(Next::Continue(ServerPhase::Handshaking(session)))
                }
                None => Ok(Next::Park(ServerPhase::Accepting, Interest::Read)),
            },
            ServerPhase::Handshaking(mut session) => match handshake_step(&mut session)? {
                Some(interest) => Ok(Next::Park(ServerPhase::Handshaking(session), interest)),
                None => Ok(Next::Continue(ServerPhase::Receiving(session, FrameDecoder::new()))),
            },
            ServerPhase::Receiving(mut session, mut decoder) => {
                match receive_step(&mut session, &mut decoder)? {
                    Some(frame) => {
                        let out = super::frame::encode(&frame);
                        Ok(Next::Continue(ServerPhase::Sending(session, out)))
                    }
                    None => Ok(Next::Park(ServerPhase::Receiving(session, decoder), Interest::Read)),
                }
            }
            ServerPhase::Sending(mut session, mut out) => {
                if !send_step(&mut session, &mut out)? {
                    return Ok(Next::Park(ServerPhase::Sending(session, out), Interest::Write));
                }
                session.close()?;
                Ok(Next::Finished)
            }
            ServerPhase::Done => Ok(Next::Finished),
        }
    }
}

impl Task for ServerTask {
    type Output = TaskResult;

    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&mut self) -> Step<TaskResult> {
        loop {
            let phase = mem::replace(&mut self.phase, ServerPhase::Done);
            match self.advance(phase) {
                Ok(Next::Continue(next)) => self.phase = next,
                Ok(Next::Park(next, interest)) => {
                    self.phase = next;
                    return Step::Pending(interest);
                }
                Ok(Next::Finished) => return Step::Ready(Ok(())),
                Err(failure) => {
                    debug!(task = %self.name, %failure, "server task failed");
                    return Step::Ready(Err(failure));
                }
            }
        }
    }

    fn is_ready(&self, interest: Interest) -> bool {
        match &self.phase {
            ServerPhase::Accepting => self.listener.is_acceptable(),
            ServerPhase::Handshaking(session)
            | ServerPhase::Receiving(session, _)
            | ServerPhase::Sending(session, _) => session_ready(session, interest),
            ServerPhase::Done => true,
        }
    }
}
