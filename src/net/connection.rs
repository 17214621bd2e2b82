use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::error::{EncodingError, FrameError, HandshakeError};
use crate::net::framing::{self, CloseFrame, Frame, OpCode};
use crate::net::handshake;

/// Server-unique connection identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            Message::Binary(_) => None,
        }
    }
}

/// Something the application should hear about, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Opened,
    Message(Message),
}

struct Fragmented {
    opcode: OpCode,
    payload: Vec<u8>,
}

/// Per-socket protocol state. Performs no I/O: bytes read from the socket go
/// in through `receive`, bytes to write come out through `pending_output`.
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    state: State,
    pending: Vec<u8>,
    events: VecDeque<Event>,
    outbox: VecDeque<Vec<u8>>,
    out_offset: usize,
    fragments: Option<Fragmented>,
    max_message_size: usize,
    accepted_at: Instant,
    opened: bool,
}

impl Connection {
    pub fn new(id: ConnectionId, peer: SocketAddr, max_message_size: usize) -> Self {
        Self {
            id,
            peer,
            state: State::Connecting,
            pending: Vec::new(),
            events: VecDeque::new(),
            outbox: VecDeque::new(),
            out_offset: 0,
            fragments: None,
            max_message_size,
            accepted_at: Instant::now(),
            opened: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    /// Whether the handshake ever completed. Only such connections report a
    /// disconnect.
    pub fn has_opened(&self) -> bool {
        self.opened
    }

    /// Feeds bytes read from the socket.
    pub fn receive(&mut self, bytes: &[u8]) {
        match self.state {
            State::Connecting | State::Open => self.pending.extend_from_slice(bytes),
            // Whatever the peer sends after our Close is irrelevant.
            State::Closing | State::Closed => return,
        }

        if self.state == State::Connecting {
            self.try_handshake();
        }
        if self.state == State::Open {
            self.drain_frames();
        }
    }

    fn try_handshake(&mut self) {
        match handshake::negotiate(&self.pending) {
            Ok(response) => {
                log::info!(
                    "{} handshake complete with {} (path {})",
                    self.id,
                    self.peer,
                    response.request.path
                );
                self.outbox.push_back(response.to_bytes());
                self.pending.drain(..response.consumed);
                self.state = State::Open;
                self.opened = true;
                self.events.push_back(Event::Opened);
            }
            Err(HandshakeError::Incomplete) => {}
            Err(e) => {
                log::warn!("{} handshake with {} rejected: {}", self.id, self.peer, e);
                self.pending.clear();
                self.state = State::Closed;
            }
        }
    }

    fn drain_frames(&mut self) {
        while self.state == State::Open {
            match framing::decode_frame(&self.pending, self.max_message_size) {
                Ok(Some((frame, used))) => {
                    self.pending.drain(..used);
                    if let Err(e) = self.handle_frame(frame) {
                        self.fail(e);
                    }
                }
                Ok(None) => break,
                Err(e) => self.fail(e),
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), FrameError> {
        if !frame.masked {
            return Err(FrameError::UnmaskedClientFrame);
        }

        match frame.opcode {
            OpCode::Ping => {
                log::trace!("{} ping ({} bytes)", self.id, frame.payload.len());
                self.queue_frame(OpCode::Pong, &frame.payload);
            }
            OpCode::Pong => log::trace!("{} pong", self.id),
            OpCode::Close => {
                let close = CloseFrame::parse(&frame.payload)?;
                log::info!(
                    "{} peer closing (code {:?}, reason {:?})",
                    self.id,
                    close.code,
                    close.reason
                );
                let echo = CloseFrame {
                    code: close.code,
                    reason: String::new(),
                };
                self.queue_frame(OpCode::Close, &echo.to_payload());
                self.state = State::Closing;
                self.pending.clear();
            }
            OpCode::Text | OpCode::Binary => {
                if self.fragments.is_some() {
                    return Err(FrameError::InterleavedDataFrame);
                }
                if frame.fin {
                    self.deliver(frame.opcode, frame.payload);
                } else {
                    self.fragments = Some(Fragmented {
                        opcode: frame.opcode,
                        payload: frame.payload,
                    });
                }
            }
            OpCode::Continuation => {
                let fragments = self
                    .fragments
                    .as_mut()
                    .ok_or(FrameError::UnexpectedContinuation)?;
                let total = fragments.payload.len() + frame.payload.len();
                if total > self.max_message_size {
                    return Err(FrameError::TooLarge {
                        len: total as u64,
                        max: self.max_message_size,
                    });
                }
                fragments.payload.extend_from_slice(&frame.payload);
                if frame.fin {
                    if let Some(done) = self.fragments.take() {
                        self.deliver(done.opcode, done.payload);
                    }
                }
            }
        }
        Ok(())
    }

    fn deliver(&mut self, opcode: OpCode, payload: Vec<u8>) {
        let message = match opcode {
            OpCode::Text => match decode_text(payload) {
                Ok(text) => Message::Text(text),
                Err(e) => {
                    log::warn!("{} dropping text message: {}", self.id, e);
                    return;
                }
            },
            _ => Message::Binary(payload),
        };
        self.events.push_back(Event::Message(message));
    }

    fn fail(&mut self, error: FrameError) {
        log::warn!("{} protocol error: {}", self.id, error);
        self.pending.clear();
        self.fragments = None;
        self.close(error.close_code(), &error.to_string());
    }

    fn queue_frame(&mut self, opcode: OpCode, payload: &[u8]) {
        self.outbox.push_back(framing::encode_frame(opcode, payload));
    }

    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Queues a text message. Returns false unless the connection is open.
    pub fn send_text(&mut self, text: &str) -> bool {
        self.send_frame(OpCode::Text, text.as_bytes())
    }

    pub fn send_binary(&mut self, payload: &[u8]) -> bool {
        self.send_frame(OpCode::Binary, payload)
    }

    fn send_frame(&mut self, opcode: OpCode, payload: &[u8]) -> bool {
        if self.state != State::Open {
            return false;
        }
        self.queue_frame(opcode, payload);
        true
    }

    /// Starts a server-initiated close. A connection still in the handshake
    /// is dropped without a response.
    pub fn close(&mut self, code: u16, reason: &str) {
        match self.state {
            State::Connecting => self.state = State::Closed,
            State::Open => {
                self.queue_frame(OpCode::Close, &CloseFrame::new(code, reason).to_payload());
                self.state = State::Closing;
            }
            State::Closing | State::Closed => {}
        }
    }

    /// The socket is gone (EOF, reset, write failure).
    pub fn force_close(&mut self) {
        self.state = State::Closed;
        self.outbox.clear();
        self.out_offset = 0;
    }

    pub fn has_output(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Bytes that still have to be written, front of the queue first.
    pub fn pending_output(&self) -> Option<&[u8]> {
        self.outbox.front().map(|frame| &frame[self.out_offset..])
    }

    /// Records that `written` bytes of `pending_output` reached the socket.
    pub fn consume_output(&mut self, written: usize) {
        let Some(front) = self.outbox.front() else {
            return;
        };
        self.out_offset += written;
        if self.out_offset >= front.len() {
            self.outbox.pop_front();
            self.out_offset = 0;
        }
        if self.state == State::Closing && self.outbox.is_empty() {
            self.state = State::Closed;
        }
    }

    pub fn handshake_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.state == State::Connecting && now.duration_since(self.accepted_at) >= timeout
    }
}

pub fn decode_text(payload: Vec<u8>) -> Result<String, EncodingError> {
    String::from_utf8(payload).map_err(|e| EncodingError::InvalidUtf8 {
        valid_up_to: e.utf8_error().valid_up_to(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::framing::{close_code, decode_frame, encode_masked_frame};

    const KEY: [u8; 4] = [0x01, 0x02, 0x03, 0x04];
    const REQUEST: &[u8] = b"GET /imu HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    fn connection() -> Connection {
        Connection::new(ConnectionId(7), "127.0.0.1:5000".parse().unwrap(), 1024)
    }

    /// Drains every queued output frame, flushing as a socket would.
    fn flush(conn: &mut Connection) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(bytes) = conn.pending_output() {
            let n = bytes.len();
            out.extend_from_slice(bytes);
            conn.consume_output(n);
        }
        out
    }

    fn open_connection() -> Connection {
        let mut conn = connection();
        conn.receive(REQUEST);
        assert_eq!(conn.state(), State::Open);
        assert_eq!(conn.next_event(), Some(Event::Opened));
        let response = flush(&mut conn);
        assert!(response.starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"));
        conn
    }

    fn frames(mut bytes: &[u8]) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Some((frame, used)) = decode_frame(bytes, usize::MAX).unwrap() {
            out.push(frame);
            bytes = &bytes[used..];
        }
        assert!(bytes.is_empty());
        out
    }

    #[test]
    fn handshake_split_across_reads() {
        let mut conn = connection();
        conn.receive(&REQUEST[..20]);
        assert_eq!(conn.state(), State::Connecting);
        assert!(!conn.has_output());
        conn.receive(&REQUEST[20..]);
        assert_eq!(conn.state(), State::Open);
        assert!(conn.has_opened());
    }

    #[test]
    fn bad_handshake_closes_without_response() {
        let mut conn = connection();
        conn.receive(b"POST / HTTP/1.1\r\nUpgrade: websocket\r\n\r\n");
        assert_eq!(conn.state(), State::Closed);
        assert!(!conn.has_output());
        assert!(!conn.has_opened());
        assert_eq!(conn.next_event(), None);
    }

    #[test]
    fn frame_pipelined_after_handshake() {
        let mut bytes = REQUEST.to_vec();
        bytes.extend(encode_masked_frame(OpCode::Text, true, b"early", KEY));
        let mut conn = connection();
        conn.receive(&bytes);
        assert_eq!(conn.next_event(), Some(Event::Opened));
        assert_eq!(
            conn.next_event(),
            Some(Event::Message(Message::Text("early".into())))
        );
    }

    #[test]
    fn messages_delivered_in_order() {
        let mut conn = open_connection();
        let mut bytes = encode_masked_frame(OpCode::Text, true, b"one", KEY);
        bytes.extend(encode_masked_frame(OpCode::Binary, true, &[1, 2], KEY));
        bytes.extend(encode_masked_frame(OpCode::Text, true, b"three", KEY));
        // Byte by byte to exercise the accumulator.
        for byte in &bytes {
            conn.receive(std::slice::from_ref(byte));
        }
        assert_eq!(conn.next_event(), Some(Event::Message(Message::Text("one".into()))));
        assert_eq!(conn.next_event(), Some(Event::Message(Message::Binary(vec![1, 2]))));
        assert_eq!(conn.next_event(), Some(Event::Message(Message::Text("three".into()))));
        assert_eq!(conn.next_event(), None);
    }

    #[test]
    fn ping_gets_exactly_one_pong() {
        let mut conn = open_connection();
        conn.receive(&encode_masked_frame(OpCode::Ping, true, b"tick", KEY));
        assert_eq!(conn.state(), State::Open);
        let sent = frames(&flush(&mut conn));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].opcode, OpCode::Pong);
        assert_eq!(sent[0].payload, b"tick");
        assert!(!sent[0].masked);
        assert_eq!(conn.next_event(), None);
    }

    #[test]
    fn close_is_echoed_then_closed_after_flush() {
        let mut conn = open_connection();
        let close = CloseFrame::new(close_code::NORMAL, "done");
        conn.receive(&encode_masked_frame(OpCode::Close, true, &close.to_payload(), KEY));
        assert_eq!(conn.state(), State::Closing);
        assert!(!conn.send_text("too late"));

        let sent = frames(&flush(&mut conn));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].opcode, OpCode::Close);
        assert_eq!(CloseFrame::parse(&sent[0].payload).unwrap().code, Some(close_code::NORMAL));
        assert_eq!(conn.state(), State::Closed);
    }

    #[test]
    fn invalid_utf8_dropped_connection_stays_open() {
        let mut conn = open_connection();
        conn.receive(&encode_masked_frame(OpCode::Text, true, &[0x66, 0xFF, 0x66], KEY));
        conn.receive(&encode_masked_frame(OpCode::Text, true, b"ok", KEY));
        assert_eq!(conn.state(), State::Open);
        assert_eq!(conn.next_event(), Some(Event::Message(Message::Text("ok".into()))));
        assert!(!conn.has_output());
    }

    #[test]
    fn unmasked_client_frame_is_protocol_error() {
        let mut conn = open_connection();
        conn.receive(&framing::encode_text("naked"));
        assert_eq!(conn.state(), State::Closing);
        let sent = frames(&flush(&mut conn));
        assert_eq!(
            CloseFrame::parse(&sent[0].payload).unwrap().code,
            Some(close_code::PROTOCOL_ERROR)
        );
        assert_eq!(conn.state(), State::Closed);
    }

    #[test]
    fn fragmented_message_reassembled_around_ping() {
        let mut conn = open_connection();
        conn.receive(&encode_masked_frame(OpCode::Text, false, b"hel", KEY));
        conn.receive(&encode_masked_frame(OpCode::Ping, true, b"", KEY));
        conn.receive(&encode_masked_frame(OpCode::Continuation, false, b"lo ", KEY));
        assert_eq!(conn.next_event(), None);
        conn.receive(&encode_masked_frame(OpCode::Continuation, true, b"cam", KEY));
        assert_eq!(
            conn.next_event(),
            Some(Event::Message(Message::Text("hello cam".into())))
        );
        assert_eq!(frames(&flush(&mut conn))[0].opcode, OpCode::Pong);
    }

    #[test]
    fn stray_continuation_and_oversize_close_connection() {
        let mut conn = open_connection();
        conn.receive(&encode_masked_frame(OpCode::Continuation, true, b"x", KEY));
        assert_eq!(conn.state(), State::Closing);

        let mut conn = open_connection();
        conn.receive(&encode_masked_frame(OpCode::Binary, false, &[0; 600], KEY));
        conn.receive(&encode_masked_frame(OpCode::Continuation, true, &[0; 600], KEY));
        assert_eq!(conn.state(), State::Closing);
        let sent = frames(&flush(&mut conn));
        assert_eq!(
            CloseFrame::parse(&sent[0].payload).unwrap().code,
            Some(close_code::TOO_BIG)
        );
    }

    #[test]
    fn partial_writes_resume() {
        let mut conn = open_connection();
        assert!(conn.send_text("abcdef"));
        let first = conn.pending_output().unwrap().to_vec();
        conn.consume_output(3);
        assert_eq!(conn.pending_output().unwrap(), &first[3..]);
        conn.consume_output(first.len() - 3);
        assert!(!conn.has_output());
    }

    #[test]
    fn handshake_timeout() {
        let conn = connection();
        let later = Instant::now() + Duration::from_secs(11);
        assert!(conn.handshake_expired(later, Duration::from_secs(10)));
        let open = open_connection();
        assert!(!open.handshake_expired(later, Duration::from_secs(10)));
    }
}
