//! Worker-offloaded layer: the wrapped stream lives in its own thread and
//! is driven through two bounded fifos of framed messages.

use crate::bigint::Bigint;
use crate::error::Error;
use crate::error::Result;
use crate::stream::check_not_terminated;
use crate::stream::Mode;
use crate::stream::SkipDirection;
use crate::stream::Stream;
use crate::stream::memory::MemoryStream;
use std::cell::RefCell;
use std::sync::mpsc::sync_channel;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::SyncSender;
use std::thread;
use std::thread::JoinHandle;

/// Payload bytes per frame.
const FRAME_SIZE: usize = 65_536;
/// Frames a fifo may hold before the producer blocks.
const FIFO_DEPTH: usize = 8;

/// Set on the tag byte when the message payload continues in the next
/// frame.
const TAG_BEGIN: u8 = 0x80;

const TAG_DATA: u8 = 0x01;
const TAG_ORDER_READ_AHEAD: u8 = 0x02;
const TAG_ORDER_READ: u8 = 0x03;
const TAG_ORDER_SYNC_WRITE: u8 = 0x04;
const TAG_ORDER_SKIP: u8 = 0x05;
const TAG_ORDER_SKIP_FWD: u8 = 0x06;
const TAG_ORDER_SKIP_BKD: u8 = 0x07;
const TAG_ORDER_SKIP_TO_EOF: u8 = 0x08;
const TAG_ORDER_SKIPPABLE_FWD: u8 = 0x09;
const TAG_ORDER_SKIPPABLE_BKD: u8 = 0x0a;
const TAG_ORDER_GET_POSITION: u8 = 0x0b;
const TAG_ORDER_FLUSH_READ: u8 = 0x0c;
const TAG_ANSWER_READ_EOF: u8 = 0x10;
const TAG_ANSWER_SKIP_DONE: u8 = 0x11;
const TAG_ANSWER_SKIPPABLE: u8 = 0x12;
const TAG_ANSWER_POSITION: u8 = 0x13;
const TAG_ANSWER_EXCEPTION: u8 = 0x14;
const TAG_ANSWER_SYNC_DONE: u8 = 0x15;
const TAG_END_OF_XMIT: u8 = 0x16;

/// One protocol message, after frame reassembly.
#[derive(Debug)]
enum Message {
    /// Bytes moving in either direction. `last` closes the burst.
    Data { last: bool, bytes: Vec<u8> },
    OrderReadAhead(Bigint),
    OrderRead(u32),
    OrderSyncWrite,
    OrderSkip(Bigint),
    OrderSkipFwd(u32),
    OrderSkipBkd(u32),
    OrderSkipToEof,
    OrderSkippableFwd(Bigint),
    OrderSkippableBkd(Bigint),
    OrderGetPosition,
    OrderFlushRead,
    AnswerReadEof,
    AnswerSkipDone(bool),
    AnswerSkippable(bool),
    AnswerPosition(Bigint),
    AnswerException(u8, String),
    AnswerSyncDone,
    EndOfXmit,
}

fn bigint_to_bytes(v: &Bigint) -> Vec<u8> {
    let mut m = MemoryStream::new();
    // writing to memory cannot fail
    let _ = v.dump(&mut m);
    m.into_contents()
}

fn bigint_from_bytes(bytes: &[u8]) -> Result<Bigint> {
    let mut m = MemoryStream::with_contents(bytes.to_vec());
    Bigint::read(&mut m)
}

/// Flattens an error for the wire: a kind byte and the message text.
fn error_to_wire(e: &Error) -> (u8, String) {
    let kind = match e {
        Error::Misuse(_) => 1,
        Error::Range(_) => 2,
        Error::Memory(_) => 3,
        Error::UserAbort(_) => 4,
        Error::Data(_) => 5,
        Error::Feature(_) => 6,
        Error::System { .. } => 7,
        Error::Script(_) => 8,
        Error::Cancelled { .. } => 9,
        Error::Bug(_) => 10,
    };
    (kind, e.to_string())
}

fn error_from_wire(kind: u8, message: String) -> Error {
    match kind {
        1 => Error::Misuse(message),
        2 => Error::Range(message),
        3 => Error::Memory(message),
        4 => Error::UserAbort(message),
        5 => Error::Data(message),
        6 => Error::Feature(message),
        8 => Error::Script(message),
        9 => Error::Cancelled {
            immediate: true,
            flag: false,
            attribute: None,
        },
        10 => Error::Bug(message),
        _ => Error::System {
            kind: crate::error::IoKind::Other,
            message,
        },
    }
}

impl Message {
    /// Serializes into one or more frames, splitting long payloads with
    /// the begin variant of the tag.
    fn to_frames(&self) -> Vec<Vec<u8>> {
        let (tag, payload) = match self {
            Self::Data { last, bytes } => {
                // data carries its own continuation flag in the header byte
                let mut frames = Vec::new();
                let mut chunks = bytes.chunks(FRAME_SIZE).peekable();
                if bytes.is_empty() {
                    frames.push(vec![TAG_DATA, u8::from(*last)]);
                }
                while let Some(chunk) = chunks.next() {
                    let frame_last = *last && chunks.peek().is_none();
                    let mut frame = Vec::with_capacity(chunk.len() + 2);
                    frame.push(TAG_DATA);
                    frame.push(u8::from(frame_last));
                    frame.extend_from_slice(chunk);
                    frames.push(frame);
                }
                return frames;
            }
            Self::OrderReadAhead(v) => (TAG_ORDER_READ_AHEAD, bigint_to_bytes(v)),
            Self::OrderRead(n) => (TAG_ORDER_READ, n.to_be_bytes().to_vec()),
            Self::OrderSyncWrite => (TAG_ORDER_SYNC_WRITE, Vec::new()),
            Self::OrderSkip(v) => (TAG_ORDER_SKIP, bigint_to_bytes(v)),
            Self::OrderSkipFwd(n) => (TAG_ORDER_SKIP_FWD, n.to_be_bytes().to_vec()),
            Self::OrderSkipBkd(n) => (TAG_ORDER_SKIP_BKD, n.to_be_bytes().to_vec()),
            Self::OrderSkipToEof => (TAG_ORDER_SKIP_TO_EOF, Vec::new()),
            Self::OrderSkippableFwd(v) => (TAG_ORDER_SKIPPABLE_FWD, bigint_to_bytes(v)),
            Self::OrderSkippableBkd(v) => (TAG_ORDER_SKIPPABLE_BKD, bigint_to_bytes(v)),
            Self::OrderGetPosition => (TAG_ORDER_GET_POSITION, Vec::new()),
            Self::OrderFlushRead => (TAG_ORDER_FLUSH_READ, Vec::new()),
            Self::AnswerReadEof => (TAG_ANSWER_READ_EOF, Vec::new()),
            Self::AnswerSkipDone(ok) => (TAG_ANSWER_SKIP_DONE, vec![u8::from(*ok)]),
            Self::AnswerSkippable(ok) => (TAG_ANSWER_SKIPPABLE, vec![u8::from(*ok)]),
            Self::AnswerPosition(v) => (TAG_ANSWER_POSITION, bigint_to_bytes(v)),
            Self::AnswerException(kind, msg) => {
                let mut p = vec![*kind];
                p.extend_from_slice(msg.as_bytes());
                (TAG_ANSWER_EXCEPTION, p)
            }
            Self::AnswerSyncDone => (TAG_ANSWER_SYNC_DONE, Vec::new()),
            Self::EndOfXmit => (TAG_END_OF_XMIT, Vec::new()),
        };
        if payload.len() <= FRAME_SIZE {
            let mut frame = Vec::with_capacity(payload.len() + 1);
            frame.push(tag);
            frame.extend_from_slice(&payload);
            return vec![frame];
        }
        // long field spanning blocks: begin variant carries the head
        let mut frames = Vec::new();
        let mut chunks = payload.chunks(FRAME_SIZE).peekable();
        while let Some(chunk) = chunks.next() {
            let t = if chunks.peek().is_some() {
                tag | TAG_BEGIN
            } else {
                tag
            };
            let mut frame = Vec::with_capacity(chunk.len() + 1);
            frame.push(t);
            frame.extend_from_slice(chunk);
            frames.push(frame);
        }
        frames
    }

    /// Rebuilds a message from frames, pulling continuation frames from
    /// `next`.
    fn from_frames(
        first: Vec<u8>,
        next: &mut dyn FnMut() -> Option<Vec<u8>>,
    ) -> Result<Self> {
        let mut frame = first;
        let mut payload: Vec<u8> = Vec::new();
        loop {
            if frame.is_empty() {
                return Err(Error::data("empty frame on inter-thread fifo"));
            }
            let tag = frame[0];
            payload.extend_from_slice(&frame[1..]);
            if tag & TAG_BEGIN == 0 {
                return Self::parse(tag, payload);
            }
            frame = match next() {
                Some(f) => f,
                None => return Err(Error::data("truncated message on inter-thread fifo")),
            };
        }
    }

    fn parse(tag: u8, payload: Vec<u8>) -> Result<Self> {
        let u32_arg = |p: &[u8]| -> Result<u32> {
            let arr: [u8; 4] = p
                .try_into()
                .map_err(|_| Error::data("bad integer field on inter-thread fifo"))?;
            Ok(u32::from_be_bytes(arr))
        };
        Ok(match tag {
            TAG_DATA => {
                if payload.is_empty() {
                    return Err(Error::data("data frame without header byte"));
                }
                Self::Data {
                    last: payload[0] != 0,
                    bytes: payload[1..].to_vec(),
                }
            }
            TAG_ORDER_READ_AHEAD => Self::OrderReadAhead(bigint_from_bytes(&payload)?),
            TAG_ORDER_READ => Self::OrderRead(u32_arg(&payload)?),
            TAG_ORDER_SYNC_WRITE => Self::OrderSyncWrite,
            TAG_ORDER_SKIP => Self::OrderSkip(bigint_from_bytes(&payload)?),
            TAG_ORDER_SKIP_FWD => Self::OrderSkipFwd(u32_arg(&payload)?),
            TAG_ORDER_SKIP_BKD => Self::OrderSkipBkd(u32_arg(&payload)?),
            TAG_ORDER_SKIP_TO_EOF => Self::OrderSkipToEof,
            TAG_ORDER_SKIPPABLE_FWD => Self::OrderSkippableFwd(bigint_from_bytes(&payload)?),
            TAG_ORDER_SKIPPABLE_BKD => Self::OrderSkippableBkd(bigint_from_bytes(&payload)?),
            TAG_ORDER_GET_POSITION => Self::OrderGetPosition,
            TAG_ORDER_FLUSH_READ => Self::OrderFlushRead,
            TAG_ANSWER_READ_EOF => Self::AnswerReadEof,
            TAG_ANSWER_SKIP_DONE => Self::AnswerSkipDone(payload.first().is_some_and(|b| *b != 0)),
            TAG_ANSWER_SKIPPABLE => Self::AnswerSkippable(payload.first().is_some_and(|b| *b != 0)),
            TAG_ANSWER_POSITION => Self::AnswerPosition(bigint_from_bytes(&payload)?),
            TAG_ANSWER_EXCEPTION => {
                let kind = *payload.first().unwrap_or(&0);
                let msg = String::from_utf8_lossy(&payload[1.min(payload.len())..]).into_owned();
                Self::AnswerException(kind, msg)
            }
            TAG_ANSWER_SYNC_DONE => Self::AnswerSyncDone,
            TAG_END_OF_XMIT => Self::EndOfXmit,
            _ => return Err(Error::data("unknown tag on inter-thread fifo")),
        })
    }
}

struct Comm {
    to_slave: SyncSender<Vec<u8>>,
    to_master: Receiver<Vec<u8>>,
}

impl Comm {
    fn send(&self, msg: &Message) -> Result<()> {
        for frame in msg.to_frames() {
            self.to_slave
                .send(frame)
                .map_err(|_| Error::data("worker thread is gone"))?;
        }
        Ok(())
    }

    fn recv(&self) -> Result<Message> {
        let first = self
            .to_master
            .recv()
            .map_err(|_| Error::data("worker thread is gone"))?;
        let mut next = || self.to_master.recv().ok();
        Message::from_frames(first, &mut next)
    }
}

/// Master side: implements the stream contract, forwarding every call to
/// the worker thread owning the real stream.
pub struct ThreadStream {
    comm: RefCell<Comm>,
    mode: Mode,
    worker: Option<JoinHandle<()>>,
    terminated: bool,
}

impl ThreadStream {
    /// Moves `below` into a worker thread and returns the wrapper.
    pub fn new(below: Box<dyn Stream + Send>) -> Self {
        let mode = below.mode();
        let (order_tx, order_rx) = sync_channel::<Vec<u8>>(FIFO_DEPTH);
        let (answer_tx, answer_rx) = sync_channel::<Vec<u8>>(FIFO_DEPTH);
        let worker = thread::spawn(move || {
            slave_loop(below, order_rx, answer_tx);
        });
        Self {
            comm: RefCell::new(Comm {
                to_slave: order_tx,
                to_master: answer_rx,
            }),
            mode,
            worker: Some(worker),
            terminated: false,
        }
    }

    fn expect_bool(&self, expect_skip: bool) -> Result<bool> {
        let comm = self.comm.borrow();
        match comm.recv()? {
            Message::AnswerSkipDone(ok) if expect_skip => Ok(ok),
            Message::AnswerSkippable(ok) if !expect_skip => Ok(ok),
            Message::AnswerException(kind, msg) => Err(error_from_wire(kind, msg)),
            _ => Err(Error::bug("unexpected answer from worker thread")),
        }
    }
}

impl Stream for ThreadStream {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        check_not_terminated(self)?;
        let comm = self.comm.borrow();
        comm.send(&Message::OrderRead(buf.len().min(u32::MAX as usize) as u32))?;
        let mut done = 0;
        loop {
            match comm.recv()? {
                Message::Data { last, bytes } => {
                    let n = bytes.len().min(buf.len() - done);
                    buf[done..done + n].copy_from_slice(&bytes[..n]);
                    done += n;
                    if last {
                        return Ok(done);
                    }
                }
                Message::AnswerReadEof => return Ok(done),
                Message::AnswerException(kind, msg) => return Err(error_from_wire(kind, msg)),
                _ => return Err(Error::bug("unexpected answer to a read order")),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        check_not_terminated(self)?;
        let comm = self.comm.borrow();
        comm.send(&Message::Data {
            last: true,
            bytes: buf.to_vec(),
        })
    }

    fn skip(&mut self, pos: &Bigint) -> Result<bool> {
        check_not_terminated(self)?;
        self.comm.borrow().send(&Message::OrderSkip(pos.clone()))?;
        self.expect_bool(true)
    }

    fn skip_relative(&mut self, delta: i64) -> Result<bool> {
        check_not_terminated(self)?;
        let order = if delta >= 0 {
            Message::OrderSkipFwd(delta.min(u32::MAX as i64) as u32)
        } else {
            Message::OrderSkipBkd((-delta).min(u32::MAX as i64) as u32)
        };
        self.comm.borrow().send(&order)?;
        self.expect_bool(true)
    }

    fn skip_to_eof(&mut self) -> Result<bool> {
        check_not_terminated(self)?;
        self.comm.borrow().send(&Message::OrderSkipToEof)?;
        self.expect_bool(true)
    }

    fn position(&self) -> Result<Bigint> {
        check_not_terminated(self)?;
        let comm = self.comm.borrow();
        comm.send(&Message::OrderGetPosition)?;
        match comm.recv()? {
            Message::AnswerPosition(p) => Ok(p),
            Message::AnswerException(kind, msg) => Err(error_from_wire(kind, msg)),
            _ => Err(Error::bug("unexpected answer to a position order")),
        }
    }

    fn skippable(&self, direction: SkipDirection, amount: &Bigint) -> bool {
        if self.terminated {
            return false;
        }
        let order = match direction {
            SkipDirection::Forward => Message::OrderSkippableFwd(amount.clone()),
            SkipDirection::Backward => Message::OrderSkippableBkd(amount.clone()),
        };
        if self.comm.borrow().send(&order).is_err() {
            return false;
        }
        self.expect_bool(false).unwrap_or(false)
    }

    fn read_ahead(&mut self, amount: &Bigint) -> Result<()> {
        check_not_terminated(self)?;
        self.comm
            .borrow()
            .send(&Message::OrderReadAhead(amount.clone()))
    }

    fn sync_write(&mut self) -> Result<()> {
        check_not_terminated(self)?;
        let comm = self.comm.borrow();
        comm.send(&Message::OrderSyncWrite)?;
        match comm.recv()? {
            Message::AnswerSyncDone => Ok(()),
            Message::AnswerException(kind, msg) => Err(error_from_wire(kind, msg)),
            _ => Err(Error::bug("unexpected answer to a sync order")),
        }
    }

    fn flush_read(&mut self) -> Result<()> {
        check_not_terminated(self)?;
        self.comm.borrow().send(&Message::OrderFlushRead)
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;
        let res = {
            let comm = self.comm.borrow();
            comm.send(&Message::EndOfXmit).and_then(|_| {
                // drain until the worker acknowledges the end of transmission
                loop {
                    match comm.recv() {
                        Ok(Message::EndOfXmit) => return Ok(()),
                        Ok(Message::AnswerException(kind, msg)) => {
                            return Err(error_from_wire(kind, msg))
                        }
                        Ok(_) => continue,
                        Err(e) => return Err(e),
                    }
                }
            })
        };
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        res
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

impl Drop for ThreadStream {
    fn drop(&mut self) {
        if !self.terminated {
            let _ = self.terminate();
        }
    }
}

/// Worker loop: owns the real stream, executes orders in fifo order.
fn slave_loop(
    mut below: Box<dyn Stream + Send>,
    orders: Receiver<Vec<u8>>,
    answers: SyncSender<Vec<u8>>,
) {
    let send = |msg: &Message| -> bool {
        for frame in msg.to_frames() {
            if answers.send(frame).is_err() {
                return false;
            }
        }
        true
    };
    let mut pending: Option<Error> = None;
    loop {
        let first = match orders.recv() {
            Ok(f) => f,
            Err(_) => break,
        };
        let mut next = || orders.recv().ok();
        let msg = match Message::from_frames(first, &mut next) {
            Ok(m) => m,
            Err(_) => break,
        };
        // a stored error is reported on the next order expecting an answer
        let answer_error = |pending: &mut Option<Error>, e: Error| -> Message {
            let (kind, text) = error_to_wire(&e);
            *pending = None;
            Message::AnswerException(kind, text)
        };
        let alive = match msg {
            Message::Data { bytes, .. } => {
                if pending.is_none() {
                    if let Err(e) = below.write(&bytes) {
                        pending = Some(e);
                    }
                }
                true
            }
            Message::OrderRead(mut want) => {
                if let Some(e) = pending.take() {
                    send(&answer_error(&mut pending, e))
                } else {
                    let mut ok = true;
                    let mut buf = vec![0u8; FRAME_SIZE];
                    loop {
                        let chunk = (want as usize).min(FRAME_SIZE);
                        if chunk == 0 {
                            ok = send(&Message::AnswerReadEof);
                            break;
                        }
                        match below.read(&mut buf[..chunk]) {
                            Ok(0) => {
                                ok = send(&Message::AnswerReadEof);
                                break;
                            }
                            Ok(n) => {
                                want -= n as u32;
                                let last = want == 0;
                                ok = send(&Message::Data {
                                    last,
                                    bytes: buf[..n].to_vec(),
                                });
                                if !ok || last {
                                    break;
                                }
                            }
                            Err(e) => {
                                ok = send(&answer_error(&mut pending, e));
                                break;
                            }
                        }
                    }
                    ok
                }
            }
            Message::OrderReadAhead(amount) => {
                let _ = below.read_ahead(&amount);
                true
            }
            Message::OrderSyncWrite => match pending.take() {
                Some(e) => send(&answer_error(&mut pending, e)),
                None => match below.sync_write() {
                    Ok(()) => send(&Message::AnswerSyncDone),
                    Err(e) => send(&answer_error(&mut pending, e)),
                },
            },
            Message::OrderSkip(pos) => match pending.take() {
                Some(e) => send(&answer_error(&mut pending, e)),
                None => match below.skip(&pos) {
                    Ok(ok) => send(&Message::AnswerSkipDone(ok)),
                    Err(e) => send(&answer_error(&mut pending, e)),
                },
            },
            Message::OrderSkipFwd(n) => match below.skip_relative(n as i64) {
                Ok(ok) => send(&Message::AnswerSkipDone(ok)),
                Err(e) => send(&answer_error(&mut pending, e)),
            },
            Message::OrderSkipBkd(n) => match below.skip_relative(-(n as i64)) {
                Ok(ok) => send(&Message::AnswerSkipDone(ok)),
                Err(e) => send(&answer_error(&mut pending, e)),
            },
            Message::OrderSkipToEof => match below.skip_to_eof() {
                Ok(ok) => send(&Message::AnswerSkipDone(ok)),
                Err(e) => send(&answer_error(&mut pending, e)),
            },
            Message::OrderSkippableFwd(amount) => send(&Message::AnswerSkippable(
                below.skippable(SkipDirection::Forward, &amount),
            )),
            Message::OrderSkippableBkd(amount) => send(&Message::AnswerSkippable(
                below.skippable(SkipDirection::Backward, &amount),
            )),
            Message::OrderGetPosition => match below.position() {
                Ok(p) => send(&Message::AnswerPosition(p)),
                Err(e) => send(&answer_error(&mut pending, e)),
            },
            Message::OrderFlushRead => {
                let _ = below.flush_read();
                true
            }
            Message::EndOfXmit => {
                match below.terminate() {
                    Ok(()) => send(&Message::EndOfXmit),
                    Err(e) => send(&answer_error(&mut pending, e)),
                };
                break;
            }
            // answers never travel toward the worker
            _ => true,
        };
        if !alive {
            break;
        }
    }
    let _ = below.terminate();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offloaded_roundtrip() {
        let below = MemoryStream::new();
        let mut t = ThreadStream::new(Box::new(below));
        t.write(b"hello threaded world").unwrap();
        t.sync_write().unwrap();
        assert!(t.skip(&Bigint::from(6u64)).unwrap());
        let mut buf = [0u8; 8];
        assert_eq!(t.read(&mut buf).unwrap(), 8);
        assert_eq!(&buf, b"threaded");
        assert_eq!(t.position().unwrap().to_u64(), Some(14));
        assert!(t.skippable(SkipDirection::Backward, &Bigint::from(3u64)));
        t.skip_to_eof().unwrap();
        assert_eq!(t.read(&mut buf).unwrap(), 0);
        t.terminate().unwrap();
    }

    #[test]
    fn large_transfer_spans_frames() {
        let below = MemoryStream::new();
        let mut t = ThreadStream::new(Box::new(below));
        let data: Vec<u8> = (0..200_000usize).map(|i| (i % 251) as u8).collect();
        t.write(&data).unwrap();
        t.sync_write().unwrap();
        assert!(t.skip(&Bigint::zero()).unwrap());
        let mut back = vec![0u8; data.len()];
        let mut done = 0;
        while done < back.len() {
            let n = t.read(&mut back[done..]).unwrap();
            assert!(n > 0);
            done += n;
        }
        assert_eq!(back, data);
        t.terminate().unwrap();
    }
}
