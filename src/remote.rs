//! Remote slice access: a request/answer protocol over two pipes, with a
//! master presenting the remote archive as a local read-only stream and a
//! slave serving it on the other side.

use crate::bigint::Bigint;
use crate::error::Error;
use crate::error::Result;
use crate::label::Label;
use crate::label::LABEL_SIZE;
use crate::stream::check_not_terminated;
use crate::stream::read_exact;
use crate::stream::Mode;
use crate::stream::SkipDirection;
use crate::stream::Stream;
use crate::user::Ui;
use byteorder::BigEndian;
use byteorder::ByteOrder;

/// Special orders, selected by the offset field of a zero-size request.
const ORDER_END_OF_XMIT: u64 = 0;
const ORDER_FILE_SIZE: u64 = 1;
const ORDER_CONTEXT: u64 = 2;
const ORDER_IS_OLD_ARCHIVE: u64 = 3;
const ORDER_DATA_NAME: u64 = 4;
const ORDER_FIRST_HEADER_SIZE: u64 = 5;
const ORDER_OTHER_HEADER_SIZE: u64 = 6;

/// Answer carrying raw bytes.
const ANSWER_DATA: u8 = b'D';
/// Answer carrying an integer.
const ANSWER_INT: u8 = b'I';

/// One request as found on the wire.
struct Request {
    serial: u8,
    offset: Bigint,
    size: u16,
    info: String,
}

impl Request {
    fn write(&self, f: &mut dyn Stream) -> Result<()> {
        f.write(&[self.serial])?;
        self.offset.dump(f)?;
        let mut size = [0u8; 2];
        BigEndian::write_u16(&mut size, self.size);
        f.write(&size)?;
        if self.size == 0 && self.offset.to_u64() == Some(ORDER_CONTEXT) {
            let bytes = self.info.as_bytes();
            let mut len = [0u8; 2];
            BigEndian::write_u16(&mut len, bytes.len().min(u16::MAX as usize) as u16);
            f.write(&len)?;
            f.write(bytes)?;
        }
        f.sync_write()
    }

    fn read(f: &mut dyn Stream) -> Result<Self> {
        let mut serial = [0u8; 1];
        read_exact(f, &mut serial)?;
        let offset = Bigint::read(f)?;
        let mut size = [0u8; 2];
        read_exact(f, &mut size)?;
        let size = BigEndian::read_u16(&size);
        let mut info = String::new();
        if size == 0 && offset.to_u64() == Some(ORDER_CONTEXT) {
            let mut len = [0u8; 2];
            read_exact(f, &mut len)?;
            let mut bytes = vec![0u8; BigEndian::read_u16(&len) as usize];
            read_exact(f, &mut bytes)?;
            info = String::from_utf8_lossy(&bytes).into_owned();
        }
        Ok(Self {
            serial: serial[0],
            offset,
            size,
            info,
        })
    }
}

enum Answer {
    Data(Vec<u8>),
    Int(Bigint),
}

impl Answer {
    fn write(&self, serial: u8, f: &mut dyn Stream) -> Result<()> {
        f.write(&[serial])?;
        match self {
            Self::Data(bytes) => {
                f.write(&[ANSWER_DATA])?;
                let mut size = [0u8; 2];
                BigEndian::write_u16(&mut size, bytes.len().min(u16::MAX as usize) as u16);
                f.write(&size)?;
                f.write(bytes)?;
            }
            Self::Int(v) => {
                f.write(&[ANSWER_INT])?;
                v.dump(f)?;
            }
        }
        f.sync_write()
    }

    fn read(f: &mut dyn Stream) -> Result<(u8, Self)> {
        let mut head = [0u8; 2];
        read_exact(f, &mut head)?;
        let answer = match head[1] {
            ANSWER_DATA => {
                let mut size = [0u8; 2];
                read_exact(f, &mut size)?;
                let mut bytes = vec![0u8; BigEndian::read_u16(&size) as usize];
                read_exact(f, &mut bytes)?;
                Self::Data(bytes)
            }
            ANSWER_INT => Self::Int(Bigint::read(f)?),
            _ => return Err(Error::data("corrupted answer on the remote channel")),
        };
        Ok((head[0], answer))
    }
}

/// Master side: a read-only stream backed by a remote helper.
pub struct RemoteStream {
    to_slave: Box<dyn Stream>,
    from_slave: Box<dyn Stream>,
    ui: Ui,
    serial: u8,
    pos: Bigint,
    file_size: Option<Bigint>,
    terminated: bool,
}

impl RemoteStream {
    pub fn new(to_slave: Box<dyn Stream>, from_slave: Box<dyn Stream>, ui: Ui) -> Self {
        Self {
            to_slave,
            from_slave,
            ui,
            serial: 0,
            pos: Bigint::zero(),
            file_size: None,
            terminated: false,
        }
    }

    /// Sends a request and reads its answer, re-trying on serial number
    /// mismatch once the user agrees.
    fn transact(&mut self, offset: Bigint, size: u16, info: &str) -> Result<Answer> {
        self.serial = self.serial.wrapping_add(1);
        let req = Request {
            serial: self.serial,
            offset,
            size,
            info: info.to_string(),
        };
        req.write(self.to_slave.as_mut())?;
        loop {
            let (serial, answer) = Answer::read(self.from_slave.as_mut())?;
            if serial == self.serial {
                return Ok(answer);
            }
            self.ui.pause_or_abort(
                "communication with the remote helper got out of order, keep looking for the right answer?",
            )?;
        }
    }

    fn special_int(&mut self, order: u64) -> Result<Bigint> {
        match self.transact(Bigint::from(order), 0, "")? {
            Answer::Int(v) => Ok(v),
            Answer::Data(_) => Err(Error::data("integer answer expected from remote helper")),
        }
    }

    /// Total size of the remote archive stream.
    pub fn remote_size(&mut self) -> Result<Bigint> {
        if let Some(s) = &self.file_size {
            return Ok(s.clone());
        }
        let s = self.special_int(ORDER_FILE_SIZE)?;
        self.file_size = Some(s.clone());
        Ok(s)
    }

    /// Data name of the remote archive.
    pub fn remote_data_name(&mut self) -> Result<Label> {
        match self.transact(Bigint::from(ORDER_DATA_NAME), 0, "")? {
            Answer::Data(bytes) if bytes.len() == LABEL_SIZE => {
                let mut l = Label::cleared();
                l.0.copy_from_slice(&bytes);
                Ok(l)
            }
            _ => Err(Error::data("bad data name answer from remote helper")),
        }
    }

    /// Header size of the first remote slice.
    pub fn remote_first_header_size(&mut self) -> Result<Bigint> {
        self.special_int(ORDER_FIRST_HEADER_SIZE)
    }

    /// Header size of the other remote slices.
    pub fn remote_other_header_size(&mut self) -> Result<Bigint> {
        self.special_int(ORDER_OTHER_HEADER_SIZE)
    }

    /// Tells whether the remote archive uses the old start/end layout.
    pub fn remote_is_old_archive(&mut self) -> Result<bool> {
        Ok(!self.special_int(ORDER_IS_OLD_ARCHIVE)?.is_zero())
    }

    /// Broadcasts a contextual status string to the helper.
    pub fn set_remote_context(&mut self, status: &str) -> Result<()> {
        match self.transact(Bigint::from(ORDER_CONTEXT), 0, status)? {
            Answer::Int(v) if v.to_u64() == Some(1) => Ok(()),
            _ => Err(Error::data("context change refused by remote helper")),
        }
    }
}

impl Stream for RemoteStream {
    fn mode(&self) -> Mode {
        Mode::Read
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        check_not_terminated(self)?;
        let mut done = 0;
        while done < buf.len() {
            let want = (buf.len() - done).min(u16::MAX as usize) as u16;
            let answer = self.transact(self.pos.clone(), want, "")?;
            match answer {
                Answer::Data(bytes) => {
                    if bytes.len() > want as usize {
                        return Err(Error::data("oversized data answer from remote helper"));
                    }
                    buf[done..done + bytes.len()].copy_from_slice(&bytes);
                    done += bytes.len();
                    self.pos += bytes.len() as u64;
                    if bytes.len() < want as usize {
                        break;
                    }
                }
                Answer::Int(_) => {
                    return Err(Error::data("data answer expected from remote helper"))
                }
            }
        }
        Ok(done)
    }

    fn write(&mut self, _buf: &[u8]) -> Result<()> {
        Err(Error::misuse("the remote channel is read-only"))
    }

    fn skip(&mut self, pos: &Bigint) -> Result<bool> {
        check_not_terminated(self)?;
        let size = self.remote_size()?;
        if *pos > size {
            self.pos = size;
            return Ok(false);
        }
        self.pos = pos.clone();
        Ok(true)
    }

    fn skip_relative(&mut self, delta: i64) -> Result<bool> {
        check_not_terminated(self)?;
        if delta >= 0 {
            let target = &self.pos + &Bigint::from(delta as u64);
            self.skip(&target)
        } else {
            match self.pos.checked_sub(&Bigint::from((-delta) as u64)) {
                Some(target) => self.skip(&target),
                None => {
                    self.pos = Bigint::zero();
                    Ok(false)
                }
            }
        }
    }

    fn skip_to_eof(&mut self) -> Result<bool> {
        check_not_terminated(self)?;
        self.pos = self.remote_size()?;
        Ok(true)
    }

    fn position(&self) -> Result<Bigint> {
        check_not_terminated(self)?;
        Ok(self.pos.clone())
    }

    fn skippable(&self, _direction: SkipDirection, _amount: &Bigint) -> bool {
        true
    }

    fn sync_write(&mut self) -> Result<()> {
        check_not_terminated(self)
    }

    fn flush_read(&mut self) -> Result<()> {
        check_not_terminated(self)
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;
        let req = Request {
            serial: self.serial.wrapping_add(1),
            offset: Bigint::from(ORDER_END_OF_XMIT),
            size: 0,
            info: String::new(),
        };
        let _ = req.write(self.to_slave.as_mut());
        self.to_slave.terminate()?;
        self.from_slave.terminate()
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

/// Facts about the served archive the slave answers special orders with.
#[derive(Clone, Debug)]
pub struct SlaveInfo {
    pub data_name: Label,
    pub first_header_size: Bigint,
    pub other_header_size: Bigint,
    pub old_start_end: bool,
}

/// Slave side: serves a local stream to a remote master.
pub struct Slave {
    below: Box<dyn Stream>,
    info: SlaveInfo,
    context: String,
}

impl Slave {
    pub fn new(below: Box<dyn Stream>, info: SlaveInfo) -> Self {
        Self {
            below,
            info,
            context: String::new(),
        }
    }

    /// Last context string broadcast by the master.
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Serves requests until the master signals the end of transmission
    /// or hangs up.
    pub fn serve(
        &mut self,
        from_master: &mut dyn Stream,
        to_master: &mut dyn Stream,
    ) -> Result<()> {
        loop {
            let req = match Request::read(from_master) {
                Ok(r) => r,
                // master hung up
                Err(Error::Data(_)) => return Ok(()),
                Err(e) => return Err(e),
            };
            if req.size > 0 {
                if !self.below.skip(&req.offset)? {
                    Answer::Data(Vec::new()).write(req.serial, to_master)?;
                    continue;
                }
                let mut buf = vec![0u8; req.size as usize];
                let mut got = 0;
                loop {
                    let n = self.below.read(&mut buf[got..])?;
                    if n == 0 {
                        break;
                    }
                    got += n;
                    if got == buf.len() {
                        break;
                    }
                }
                buf.truncate(got);
                Answer::Data(buf).write(req.serial, to_master)?;
                continue;
            }
            match req.offset.to_u64() {
                Some(ORDER_END_OF_XMIT) => return Ok(()),
                Some(ORDER_FILE_SIZE) => {
                    let here = self.below.position()?;
                    self.below.skip_to_eof()?;
                    let size = self.below.position()?;
                    self.below.skip(&here)?;
                    Answer::Int(size).write(req.serial, to_master)?;
                }
                Some(ORDER_CONTEXT) => {
                    self.context = req.info;
                    Answer::Int(Bigint::from(1u64)).write(req.serial, to_master)?;
                }
                Some(ORDER_IS_OLD_ARCHIVE) => {
                    let v = u64::from(self.info.old_start_end);
                    Answer::Int(Bigint::from(v)).write(req.serial, to_master)?;
                }
                Some(ORDER_DATA_NAME) => {
                    Answer::Data(self.info.data_name.0.to_vec()).write(req.serial, to_master)?;
                }
                Some(ORDER_FIRST_HEADER_SIZE) => {
                    Answer::Int(self.info.first_header_size.clone())
                        .write(req.serial, to_master)?;
                }
                Some(ORDER_OTHER_HEADER_SIZE) => {
                    Answer::Int(self.info.other_header_size.clone())
                        .write(req.serial, to_master)?;
                }
                _ => {
                    return Err(Error::range("unknown special order on the remote channel"))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::memory::MemoryStream;
    use crate::stream::pipe::PipeStream;
    use crate::user::ScriptedInteraction;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn served_archive_reads_back() {
        let payload: Vec<u8> = (0..500u32).map(|i| (i % 256) as u8).collect();
        let name = Label::generate();
        let info = SlaveInfo {
            data_name: name,
            first_header_size: Bigint::from(40u64),
            other_header_size: Bigint::from(30u64),
            old_start_end: false,
        };

        let (m2s_read, m2s_write) = PipeStream::pair().unwrap();
        let (s2m_read, s2m_write) = PipeStream::pair().unwrap();

        let served = payload.clone();
        let helper = thread::spawn(move || {
            let mut slave = Slave::new(Box::new(MemoryStream::with_contents(served)), info);
            let mut from_master = m2s_read;
            let mut to_master = s2m_write;
            slave.serve(&mut from_master, &mut to_master).unwrap();
            slave.context().to_string()
        });

        let ui: Ui = Arc::new(ScriptedInteraction::new(true, ""));
        let mut master = RemoteStream::new(Box::new(m2s_write), Box::new(s2m_read), ui);

        assert_eq!(master.remote_size().unwrap().to_u64(), Some(500));
        assert_eq!(master.remote_data_name().unwrap(), name);
        assert_eq!(
            master.remote_first_header_size().unwrap().to_u64(),
            Some(40)
        );
        assert!(!master.remote_is_old_archive().unwrap());
        master.set_remote_context("reading").unwrap();

        assert!(master.skip(&Bigint::from(100u64)).unwrap());
        let mut buf = [0u8; 32];
        assert_eq!(master.read(&mut buf).unwrap(), 32);
        assert_eq!(&buf[..], &payload[100..132]);

        // short read at the end of the served stream
        assert!(master.skip(&Bigint::from(490u64)).unwrap());
        let mut buf = [0u8; 32];
        assert_eq!(master.read(&mut buf).unwrap(), 10);

        assert!(!master.skip(&Bigint::from(501u64)).unwrap());
        master.terminate().unwrap();
        assert_eq!(helper.join().unwrap(), "reading");
    }
}
