// src/audio/memory.rs
// External loop memory: the blocking byte-addressed store the streaming thread
// pages windows to and from.
//
// Wire format used by `SerialMemory` and `RamServer`, one request at a time:
//   8 bytes  little-endian byte address
//   8 bytes  little-endian length
//   1 byte   operation (0 = read, 1 = write)
//   payload  `length` bytes for a write; a read is answered with `length` bytes

use std::io::{self, Read, Write};

use thiserror::Error;

pub const HEADER_BYTES: usize = 17;
const OP_READ: u8 = 0;
const OP_WRITE: u8 = 1;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("access of {length} bytes at {address:#x} exceeds capacity {capacity:#x}")]
    OutOfRange {
        address: u64,
        length: usize,
        capacity: u64,
    },
    #[error("memory link I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("unknown memory operation {0}")]
    UnknownOp(u8),
}

pub trait ExternalMemory {
    /// Fill `buf` from `address`. Blocks until complete.
    fn read(&mut self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// Store `data` at `address`. Blocks until complete.
    fn write(&mut self, address: u64, data: &[u8]) -> Result<(), MemoryError>;

    /// Size in bytes.
    fn capacity(&self) -> u64;
}

/// Plain RAM, for tests, offline rendering and the RAM server.
#[derive(Debug, Clone)]
pub struct MemoryBank {
    bytes: Vec<u8>,
}

impl MemoryBank {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![0; capacity],
        }
    }

    fn range(&self, address: u64, length: usize) -> Result<std::ops::Range<usize>, MemoryError> {
        let capacity = self.bytes.len() as u64;
        let end = address.checked_add(length as u64);
        match end {
            Some(end) if end <= capacity => Ok(address as usize..end as usize),
            _ => Err(MemoryError::OutOfRange {
                address,
                length,
                capacity,
            }),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl ExternalMemory for MemoryBank {
    fn read(&mut self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let range = self.range(address, buf.len())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write(&mut self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        let range = self.range(address, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.bytes.len() as u64
    }
}

fn header(address: u64, length: usize, op: u8) -> [u8; HEADER_BYTES] {
    let mut header = [0u8; HEADER_BYTES];
    header[..8].copy_from_slice(&address.to_le_bytes());
    header[8..16].copy_from_slice(&(length as u64).to_le_bytes());
    header[16] = op;
    header
}

/// Memory reached over a byte stream (serial line, socket) speaking the
/// request format above.
pub struct SerialMemory<S> {
    link: S,
    capacity: u64,
}

impl<S: Read + Write> SerialMemory<S> {
    pub fn new(link: S, capacity: u64) -> Self {
        Self { link, capacity }
    }

    fn check(&self, address: u64, length: usize) -> Result<(), MemoryError> {
        match address.checked_add(length as u64) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(MemoryError::OutOfRange {
                address,
                length,
                capacity: self.capacity,
            }),
        }
    }

    pub fn into_inner(self) -> S {
        self.link
    }
}

impl<S: Read + Write> ExternalMemory for SerialMemory<S> {
    fn read(&mut self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.check(address, buf.len())?;
        self.link.write_all(&header(address, buf.len(), OP_READ))?;
        self.link.flush()?;
        self.link.read_exact(buf)?;
        Ok(())
    }

    fn write(&mut self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.check(address, data.len())?;
        self.link.write_all(&header(address, data.len(), OP_WRITE))?;
        self.link.write_all(data)?;
        self.link.flush()?;
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// Host side of the serial protocol: answers requests out of a `MemoryBank`.
pub struct RamServer {
    bank: MemoryBank,
    buffer: Vec<u8>,
}

impl RamServer {
    pub fn new(bank: MemoryBank) -> Self {
        Self {
            bank,
            buffer: Vec::new(),
        }
    }

    /// Serve one request. Returns `Ok(false)` when the peer closed the stream
    /// cleanly before a new header. A request outside the bank is refused
    /// before anything is allocated or sent; the caller should drop the link,
    /// since any write payload is left unread.
    pub fn serve_one<S: Read + Write>(&mut self, link: &mut S) -> Result<bool, MemoryError> {
        let mut header = [0u8; HEADER_BYTES];
        match link.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let mut word = [0u8; 8];
        word.copy_from_slice(&header[..8]);
        let address = u64::from_le_bytes(word);
        word.copy_from_slice(&header[8..16]);
        let length = usize::try_from(u64::from_le_bytes(word)).unwrap_or(usize::MAX);

        let op = header[16];
        if op != OP_READ && op != OP_WRITE {
            return Err(MemoryError::UnknownOp(op));
        }
        self.bank.range(address, length)?;

        self.buffer.resize(length, 0);
        match op {
            OP_READ => {
                self.bank.read(address, &mut self.buffer)?;
                link.write_all(&self.buffer)?;
                link.flush()?;
                log::trace!("ram read {} bytes at {:#x}", length, address);
            }
            OP_WRITE => {
                link.read_exact(&mut self.buffer)?;
                self.bank.write(address, &self.buffer)?;
                log::trace!("ram write {} bytes at {:#x}", length, address);
            }
            _ => return Err(MemoryError::UnknownOp(op)),
        }
        Ok(true)
    }

    /// Serve until the peer disconnects.
    pub fn serve<S: Read + Write>(&mut self, link: &mut S) -> Result<(), MemoryError> {
        while self.serve_one(link)? {}
        Ok(())
    }

    pub fn bank(&self) -> &MemoryBank {
        &self.bank
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reads from a canned reply, records everything written.
    struct Duplex {
        reply: Cursor<Vec<u8>>,
        sent: Vec<u8>,
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reply.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.sent.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn duplex(reply: Vec<u8>) -> Duplex {
        Duplex {
            reply: Cursor::new(reply),
            sent: Vec::new(),
        }
    }

    #[test]
    fn test_bank_read_write() {
        let mut bank = MemoryBank::new(16);
        bank.write(4, &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 5];
        bank.read(3, &mut buf).unwrap();
        assert_eq!(buf, [0, 1, 2, 3, 0]);
    }

    #[test]
    fn test_bank_rejects_out_of_range() {
        let mut bank = MemoryBank::new(16);
        let err = bank.write(14, &[0; 4]).unwrap_err();
        assert!(matches!(err, MemoryError::OutOfRange { address: 14, length: 4, .. }));
        let mut buf = [0u8; 1];
        assert!(bank.read(u64::MAX, &mut buf).is_err());
    }

    #[test]
    fn test_serial_write_request_layout() {
        let mut memory = SerialMemory::new(duplex(Vec::new()), 1024);
        memory.write(0x10, &[0xAA, 0xBB]).unwrap();
        let sent = memory.into_inner().sent;
        assert_eq!(sent.len(), HEADER_BYTES + 2);
        assert_eq!(&sent[..8], &0x10u64.to_le_bytes());
        assert_eq!(&sent[8..16], &2u64.to_le_bytes());
        assert_eq!(sent[16], 1);
        assert_eq!(&sent[17..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_serial_read_consumes_reply() {
        let mut memory = SerialMemory::new(duplex(vec![7, 8, 9]), 1024);
        let mut buf = [0u8; 3];
        memory.read(0x20, &mut buf).unwrap();
        assert_eq!(buf, [7, 8, 9]);
        let sent = memory.into_inner().sent;
        assert_eq!(sent, header(0x20, 3, 0).to_vec());
    }

    #[test]
    fn test_serial_checks_capacity_before_sending() {
        let mut memory = SerialMemory::new(duplex(Vec::new()), 8);
        assert!(memory.write(6, &[0; 4]).is_err());
        assert!(memory.into_inner().sent.is_empty());
    }

    #[test]
    fn test_server_answers_client_requests() {
        let mut requests = Vec::new();
        requests.extend_from_slice(&header(2, 3, 1));
        requests.extend_from_slice(&[5, 6, 7]);
        requests.extend_from_slice(&header(1, 4, 0));

        let mut server = RamServer::new(MemoryBank::new(32));
        let mut link = duplex(requests);
        server.serve(&mut link).unwrap();

        assert_eq!(link.sent, vec![0, 5, 6, 7]);
        assert_eq!(&server.bank().as_bytes()[2..5], &[5, 6, 7]);
    }

    #[test]
    fn test_server_refuses_requests_outside_the_bank() {
        let mut server = RamServer::new(MemoryBank::new(32));

        let mut huge = [0u8; HEADER_BYTES];
        huge[8..16].copy_from_slice(&u64::MAX.to_le_bytes());
        let mut link = duplex(huge.to_vec());
        assert!(matches!(
            server.serve_one(&mut link),
            Err(MemoryError::OutOfRange { address: 0, .. })
        ));
        assert!(link.sent.is_empty());

        let mut link = duplex(header(30, 4, 0).to_vec());
        assert!(matches!(
            server.serve(&mut link),
            Err(MemoryError::OutOfRange { address: 30, length: 4, .. })
        ));
        assert!(link.sent.is_empty());

        let mut requests = header(u64::MAX, 2, 1).to_vec();
        requests.extend_from_slice(&[1, 2]);
        let mut link = duplex(requests);
        assert!(server.serve_one(&mut link).is_err());
        assert!(server.bank().as_bytes().iter().all(|&byte| byte == 0));
    }

    #[test]
    fn test_server_rejects_unknown_op() {
        let mut server = RamServer::new(MemoryBank::new(32));
        let mut link = duplex(header(0, 0, 9).to_vec());
        assert!(matches!(
            server.serve_one(&mut link),
            Err(MemoryError::UnknownOp(9))
        ));
    }
}
