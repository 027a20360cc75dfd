//! Byte sources and sinks a transfer reads from or writes into.
//!
//! The capability sets are the std I/O traits: an upload source is anything
//! that reads, a download sink is anything that writes. OS files, in-memory
//! buffers and the standard streams all qualify without adapters; the
//! constructors below exist for the common cases.

use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::path::Path;

use crate::protocol::ErrorCode;

/// An opened byte source for an upload.
pub type Source<'a> = Box<dyn Read + Send + 'a>;

/// An opened byte sink for a download.
pub type Sink<'a> = Box<dyn Write + Send + 'a>;

/// Opens named streams on behalf of a server session.
///
/// The protocol engine never touches the filesystem itself; the dispatcher
/// injects an implementation (normally the rooted filesystem backend) and
/// tests inject in-memory ones. Failures carry the wire error code to answer
/// the request with.
pub trait FileOps: Send {
    /// Open `filename` for a read transfer, returning the source and its
    /// total size (the answer to a `tsize 0` probe).
    fn open_read(&mut self, filename: &[u8]) -> Result<(Source<'static>, u64), (ErrorCode, String)>;

    /// Open `filename` for a write transfer.
    fn open_write(&mut self, filename: &[u8]) -> Result<Sink<'static>, (ErrorCode, String)>;
}

pub fn file_source(path: impl AsRef<Path>) -> io::Result<Source<'static>> {
    Ok(Box::new(File::open(path)?))
}

pub fn file_sink(path: impl AsRef<Path>) -> io::Result<Sink<'static>> {
    Ok(Box::new(File::create(path)?))
}

pub fn memory_source(data: Vec<u8>) -> Source<'static> {
    Box::new(Cursor::new(data))
}

pub fn stdin_source() -> Source<'static> {
    Box::new(io::stdin())
}

pub fn stdout_sink() -> Sink<'static> {
    Box::new(io::stdout())
}

/// Read one block of up to `size` bytes, returning short only at EOF.
///
/// Plain `Read::read` may return fewer bytes than asked for at any time; the
/// block discipline of the protocol needs "short means last", so keep reading
/// until the block is full or the source is exhausted.
pub(crate) fn read_block(src: &mut dyn Read, size: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;

    while filled < size {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }

    buf.truncate(filled);
    Ok(buf)
}
