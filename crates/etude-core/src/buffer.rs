// src/buffer.rs

pub const READ_BUFFER_SIZE: usize = 2048;
pub const WRITE_BUFFER_SIZE: usize = 1024;

/// Result of scanning the read buffer for the next CRLF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A full line is available through [`ReadBuffer::get_line`].
    Ok,
    /// Malformed line ending.
    Bad,
    /// Line not fully received yet.
    Open,
}

/// Fixed-capacity input buffer.
///
/// Holds `start_line <= checked_index <= read_index <= READ_BUFFER_SIZE`.
pub struct ReadBuffer {
    data: [u8; READ_BUFFER_SIZE],
    read_index: usize,
    checked_index: usize,
    start_line: usize,
    line_end: usize,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self {
            data: [0; READ_BUFFER_SIZE],
            read_index: 0,
            checked_index: 0,
            start_line: 0,
            line_end: 0,
        }
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
        self.read_index = 0;
        self.checked_index = 0;
        self.start_line = 0;
        self.line_end = 0;
    }

    /// Unfilled tail the next receive writes into.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.read_index..]
    }

    /// Commit `n` bytes received into [`spare_mut`](Self::spare_mut).
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.read_index + n <= READ_BUFFER_SIZE);
        self.read_index = (self.read_index + n).min(READ_BUFFER_SIZE);
    }

    /// Append bytes directly; returns how many fit.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> usize {
        let spare = self.spare_mut();
        let n = bytes.len().min(spare.len());
        spare[..n].copy_from_slice(&bytes[..n]);
        self.advance(n);
        n
    }

    pub fn is_full(&self) -> bool {
        self.read_index == READ_BUFFER_SIZE
    }

    pub fn read_index(&self) -> usize {
        self.read_index
    }

    pub fn checked_index(&self) -> usize {
        self.checked_index
    }

    pub fn start_line(&self) -> usize {
        self.start_line
    }

    /// Scan forward from `checked_index` for the end of the current line.
    ///
    /// A `\r` that is the last received byte leaves `checked_index` on it and
    /// reports `Open`, so the next scan sees it again once more bytes arrive.
    pub fn parse_line(&mut self) -> LineStatus {
        while self.checked_index < self.read_index {
            let i = self.checked_index;
            match self.data[i] {
                b'\r' => {
                    if i + 1 == self.read_index {
                        return LineStatus::Open;
                    }
                    if self.data[i + 1] == b'\n' {
                        self.terminate_line(i);
                        return LineStatus::Ok;
                    }
                    return LineStatus::Bad;
                }
                b'\n' => {
                    if i > self.start_line && self.data[i - 1] == b'\r' {
                        self.terminate_line(i - 1);
                        return LineStatus::Ok;
                    }
                    return LineStatus::Bad;
                }
                _ => self.checked_index += 1,
            }
        }
        LineStatus::Open
    }

    fn terminate_line(&mut self, cr: usize) {
        self.data[cr] = 0;
        self.data[cr + 1] = 0;
        self.line_end = cr;
        self.checked_index = cr + 2;
    }

    /// The line found by the last successful [`parse_line`](Self::parse_line),
    /// without its CRLF.
    pub fn get_line(&self) -> &[u8] {
        &self.data[self.start_line..self.line_end]
    }

    /// Start the next line at the current scan position.
    pub fn next_line(&mut self) {
        self.start_line = self.checked_index;
    }

    /// `len` bytes of body starting at `checked_index`, if all received.
    pub fn content(&self, len: usize) -> Option<&[u8]> {
        let end = self.checked_index.checked_add(len)?;
        (end <= self.read_index).then(|| &self.data[self.checked_index..end])
    }
}

impl Default for ReadBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// The response would not fit in the write buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow;

/// Fixed-capacity output buffer for generated response headers.
pub struct WriteBuffer {
    data: [u8; WRITE_BUFFER_SIZE],
    write_index: usize,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self {
            data: [0; WRITE_BUFFER_SIZE],
            write_index: 0,
        }
    }

    /// Append all of `bytes` or nothing.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), Overflow> {
        let end = self.write_index + bytes.len();
        if end > WRITE_BUFFER_SIZE {
            return Err(Overflow);
        }
        self.data[self.write_index..end].copy_from_slice(bytes);
        self.write_index = end;
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.write_index]
    }

    pub fn len(&self) -> usize {
        self.write_index
    }

    pub fn is_empty(&self) -> bool {
        self.write_index == 0
    }

    pub fn clear(&mut self) {
        self.write_index = 0;
    }
}

impl Default for WriteBuffer {
    fn default() -> Self {
        Self::new()
    }
}
