// src/response.rs
use crate::buffer::{Overflow, WriteBuffer};
use crate::http::{HttpCode, Status};
use crate::resolver::MappedFile;
use arrayvec::ArrayVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ComposeError {
    #[error("outcome {0:?} has no response")]
    NotTerminal(HttpCode),
    #[error("response header does not fit in the write buffer")]
    Overflow,
}

impl From<Overflow> for ComposeError {
    fn from(_: Overflow) -> Self {
        ComposeError::Overflow
    }
}

/// Describes a composed response as at most two segments: the generated
/// bytes in the write buffer, then the mapped file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Output {
    header_len: usize,
    file_len: usize,
    sent: usize,
}

impl Output {
    pub fn new(header_len: usize, file_len: usize) -> Self {
        Self {
            header_len,
            file_len,
            sent: 0,
        }
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn file_len(&self) -> usize {
        self.file_len
    }

    pub fn segment_count(&self) -> usize {
        if self.file_len > 0 { 2 } else { 1 }
    }

    pub fn total(&self) -> usize {
        self.header_len + self.file_len
    }

    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn is_done(&self) -> bool {
        self.sent >= self.total()
    }

    pub fn advance(&mut self, n: usize) {
        self.sent = (self.sent + n).min(self.total());
    }

    /// The unsent parts of `header` and `file`, in order, skipping empty ones.
    pub fn segments<'a>(&self, header: &'a [u8], file: &'a [u8]) -> ArrayVec<&'a [u8], 2> {
        debug_assert_eq!(header.len(), self.header_len);
        debug_assert_eq!(file.len(), self.file_len);

        let mut out = ArrayVec::new();
        if self.sent < self.header_len {
            out.push(&header[self.sent..]);
            if self.file_len > 0 {
                out.push(file);
            }
        } else {
            let offset = self.sent - self.header_len;
            if offset < self.file_len {
                out.push(&file[offset..]);
            }
        }
        out
    }
}

/// Write the status line, headers and (for errors) the canned body of
/// `code` into `out`.
///
/// The file body is never copied; it is accounted for in the returned
/// [`Output`] as the second segment.
pub fn compose(
    out: &mut WriteBuffer,
    code: HttpCode,
    keep_alive: bool,
    file: Option<&MappedFile>,
) -> Result<Output, ComposeError> {
    let status = code.status().ok_or(ComposeError::NotTerminal(code))?;
    out.clear();

    let canned = status.canned_body();
    let file_len = match canned {
        Some(_) => 0,
        None => file.map_or(0, MappedFile::len),
    };
    let content_len = canned.map_or(file_len, str::len);

    add_status_line(out, status)?;
    add_headers(out, content_len, keep_alive)?;
    if let Some(body) = canned {
        add_content(out, body)?;
    }

    Ok(Output::new(out.len(), file_len))
}

fn add_status_line(out: &mut WriteBuffer, status: Status) -> Result<(), Overflow> {
    let mut code = itoa::Buffer::new();
    out.append(b"HTTP/1.1 ")?;
    out.append(code.format(status.code()).as_bytes())?;
    out.append(b" ")?;
    out.append(status.title().as_bytes())?;
    out.append(b"\r\n")
}

fn add_headers(out: &mut WriteBuffer, content_len: usize, keep_alive: bool) -> Result<(), Overflow> {
    add_linger(out, keep_alive)?;
    add_content_length(out, content_len)?;
    add_blank_line(out)
}

fn add_linger(out: &mut WriteBuffer, keep_alive: bool) -> Result<(), Overflow> {
    if keep_alive {
        out.append(b"Connection: keep-alive\r\n")
    } else {
        out.append(b"Connection: close\r\n")
    }
}

fn add_content_length(out: &mut WriteBuffer, len: usize) -> Result<(), Overflow> {
    let mut n = itoa::Buffer::new();
    out.append(b"Content-Length: ")?;
    out.append(n.format(len).as_bytes())?;
    out.append(b"\r\n")
}

fn add_blank_line(out: &mut WriteBuffer) -> Result<(), Overflow> {
    out.append(b"\r\n")
}

fn add_content(out: &mut WriteBuffer, body: &str) -> Result<(), Overflow> {
    out.append(body.as_bytes())
}
