//! Parent-side ends of the child's standard streams.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};

/// Writable end of a child's stdin pipe.
///
/// Dropping it flushes buffered data and closes the pipe, which the child
/// observes as end of input.
#[derive(Debug)]
pub struct ChildStdin {
    inner: BufWriter<File>,
}

/// Readable end of a child's stdout pipe.
///
/// In text mode `\r\n` and lone `\r` read as `\n`.
#[derive(Debug)]
pub struct ChildStdout {
    inner: PipeReader,
}

/// Readable end of a child's stderr pipe. Same text-mode rules as [`ChildStdout`].
#[derive(Debug)]
pub struct ChildStderr {
    inner: PipeReader,
}

impl ChildStdin {
    pub(crate) fn new(file: File) -> Self {
        Self {
            inner: BufWriter::new(file),
        }
    }

    pub fn get_ref(&self) -> &File {
        self.inner.get_ref()
    }
}

impl Write for ChildStdin {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Buffered pipe reader with optional newline translation.
#[derive(Debug)]
struct PipeReader {
    inner: BufReader<File>,
    text: bool,
    /// Translated bytes not yet consumed (text mode only).
    translated: Vec<u8>,
    pos: usize,
    /// The last raw byte was `\r`, so a leading `\n` in the next chunk is dropped.
    after_cr: bool,
}

impl PipeReader {
    fn new(inner: BufReader<File>, text: bool) -> Self {
        Self {
            inner,
            text,
            translated: Vec::new(),
            pos: 0,
            after_cr: false,
        }
    }

    /// Translate raw chunks until there is output or the pipe hits end of file.
    fn refill(&mut self) -> io::Result<()> {
        self.translated.clear();
        self.pos = 0;
        while self.translated.is_empty() {
            let raw = self.inner.fill_buf()?;
            if raw.is_empty() {
                break;
            }
            let taken = raw.len();
            for &b in raw {
                match b {
                    b'\n' if self.after_cr => self.after_cr = false,
                    b'\r' => {
                        self.translated.push(b'\n');
                        self.after_cr = true;
                    }
                    _ => {
                        self.translated.push(b);
                        self.after_cr = false;
                    }
                }
            }
            self.inner.consume(taken);
        }
        Ok(())
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.text {
            return self.inner.read(buf);
        }
        let available = self.fill_buf()?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl BufRead for PipeReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if !self.text {
            return self.inner.fill_buf();
        }
        if self.pos >= self.translated.len() {
            self.refill()?;
        }
        Ok(&self.translated[self.pos..])
    }

    fn consume(&mut self, amt: usize) {
        if self.text {
            self.pos = (self.pos + amt).min(self.translated.len());
        } else {
            self.inner.consume(amt);
        }
    }
}

macro_rules! reader_stream {
    ($name:ident) => {
        impl $name {
            pub(crate) fn new(file: File, text: bool) -> Self {
                Self {
                    inner: PipeReader::new(BufReader::new(file), text),
                }
            }

            pub fn get_ref(&self) -> &File {
                self.inner.inner.get_ref()
            }
        }

        impl Read for $name {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                self.inner.read(buf)
            }
        }

        impl BufRead for $name {
            fn fill_buf(&mut self) -> io::Result<&[u8]> {
                self.inner.fill_buf()
            }

            fn consume(&mut self, amt: usize) {
                self.inner.consume(amt)
            }
        }
    };
}

reader_stream!(ChildStdout);
reader_stream!(ChildStderr);

/// Parent-side pipe ends produced by a successful spawn.
#[derive(Debug, Default)]
pub(crate) struct ParentStreams {
    pub stdin: Option<File>,
    pub stdout: Option<File>,
    pub stderr: Option<File>,
}
