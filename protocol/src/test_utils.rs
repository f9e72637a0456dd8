use core::{
    cell::RefCell,
    convert::Infallible,
    fmt::Write as _,
    future::poll_fn,
    task::{Poll, Waker},
};
use embedded_io_async::{ErrorType, Read, Write};
use log::LevelFilter;
use std::{collections::VecDeque, rc::Rc};

/// Adapter replies to the seven handshake steps.
pub const HANDSHAKE_REPLIES: [&str; 7] = ["\r", "\r", "V1013\r", "V1013\r", "v0107\r", "\r", "\r"];

pub fn init_logger() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::max())
        .is_test(true)
        .try_init();
}

#[derive(Default, Debug)]
struct Inner {
    rx: VecDeque<u8>,
    line: Vec<u8>,
    replies: VecDeque<String>,
    written: Vec<String>,
    eof: bool,
    waker: Option<Waker>,
}

/// Scripted SLCAN adapter.
///
/// Every CR-terminated line written releases the next scripted reply into the
/// receive buffer. Reads pend while the buffer is empty.
#[derive(Clone, Default, Debug)]
pub struct MockAdapter(Rc<RefCell<Inner>>);

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an adapter that acknowledges the connection handshake.
    pub fn connected() -> Self {
        let adapter = Self::new();

        for reply in HANDSHAKE_REPLIES {
            adapter.reply(reply);
        }

        adapter
    }

    /// Queues the reply released by the next written line.
    pub fn reply(&self, reply: &str) -> &Self {
        self.0.borrow_mut().replies.push_back(reply.into());
        self
    }

    /// Makes bytes readable immediately.
    pub fn unsolicited(&self, data: &str) -> &Self {
        let mut inner = self.0.borrow_mut();

        inner.rx.extend(data.bytes());

        if let Some(waker) = inner.waker.take() {
            waker.wake();
        }

        drop(inner);
        self
    }

    /// Reports end-of-file once the receive buffer runs empty.
    pub fn eof(&self) -> &Self {
        self.0.borrow_mut().eof = true;
        self
    }

    /// Returns all lines written so far, including their terminator.
    pub fn written(&self) -> Vec<String> {
        self.0.borrow().written.clone()
    }
}

impl ErrorType for MockAdapter {
    type Error = Infallible;
}

impl Read for MockAdapter {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        poll_fn(|cx| {
            let mut inner = self.0.borrow_mut();

            if inner.rx.is_empty() {
                if inner.eof {
                    return Poll::Ready(Ok(0));
                }

                inner.waker = Some(cx.waker().clone());

                return Poll::Pending;
            }

            let len = buf.len().min(inner.rx.len());

            for (dst, src) in buf.iter_mut().zip(inner.rx.drain(..len)) {
                *dst = src;
            }

            Poll::Ready(Ok(len))
        })
        .await
    }
}

impl Write for MockAdapter {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let mut inner = self.0.borrow_mut();

        for &byte in buf {
            inner.line.push(byte);

            if byte == b'\r' {
                let line = String::from_utf8_lossy(&inner.line).into_owned();

                inner.line.clear();
                inner.written.push(line);

                if let Some(reply) = inner.replies.pop_front() {
                    inner.rx.extend(reply.bytes());
                }
            }
        }

        if let Some(waker) = inner.waker.take() {
            waker.wake();
        }

        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Formats an element count response.
pub fn count_reply(count: u32) -> String {
    format!("T09FD7FE04{count:08X}\r")
}

/// Formats data as a burst of element data frames.
pub fn burst(data: &[u8]) -> String {
    let mut out = String::new();

    for chunk in data.chunks(8) {
        let _ = write!(out, "T09FDBFE0{:X}", chunk.len());

        for byte in chunk {
            let _ = write!(out, "{byte:02X}");
        }

        out.push('\r');
    }

    out
}

/// Scripts a single-chunk element discovery of the given table.
pub fn script_discovery(adapter: &MockAdapter, table: &[u8], reported: u32) {
    adapter
        .reply(&count_reply(reported))
        .reply("Z\r")
        .reply(&burst(table));
}
