//! Zlib inflation with pooled state.
//!
//! Inflaters are checked out per operation from a small thread-local pool
//! and returned on drop, so no inflater ever crosses a thread boundary
//! while in use.

use crate::{Error, Result};
use flate2::{Compression, Decompress, FlushDecompress, Status};
use std::cell::RefCell;
use std::io::Write;

const POOL_CAP: usize = 4;

thread_local! {
    static POOL: RefCell<Vec<Decompress>> = const { RefCell::new(Vec::new()) };
}

/// Check an inflater out of the current thread's pool.
pub fn checkout() -> Inflater {
    let raw = POOL
        .with(|p| p.borrow_mut().pop())
        .map(|mut d| {
            d.reset(true);
            d
        })
        .unwrap_or_else(|| Decompress::new(true));
    Inflater {
        raw: Some(raw),
        input: Vec::new(),
        in_pos: 0,
        finished: false,
    }
}

/// Incremental zlib inflater over caller-supplied input windows.
pub struct Inflater {
    raw: Option<Decompress>,
    input: Vec<u8>,
    in_pos: usize,
    finished: bool,
}

impl Inflater {
    /// Replace the pending input window. Any unconsumed bytes from the
    /// previous window are discarded, so callers feed input exactly as
    /// fast as [`Inflater::needs_input`] asks for it.
    pub fn set_input(&mut self, input: &[u8]) {
        self.input.clear();
        self.input.extend_from_slice(input);
        self.in_pos = 0;
    }

    /// True when the current input window is exhausted and the stream has
    /// not yet ended.
    pub fn needs_input(&self) -> bool {
        !self.finished && self.in_pos == self.input.len()
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Total compressed bytes consumed since checkout.
    pub fn bytes_read(&self) -> u64 {
        self.raw.as_ref().map(|d| d.total_in()).unwrap_or(0)
    }

    /// Inflate into `dst`, returning the number of bytes written. Zero
    /// means either the stream ended or more input is required.
    pub fn inflate(&mut self, dst: &mut [u8]) -> Result<usize> {
        if self.finished || dst.is_empty() {
            return Ok(0);
        }
        let raw = self.raw.as_mut().expect("inflater state present until drop");
        let before_in = raw.total_in();
        let before_out = raw.total_out();
        let status = raw
            .decompress(&self.input[self.in_pos..], dst, FlushDecompress::None)
            .map_err(|e| Error::CorruptBlock {
                position: 0,
                reason: format!("zlib: {e}"),
            })?;
        self.in_pos += (raw.total_in() - before_in) as usize;
        if status == Status::StreamEnd {
            self.finished = true;
        }
        Ok((raw.total_out() - before_out) as usize)
    }
}

impl Drop for Inflater {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            POOL.with(|p| {
                let mut pool = p.borrow_mut();
                if pool.len() < POOL_CAP {
                    pool.push(raw);
                }
            });
        }
    }
}

/// Inflate a buffer that must decompress to exactly `expected` bytes.
///
/// Returns the inflated bytes and the number of compressed bytes
/// consumed. The stream must end exactly at `expected`; anything else is
/// corruption (callers attach the file position).
pub fn inflate_sized(input: &[u8], expected: usize) -> Result<(Vec<u8>, u64)> {
    let mut inf = checkout();
    inf.set_input(input);
    let mut out = vec![0u8; expected];
    let mut filled = 0;
    while filled < expected {
        if inf.needs_input() {
            return Err(Error::CorruptBlock {
                position: 0,
                reason: format!("deflate stream ran dry at {filled} of {expected} bytes"),
            });
        }
        let n = inf.inflate(&mut out[filled..])?;
        if n == 0 {
            if inf.finished() {
                break;
            }
            if !inf.needs_input() {
                return Err(Error::CorruptBlock {
                    position: 0,
                    reason: "deflate stream stalled".into(),
                });
            }
        }
        filled += n;
    }
    if filled != expected || !drained(&mut inf)? {
        return Err(Error::CorruptBlock {
            position: 0,
            reason: format!("deflate stream did not end at declared size {expected}"),
        });
    }
    Ok((out, inf.bytes_read()))
}

// the stream must report StreamEnd with no further output
fn drained(inf: &mut Inflater) -> Result<bool> {
    if inf.finished() {
        return Ok(true);
    }
    let mut probe = [0u8; 1];
    let n = inf.inflate(&mut probe)?;
    Ok(n == 0 && inf.finished())
}

/// Deflate a buffer with default compression.
pub fn deflate(input: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(input)
        .and_then(|_| encoder.finish())
        .expect("writing to an in-memory encoder cannot fail")
}
