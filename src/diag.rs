//! Allocation-free diagnostics.
//!
//! Everything here formats into a fixed stack buffer and writes straight to
//! file descriptor 2, so it is safe to call from inside the allocator.

use core::fmt::{self, Write};

const BUF_LEN: usize = 512;

/// Fixed-capacity formatter. Output past the capacity is truncated.
struct StackBuf {
  buf: [u8; BUF_LEN],
  len: usize,
}

impl StackBuf {
  const fn new() -> Self {
    Self {
      buf: [0; BUF_LEN],
      len: 0,
    }
  }

  fn flush(&mut self) {
    let mut written = 0;
    while written < self.len {
      let n = unsafe {
        libc::write(
          2,
          self.buf[written..self.len].as_ptr() as *const libc::c_void,
          self.len - written,
        )
      };
      if n <= 0 {
        break;
      }
      written += n as usize;
    }
    self.len = 0;
  }
}

impl Write for StackBuf {
  fn write_str(&mut self, s: &str) -> fmt::Result {
    let room = BUF_LEN - self.len;
    let take = s.len().min(room);
    self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
    self.len += take;
    Ok(())
  }
}

/// Write a formatted line to stderr without allocating.
pub fn report(args: fmt::Arguments<'_>) {
  let mut out = StackBuf::new();
  let _ = out.write_fmt(args);
  let _ = out.write_char('\n');
  out.flush();
}

/// Report, then abort. Used when the heap is known to be corrupt.
#[cfg(all(feature = "heap-check", debug_assertions))]
#[cold]
#[inline(never)]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
  report(args);
  unsafe { libc::abort() }
}
