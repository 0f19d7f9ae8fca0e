//! `OpenInfo` reflection stream.
//!
//! A process can open a read-only stream describing the live process
//! table: one line per process, `pid parent thread_count`. It is rendered
//! once, at open time, into a flat buffer; reading it never blocks, and it
//! never observes updates made after it was opened (a live, point-in-time
//! snapshot rather than a subscription).

pub(crate) struct InfoStream {
    data: Vec<u8>,
    pos: usize,
}

impl InfoStream {
    pub(crate) fn render(rows: impl Iterator<Item = (u32, Option<u32>, usize)>) -> Self {
        let mut data = String::new();
        for (pid, parent, thread_count) in rows {
            match parent {
                Some(p) => data.push_str(&format!("{pid} {p} {thread_count}\n")),
                None => data.push_str(&format!("{pid} - {thread_count}\n")),
            }
        }
        InfoStream { data: data.into_bytes(), pos: 0 }
    }

    pub(crate) fn read(&mut self, out: &mut [u8]) -> usize {
        let remaining = &self.data[self.pos..];
        let n = remaining.len().min(out.len());
        out[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_one_line_per_process() {
        let mut s = InfoStream::render(vec![(1, None, 2), (2, Some(1), 1)].into_iter());
        let mut buf = [0u8; 256];
        let n = s.read(&mut buf);
        let text = std::str::from_utf8(&buf[..n]).unwrap();
        assert_eq!(text, "1 - 2\n2 1 1\n");
    }

    #[test]
    fn further_reads_after_exhaustion_return_zero() {
        let mut s = InfoStream::render(std::iter::empty());
        let mut buf = [0u8; 8];
        assert_eq!(s.read(&mut buf), 0);
    }
}
