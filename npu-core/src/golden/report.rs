//! Bounded compare report

use std::fmt;

const TRUNCATION_NOTICE: &str = "... report truncated ...\n";

/// Text buffer that stops accepting writes at a fixed capacity
///
/// The first write that does not fit is cut at the capacity and followed
/// by a single truncation notice; later writes are dropped.
#[derive(Debug)]
pub struct ReportBuffer {
    text: String,
    capacity: usize,
    truncated: bool,
}

impl ReportBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            text: String::new(),
            capacity: capacity.max(TRUNCATION_NOTICE.len()),
            truncated: false,
        }
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.truncated = false;
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

impl fmt::Write for ReportBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.truncated {
            return Ok(());
        }

        // Untruncated text always leaves room for the notice
        let room = self.capacity - TRUNCATION_NOTICE.len() - self.text.len();
        if s.len() <= room {
            self.text.push_str(s);
            return Ok(());
        }

        let mut cut = room;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        self.text.push_str(&s[..cut]);
        self.text.push_str(TRUNCATION_NOTICE);
        self.truncated = true;
        Ok(())
    }
}
