//! # Frame Assembly Module
//!
//! BLE notifications are capped in size and arrive with no alignment to text
//! lines. `FrameAssembler` accumulates fragments and cuts them into lines.
//!
//! ## Delimiters
//! LF, CR, CRLF (consumed as one), NUL, and the control bytes 0x1D, 0x1E,
//! 0x1F, 0x03, 0x04 used by some firmware variants. The earliest delimiter in
//! the accumulator always ends the current line.
//!
//! ## Lossy behavior
//! - Lines that are not valid UTF-8 are dropped and logged
//! - Empty lines and lines made only of commas/whitespace are dropped as noise
//! - Without any delimiter the accumulator is capped at 64 KiB by dropping the
//!   oldest bytes

/// Soft cap on bytes held while waiting for a delimiter
pub const MAX_PENDING_BYTES: usize = 64 * 1024;

/// Accumulator size that triggers the one-time diagnostic preview
pub const PREVIEW_THRESHOLD: usize = 256;

const PREVIEW_BYTES: usize = 32;

const DELIMITERS: [u8; 8] = [b'\n', b'\r', 0x00, 0x1e, 0x1f, 0x1d, 0x03, 0x04];

fn delimiter_name(byte: u8, crlf: bool) -> &'static str {
    match byte {
        b'\r' if crlf => "CRLF",
        b'\n' => "LF",
        b'\r' => "CR",
        0x00 => "NUL",
        0x1e => "RS",
        0x1f => "US",
        0x1d => "GS",
        0x03 => "ETX",
        0x04 => "EOT",
        _ => "?",
    }
}

/// Result of one extraction attempt
enum Extracted {
    Line(String),
    Discarded,
    Incomplete,
}

/// Reassembles delimited text lines from arbitrarily sized byte fragments.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    accumulator: Vec<u8>,
    preview_logged: bool,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return the lines it completes.
    ///
    /// The iterator is lazy: lines are cut from the accumulator as it is
    /// pulled. Lines not pulled stay buffered for the next call.
    pub fn feed(&mut self, fragment: &[u8]) -> Lines<'_> {
        self.accumulator.extend_from_slice(fragment);
        Lines { assembler: self }
    }

    /// Bytes waiting for a delimiter
    pub fn buffered_len(&self) -> usize {
        self.accumulator.len()
    }

    /// Drop any partial line, e.g. after reconnecting
    pub fn reset(&mut self) {
        self.accumulator.clear();
    }

    #[cfg(test)]
    pub(crate) fn preview_logged(&self) -> bool {
        self.preview_logged
    }

    fn extract(&mut self) -> Extracted {
        let Some(idx) = self
            .accumulator
            .iter()
            .position(|b| DELIMITERS.contains(b))
        else {
            self.handle_incomplete();
            return Extracted::Incomplete;
        };

        let crlf = self.accumulator[idx] == b'\r' && self.accumulator.get(idx + 1) == Some(&b'\n');
        let consume = if crlf { 2 } else { 1 };
        let delimiter = delimiter_name(self.accumulator[idx], crlf);

        let line: Vec<u8> = self.accumulator.drain(..idx + consume).take(idx).collect();

        let text = match String::from_utf8(line) {
            Ok(text) => text,
            Err(e) => {
                log::error!("UTF-8 decode failed: {:?}", e.as_bytes());
                return Extracted::Discarded;
            }
        };

        if text.trim().is_empty() || text.replace(',', "").trim().is_empty() {
            log::debug!("Skipping noise line: {:?}", text);
            return Extracted::Discarded;
        }

        log::debug!("Line completed (delimiter={}): {}", delimiter, text);
        Extracted::Line(text)
    }

    fn handle_incomplete(&mut self) {
        if self.accumulator.is_empty() {
            return;
        }

        log::debug!(
            "Buffer accumulating: {} bytes (line incomplete)",
            self.accumulator.len()
        );

        if !self.preview_logged && self.accumulator.len() >= PREVIEW_THRESHOLD {
            log_preview(&self.accumulator);
            self.preview_logged = true;
        }

        if self.accumulator.len() > MAX_PENDING_BYTES {
            let drop = self.accumulator.len() - MAX_PENDING_BYTES;
            log::warn!("Buffer overflow protection: trimming {} bytes", drop);
            self.accumulator.drain(..drop);
        }
    }
}

/// Lazy line iterator returned by `FrameAssembler::feed`
pub struct Lines<'a> {
    assembler: &'a mut FrameAssembler,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            match self.assembler.extract() {
                Extracted::Line(text) => return Some(text),
                Extracted::Discarded => continue,
                Extracted::Incomplete => return None,
            }
        }
    }
}

fn hex_str(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn ascii_str(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if (32..127).contains(&b) { b as char } else { '.' })
        .collect()
}

/// HEX/ASCII dump of the head and tail, to identify unknown control bytes
fn log_preview(buffer: &[u8]) {
    let mut control: Vec<u8> = buffer.iter().copied().filter(|b| *b < 0x20).collect();
    control.sort_unstable();
    control.dedup();
    if !control.is_empty() {
        log::debug!("Control bytes present: {}", hex_str(&control));
    }

    let head = &buffer[..buffer.len().min(PREVIEW_BYTES)];
    log::debug!("HEX preview (head): {} | ASCII: {}", hex_str(head), ascii_str(head));

    if buffer.len() > PREVIEW_BYTES {
        let tail = &buffer[buffer.len() - PREVIEW_BYTES..];
        log::debug!("HEX preview (tail): {} | ASCII: {}", hex_str(tail), ascii_str(tail));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROW_A: &str = "100,0.1,0.2,0.3,1,2,3,25.0,-1";
    const ROW_B: &str = "140,0.4,0.5,0.6,4,5,6,25.1,300.5";

    fn collect_whole(input: &[u8]) -> Vec<String> {
        FrameAssembler::new().feed(input).collect()
    }

    fn collect_split(input: &[u8], chunk: usize) -> Vec<String> {
        let mut assembler = FrameAssembler::new();
        let mut lines = Vec::new();
        for fragment in input.chunks(chunk) {
            lines.extend(assembler.feed(fragment));
        }
        lines
    }

    #[test]
    fn test_single_line_lf() {
        let lines = collect_whole(format!("{}\n", ROW_A).as_bytes());
        assert_eq!(lines, vec![ROW_A.to_string()]);
    }

    #[test]
    fn test_incomplete_line_is_held() {
        let mut assembler = FrameAssembler::new();
        assert_eq!(assembler.feed(b"100,0.1,0.2").count(), 0);
        assert_eq!(assembler.buffered_len(), 11);
        let lines: Vec<String> = assembler.feed(b",0.3,1,2,3,25.0,-1\n").collect();
        assert_eq!(lines, vec![ROW_A.to_string()]);
        assert_eq!(assembler.buffered_len(), 0);
    }

    #[test]
    fn test_fragmentation_is_transparent_for_every_delimiter() {
        let delimiters: [&[u8]; 9] = [
            b"\n", b"\r", b"\r\n", b"\x00", b"\x1d", b"\x1e", b"\x1f", b"\x03", b"\x04",
        ];
        for delim in delimiters {
            let mut input = Vec::new();
            for row in [ROW_A, ROW_B, ROW_A] {
                input.extend_from_slice(row.as_bytes());
                input.extend_from_slice(delim);
            }
            let expected = collect_whole(&input);
            assert_eq!(expected, vec![ROW_A, ROW_B, ROW_A], "delimiter {:?}", delim);
            for chunk in 1..=input.len() {
                assert_eq!(
                    collect_split(&input, chunk),
                    expected,
                    "delimiter {:?} chunk {}",
                    delim,
                    chunk
                );
            }
        }
    }

    #[test]
    fn test_crlf_split_across_fragments() {
        let mut assembler = FrameAssembler::new();
        let mut lines: Vec<String> = assembler.feed(format!("{}\r", ROW_A).as_bytes()).collect();
        lines.extend(assembler.feed(format!("\n{}\r\n", ROW_B).as_bytes()));
        assert_eq!(lines, vec![ROW_A.to_string(), ROW_B.to_string()]);
        assert_eq!(assembler.buffered_len(), 0);
    }

    #[test]
    fn test_earliest_delimiter_wins() {
        let lines = collect_whole(b"a1,2\x04b3,4\ncc\x00");
        assert_eq!(lines, vec!["a1,2", "b3,4", "cc"]);
    }

    #[test]
    fn test_noise_lines_are_discarded() {
        let lines = collect_whole(format!("\n\n , ,\n,,,\n   \n{}\n", ROW_A).as_bytes());
        assert_eq!(lines, vec![ROW_A.to_string()]);
    }

    #[test]
    fn test_invalid_utf8_line_is_dropped() {
        let mut input = vec![0xff, 0xfe, b'1', b'\n'];
        input.extend_from_slice(format!("{}\n", ROW_B).as_bytes());
        assert_eq!(collect_whole(&input), vec![ROW_B.to_string()]);
    }

    #[test]
    fn test_overflow_trims_oldest_bytes() {
        let mut assembler = FrameAssembler::new();
        let big = vec![b'x'; MAX_PENDING_BYTES + 100];
        assert_eq!(assembler.feed(&big).count(), 0);
        assert_eq!(assembler.buffered_len(), MAX_PENDING_BYTES);

        let lines: Vec<String> = assembler.feed(b"yz\n").collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), MAX_PENDING_BYTES + 2);
        assert!(lines[0].ends_with("xyz"));
    }

    #[test]
    fn test_preview_fires_once() {
        let mut assembler = FrameAssembler::new();
        assembler.feed(&[b'a'; PREVIEW_THRESHOLD - 1]).for_each(drop);
        assert!(!assembler.preview_logged());
        assembler.feed(b"a").for_each(drop);
        assert!(assembler.preview_logged());

        assembler.feed(b"\n").for_each(drop);
        assembler.feed(&[b'b'; PREVIEW_THRESHOLD * 2]).for_each(drop);
        assert!(assembler.preview_logged());
    }

    #[test]
    fn test_unpulled_lines_remain_buffered() {
        let mut assembler = FrameAssembler::new();
        let input = format!("{}\n{}\n", ROW_A, ROW_B);
        let first = assembler.feed(input.as_bytes()).next();
        assert_eq!(first.as_deref(), Some(ROW_A));
        let rest: Vec<String> = assembler.feed(&[]).collect();
        assert_eq!(rest, vec![ROW_B.to_string()]);
    }

    #[test]
    fn test_reset_drops_partial_line() {
        let mut assembler = FrameAssembler::new();
        assembler.feed(b"partial").for_each(drop);
        assembler.reset();
        assert_eq!(assembler.buffered_len(), 0);
    }
}
