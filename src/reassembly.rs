//! Per-session frame reassembly (C5, spec §4.5).
//!
//! Each session owns exactly one buffer per direction. Appending never
//! parses; `try_extract_frame` is the only thing that removes bytes, and it
//! removes at most one frame (or discards garbage) per call.

use crate::codec::gseries;
use crate::codec::ttseries;

/// Accumulates inbound notification bytes and recovers whole frames.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    variant: Variant,
    buf: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    GSeries,
    TtSeries,
}

impl ReassemblyBuffer {
    pub fn g_series() -> Self {
        ReassemblyBuffer { variant: Variant::GSeries, buf: Vec::new() }
    }

    pub fn tt_series() -> Self {
        ReassemblyBuffer { variant: Variant::TtSeries, buf: Vec::new() }
    }

    /// Appends a notification payload. Does not attempt extraction itself;
    /// call [`Self::try_extract_frame`] afterward.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Tries to pull the next complete frame out of the buffer. Returns
    /// `None` if more data is needed. May shrink the buffer even when
    /// returning `None` (garbage discarded ahead of a G-Series header, or a
    /// whole TT-Series buffer discarded on an invalid ENC byte).
    pub fn try_extract_frame(&mut self) -> Option<Vec<u8>> {
        match self.variant {
            Variant::GSeries => self.try_extract_g_series(),
            Variant::TtSeries => self.try_extract_tt_series(),
        }
    }

    fn try_extract_g_series(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() >= 3 && self.buf[0] == 0x20 && self.buf[1] == 0xF1 {
            let frame = self.buf[0..3].to_vec();
            self.buf.drain(0..3);
            return Some(frame);
        }

        let header_pos = find_subsequence(&self.buf, &gseries::RESP_HEADER)?;
        if header_pos > 0 {
            self.buf.drain(0..header_pos);
        }

        let tail_pos = find_subsequence(&self.buf[2..], &gseries::RESP_TAIL).map(|p| p + 2)?;
        let frame_end = tail_pos + gseries::RESP_TAIL.len();
        let frame = self.buf[0..frame_end].to_vec();
        self.buf.drain(0..frame_end);
        Some(frame)
    }

    fn try_extract_tt_series(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < 2 {
            return None;
        }
        let enc = self.buf[0];
        let len = self.buf[1] as usize;

        if enc != ttseries::ENC_PLAIN && enc != ttseries::ENC_AES {
            log::warn!(target: "reassembly", "TT-Series buffer desynchronized (ENC byte {:#04x}); discarding", enc);
            self.buf.clear();
            return None;
        }

        let body_len = if enc == ttseries::ENC_AES { len.div_ceil(16) * 16 } else { len };
        let frame_len = 2 + body_len + 1;

        if self.buf.len() < frame_len {
            return None;
        }

        let frame = self.buf[0..frame_len].to_vec();
        self.buf.drain(0..frame_len);
        Some(frame)
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
