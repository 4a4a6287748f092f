//! ICY in-band metadata demultiplexer.
//!
//! Shoutcast/Icecast servers asked for `Icy-MetaData: 1` interleave a small
//! metadata block after every `icy-metaint` bytes of audio:
//!
//! ```text
//!   [ audio × metaint ][ len ][ len×16 bytes text ][ audio × metaint ][ len ] ...
//! ```
//!
//! `len` is a single byte, so a block is at most 255×16 = 4080 bytes.  The
//! text looks like `StreamTitle='Artist - Title';StreamUrl='';` padded with
//! NULs.  Network chunks never line up with these boundaries, so the parser
//! keeps its position across `feed` calls.

use reqwest::header::HeaderMap;
use tracing::{debug, trace};

/// Largest possible metadata payload (length byte 255).
pub const MAX_METADATA_LEN: usize = 255 * 16;

/// One demultiplexed piece of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataFrame {
    Audio(Vec<u8>),
    /// Non-empty `StreamTitle` value of one metadata block.
    Title(String),
}

/// Stateful single-stream decoder.  Not shared: one session's pump task owns it.
#[derive(Debug)]
pub struct MetadataFrameParser {
    interval: usize,
    bytes_until_metadata: usize,
    in_metadata_block: bool,
    /// Payload length of the current block; `None` until its length byte is read.
    metadata_length: Option<usize>,
    metadata_buffer: Vec<u8>,
}

impl MetadataFrameParser {
    /// `interval` is the negotiated `icy-metaint`; 0 means passthrough.
    pub fn new(interval: usize) -> Self {
        Self {
            interval,
            bytes_until_metadata: interval,
            in_metadata_block: false,
            metadata_length: None,
            metadata_buffer: Vec::new(),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.interval == 0
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<MetadataFrame> {
        let mut frames = Vec::new();
        if chunk.is_empty() {
            return frames;
        }
        if self.is_passthrough() {
            frames.push(MetadataFrame::Audio(chunk.to_vec()));
            return frames;
        }

        let mut rest = chunk;
        while !rest.is_empty() {
            if !self.in_metadata_block {
                let take = self.bytes_until_metadata.min(rest.len());
                if take > 0 {
                    frames.push(MetadataFrame::Audio(rest[..take].to_vec()));
                    self.bytes_until_metadata -= take;
                    rest = &rest[take..];
                }
                if self.bytes_until_metadata == 0 {
                    self.in_metadata_block = true;
                    self.metadata_length = None;
                    self.metadata_buffer.clear();
                }
                continue;
            }

            let length = match self.metadata_length {
                Some(length) => length,
                None => {
                    let length = rest[0] as usize * 16;
                    rest = &rest[1..];
                    if length == 0 {
                        self.finish_block();
                        continue;
                    }
                    self.metadata_length = Some(length);
                    self.metadata_buffer.reserve(length);
                    length
                }
            };

            let want = length - self.metadata_buffer.len();
            let take = want.min(rest.len());
            self.metadata_buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.metadata_buffer.len() == length {
                let text = decode_metadata(&self.metadata_buffer);
                trace!("icy: metadata block ({} bytes): {:?}", length, text);
                match extract_stream_title(&text) {
                    Some(title) => frames.push(MetadataFrame::Title(title)),
                    None => debug!("icy: metadata block without usable StreamTitle"),
                }
                self.finish_block();
            }
        }
        frames
    }

    fn finish_block(&mut self) {
        self.in_metadata_block = false;
        self.metadata_length = None;
        self.metadata_buffer.clear();
        self.bytes_until_metadata = self.interval;
    }
}

/// UTF-8 first, Latin-1 otherwise (every byte maps to U+0000..U+00FF).
/// Trailing NUL padding is removed.
pub fn decode_metadata(raw: &[u8]) -> String {
    let end = raw
        .iter()
        .rposition(|&b| b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    let raw = &raw[..end];
    match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        Err(_) => raw.iter().map(|&b| b as char).collect(),
    }
}

/// Value of the first `StreamTitle='...'` field, if non-empty.
pub fn extract_stream_title(text: &str) -> Option<String> {
    for quote in ['\'', '"'] {
        let key = format!("StreamTitle={}", quote);
        let Some(start) = text.find(&key) else {
            continue;
        };
        let rest = &text[start + key.len()..];
        let terminator = format!("{};", quote);
        // Titles may contain the quote character itself ("Guns N' Roses"),
        // so prefer the `';` terminator and fall back to the last quote.
        let end = rest.find(&terminator).or_else(|| rest.rfind(quote))?;
        let title = rest[..end].trim();
        return if title.is_empty() {
            None
        } else {
            Some(title.to_string())
        };
    }
    None
}

/// Stream properties announced in the response headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IcyHeaders {
    /// 0 when the server does not interleave metadata.
    pub metaint: usize,
    pub station_name: Option<String>,
    pub content_type: Option<String>,
    pub bitrate: Option<u32>,
}

impl IcyHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Self {
            metaint: text("icy-metaint")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0),
            station_name: text("icy-name"),
            content_type: text("content-type"),
            bitrate: text("icy-br").and_then(|v| v.parse::<u32>().ok()),
        }
    }
}
