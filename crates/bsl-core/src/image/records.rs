//! Firmware file parsing.
//!
//! Accepts the two text formats MSP430 toolchains emit:
//! - TI-TXT: `@ADDR` lines followed by rows of space separated hex bytes,
//!   terminated by `q`.
//! - Intel-Hex: `:LLAAAATT<data>CC` records. Only the byte count, address
//!   and data are used; an empty record ends the file.
//!
//! Both formats may be mixed line by line.

use std::path::Path;

use super::ImageError;

/// A contiguous run of bytes starting at `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub address: u32,
    pub data: Vec<u8>,
}

impl Segment {
    /// First address past the segment.
    pub fn end(&self) -> u32 {
        self.address + self.data.len() as u32
    }
}

/// Parsed firmware file: an ordered list of segments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareFile {
    segments: Vec<Segment>,
}

impl FirmwareFile {
    /// Read and parse a firmware file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|source| ImageError::FileOpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        parse_str(&String::from_utf8_lossy(&raw))
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Address of the first record in file order.
    pub fn first_address(&self) -> Option<u32> {
        self.segments.first().map(|s| s.address)
    }

    /// Total number of data bytes.
    pub fn total_len(&self) -> usize {
        self.segments.iter().map(|s| s.data.len()).sum()
    }

    /// Iterate over the file in blocks of at most `max_len` bytes.
    pub fn blocks(&self, max_len: usize) -> Blocks<'_> {
        Blocks::new(&self.segments, max_len)
    }

    /// Append bytes, extending the last segment when they are contiguous.
    pub fn push(&mut self, address: u32, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        match self.segments.last_mut() {
            Some(last) if last.end() == address => last.data.extend_from_slice(bytes),
            _ => self.segments.push(Segment {
                address,
                data: bytes.to_vec(),
            }),
        }
    }
}

/// Parse TI-TXT and/or Intel-Hex text.
pub fn parse_str(text: &str) -> Result<FirmwareFile, ImageError> {
    let mut file = FirmwareFile::default();
    let mut address: Option<u32> = None;

    for (index, raw_line) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.trim_end();

        if let Some(record) = line.strip_prefix(':') {
            match parse_hex_record(record, line_no)? {
                Some((addr, data)) => file.push(addr, &data),
                None => break,
            }
        } else if let Some(addr) = line.strip_prefix('@') {
            let addr = u32::from_str_radix(addr.trim(), 16).map_err(|_| {
                ImageError::Malformed {
                    line: line_no,
                    reason: format!("bad address '{}'", addr.trim()),
                }
            })?;
            address = Some(addr);
        } else if line.starts_with('q') || line.starts_with('Q') {
            break;
        } else if !line.is_empty() {
            let start = address.ok_or_else(|| ImageError::Malformed {
                line: line_no,
                reason: "data before first address line".to_string(),
            })?;
            let data = parse_data_row(line.as_bytes(), line_no)?;
            file.push(start, &data);
            address = Some(start + data.len() as u32);
        }
    }

    Ok(file)
}

/// Returns `None` for the terminating empty record.
fn parse_hex_record(record: &str, line: usize) -> Result<Option<(u32, Vec<u8>)>, ImageError> {
    let bytes = record.as_bytes();
    let count = hex_byte(bytes, 0, line)? as usize;
    if count == 0 {
        return Ok(None);
    }

    let hi = hex_byte(bytes, 2, line)?;
    let lo = hex_byte(bytes, 4, line)?;
    let address = u16::from_be_bytes([hi, lo]) as u32;

    // Data starts after LL AAAA TT.
    let data = (0..count)
        .map(|i| hex_byte(bytes, 8 + i * 2, line))
        .collect::<Result<Vec<u8>, _>>()?;

    Ok(Some((address, data)))
}

fn parse_data_row(bytes: &[u8], line: usize) -> Result<Vec<u8>, ImageError> {
    let mut data = Vec::with_capacity(bytes.len().div_ceil(3));
    let mut pos = 0;
    while pos + 2 <= bytes.len() {
        data.push(hex_byte(bytes, pos, line)?);
        pos += 3;
    }
    Ok(data)
}

fn hex_byte(bytes: &[u8], pos: usize, line: usize) -> Result<u8, ImageError> {
    let malformed = |reason: String| ImageError::Malformed { line, reason };
    let pair = bytes
        .get(pos..pos + 2)
        .ok_or_else(|| malformed(format!("record truncated at column {}", pos + 1)))?;
    let hi = hex_digit(pair[0]);
    let lo = hex_digit(pair[1]);
    match (hi, lo) {
        (Some(hi), Some(lo)) => Ok(hi << 4 | lo),
        _ => Err(malformed(format!(
            "invalid hex digits '{}' at column {}",
            String::from_utf8_lossy(pair),
            pos + 1
        ))),
    }
}

fn hex_digit(c: u8) -> Option<u8> {
    (c as char).to_digit(16).map(|d| d as u8)
}

/// Iterator over `(address, bytes)` blocks, never crossing segment
/// boundaries.
#[derive(Debug)]
pub struct Blocks<'a> {
    segments: &'a [Segment],
    max_len: usize,
    segment: usize,
    offset: usize,
}

impl<'a> Blocks<'a> {
    fn new(segments: &'a [Segment], max_len: usize) -> Self {
        Self {
            segments,
            max_len: max_len.max(1),
            segment: 0,
            offset: 0,
        }
    }

    /// Number of blocks the iterator yields in total.
    pub fn total(&self) -> usize {
        self.segments
            .iter()
            .map(|s| s.data.len().div_ceil(self.max_len))
            .sum()
    }
}

impl<'a> Iterator for Blocks<'a> {
    type Item = (u32, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let segment = self.segments.get(self.segment)?;
            if self.offset >= segment.data.len() {
                self.segment += 1;
                self.offset = 0;
                continue;
            }

            let len = (segment.data.len() - self.offset).min(self.max_len);
            let block = &segment.data[self.offset..self.offset + len];
            let address = segment.address + self.offset as u32;
            self.offset += len;
            return Some((address, block));
        }
    }
}
