//! TI-TXT output, used for memory dumps.

use std::io::{self, Write};
use std::path::Path;

use super::ImageError;

const BYTES_PER_LINE: usize = 16;

/// Streaming TI-TXT writer.
///
/// Consecutive calls at contiguous addresses continue the current section;
/// any gap starts a new `@ADDR` line.
pub struct TiTxtWriter<W: Write> {
    out: W,
    next_address: Option<u32>,
    column: usize,
}

impl<W: Write> TiTxtWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            next_address: None,
            column: 0,
        }
    }

    pub fn write_bytes(&mut self, address: u32, data: &[u8]) -> io::Result<()> {
        if self.next_address != Some(address) {
            if self.column > 0 {
                writeln!(self.out)?;
            }
            writeln!(self.out, "@{:04X}", address)?;
            self.column = 0;
        }

        for byte in data {
            if self.column > 0 {
                write!(self.out, " ")?;
            }
            write!(self.out, "{:02X}", byte)?;
            self.column += 1;
            if self.column == BYTES_PER_LINE {
                writeln!(self.out)?;
                self.column = 0;
            }
        }

        self.next_address = Some(address + data.len() as u32);
        Ok(())
    }

    /// Terminate the file and hand back the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        if self.column > 0 {
            writeln!(self.out)?;
        }
        writeln!(self.out, "q")?;
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Write one contiguous block as a complete TI-TXT document.
pub fn write<W: Write>(out: W, start: u32, data: &[u8]) -> io::Result<W> {
    let mut writer = TiTxtWriter::new(out);
    writer.write_bytes(start, data)?;
    writer.finish()
}

pub fn to_string(start: u32, data: &[u8]) -> String {
    // Writing into a Vec cannot fail.
    let bytes = write(Vec::new(), start, data).unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Create `path` and write one block to it.
pub fn write_file(path: impl AsRef<Path>, start: u32, data: &[u8]) -> Result<(), ImageError> {
    let file = std::fs::File::create(path)?;
    write(io::BufWriter::new(file), start, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::parse_str;

    #[test]
    fn test_format() {
        let data: Vec<u8> = (0..18).collect();
        let text = to_string(0x10C0, &data);
        assert_eq!(
            text,
            "@10C0\n00 01 02 03 04 05 06 07 08 09 0A 0B 0C 0D 0E 0F\n10 11\nq\n"
        );
    }

    #[test]
    fn test_sections_and_gaps() {
        let mut w = TiTxtWriter::new(Vec::new());
        w.write_bytes(0x1000, &[1, 2]).unwrap();
        w.write_bytes(0x1002, &[3]).unwrap();
        w.write_bytes(0x2000, &[4]).unwrap();
        let out = String::from_utf8(w.finish().unwrap()).unwrap();
        assert_eq!(out, "@1000\n01 02 03\n@2000\n04\nq\n");
    }

    #[test]
    fn test_dump_reads_back() {
        let data: Vec<u8> = (0..100u8).map(|b| b.wrapping_mul(7)).collect();
        let file = parse_str(&to_string(0x1100, &data)).unwrap();
        assert_eq!(file.segments().len(), 1);
        assert_eq!(file.segments()[0].address, 0x1100);
        assert_eq!(file.segments()[0].data, data);
    }
}
