//! Classic hex dump: offset column, dword-grouped hex bytes, ASCII gutter.

use std::io::{self, Write};

pub fn hex_dump<W: Write>(out: &mut W, bytes: &[u8], line_length: usize) -> io::Result<()> {
    let mut offset = 0usize;
    for line in bytes.chunks(line_length) {
        write!(out, "{offset:6X} |")?;
        for (i, b) in line.iter().enumerate() {
            if i > 0 && i % 4 == 0 {
                write!(out, " ")?;
            }
            write!(out, " {b:02X}")?;
        }
        for i in line.len()..line_length {
            if i > 0 && i % 4 == 0 {
                write!(out, " ")?;
            }
            write!(out, "   ")?;
        }
        write!(out, " | ")?;
        for &b in line {
            if b.is_ascii_alphanumeric() {
                write!(out, "{}", b as char)?;
            } else {
                write!(out, ".")?;
            }
        }
        writeln!(out)?;
        offset += line.len();
    }
    Ok(())
}
