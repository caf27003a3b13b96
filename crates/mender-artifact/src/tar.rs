//! Minimal POSIX ustar header decoding.
//!
//! Deliberately hand-rolled rather than pulled from the `tar` crate: that
//! crate is built around a blocking `Read` over a complete archive, which
//! can't express "I was handed 900 bytes of a 512-byte header, return
//! need-more-input and keep what you have" — the contract the streaming
//! parser in `parser.rs` is built around.

pub const BLOCK_SIZE: usize = 512;

#[derive(Debug, Clone)]
pub struct TarHeader {
    pub name: String,
    pub size: u64,
    pub typeflag: u8,
}

/// A block of 512 zero bytes marks the end of a tar stream; two in a row
/// mark the true end of archive. We only care about individual entries, so
/// a single zero block is treated as "no more entries in this nesting
/// level" by the caller.
pub fn is_zero_block(block: &[u8; BLOCK_SIZE]) -> bool {
    block.iter().all(|&b| b == 0)
}

/// Parse one 512-byte ustar header block.
pub fn parse_header(block: &[u8; BLOCK_SIZE]) -> Result<TarHeader, String> {
    let name = read_cstr(&block[0..100]);
    let size_field = &block[124..136];
    let size = parse_octal(size_field)?;
    let typeflag = block[156];

    // ustar prefix field extends long names; concatenate when present.
    let prefix = read_cstr(&block[345..500]);
    let full_name = if prefix.is_empty() {
        name
    } else {
        format!("{}/{}", prefix, name)
    };

    Ok(TarHeader { name: full_name, size, typeflag })
}

fn read_cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

fn parse_octal(field: &[u8]) -> Result<u64, String> {
    let s = read_cstr(field);
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(trimmed, 8).map_err(|e| format!("bad octal size field {:?}: {}", trimmed, e))
}

/// Number of 512-byte blocks needed to hold `size` bytes, rounded up.
pub fn blocks_for(size: u64) -> u64 {
    (size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64
}
