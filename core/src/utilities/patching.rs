/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::ops::Range;

use crate::error::{Error, Result};
use crate::{le_u16, le_u32};

/// Bytes written by a [`Directive`]. Each variant writes exactly its own width,
/// halfwords and words are stored little endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replacement<'a> {
    Bytes(&'a [u8]),
    Halfword(u16),
    Word(u32),
}

impl Replacement<'_> {
    pub fn len(&self) -> usize {
        match self {
            Replacement::Bytes(bytes) => bytes.len(),
            Replacement::Halfword(_) => 2,
            Replacement::Word(_) => 4,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write_to(&self, dst: &mut [u8]) {
        match self {
            Replacement::Bytes(bytes) => dst.copy_from_slice(bytes),
            Replacement::Halfword(value) => dst.copy_from_slice(&value.to_le_bytes()),
            Replacement::Word(value) => dst.copy_from_slice(&value.to_le_bytes()),
        }
    }
}

/// Locate-by-pattern plus a fixed write relative to each match.
#[derive(Debug, Clone, Copy)]
pub struct Directive<'a> {
    pub pattern: &'a [u8],
    /// Signed distance from the match start to the first written byte.
    pub offset: isize,
    pub replacement: Replacement<'a>,
    pub max_applications: u32,
}

impl<'a> Directive<'a> {
    pub const fn new(pattern: &'a [u8], offset: isize, replacement: Replacement<'a>) -> Self {
        Self { pattern, offset, replacement, max_applications: 1 }
    }

    pub const fn times(mut self, max_applications: u32) -> Self {
        self.max_applications = max_applications;
        self
    }
}

/// Bounds-checked view over a caller owned buffer with a forward scan cursor.
pub struct ByteScanner<'a> {
    data: &'a mut [u8],
    cursor: usize,
}

impl<'a> ByteScanner<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn data(&self) -> &[u8] {
        self.data
    }

    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(Error::out_of_bounds(pos as isize, 0, self.data.len()));
        }
        self.cursor = pos;
        Ok(())
    }

    /// Finds the next occurrence of `pattern` at or after the cursor and moves the
    /// cursor past it.
    pub fn next_match(&mut self, pattern: &[u8]) -> Option<usize> {
        let pos = find_pattern(self.data, pattern, self.cursor)?;
        self.cursor = pos + pattern.len();
        Some(pos)
    }

    /// Resolves `base + delta .. + len` to a range inside the buffer.
    pub fn range(&self, base: usize, delta: isize, len: usize) -> Result<Range<usize>> {
        checked_range(self.data.len(), base, delta, len)
    }

    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        le_u32!(self.data, offset)
    }

    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        le_u16!(self.data, offset)
    }

    pub fn write(&mut self, base: usize, delta: isize, replacement: &Replacement) -> Result<()> {
        let range = self.range(base, delta, replacement.len())?;
        replacement.write_to(&mut self.data[range]);
        Ok(())
    }

    pub fn write_u16(&mut self, offset: usize, value: u16) -> Result<()> {
        self.write(offset, 0, &Replacement::Halfword(value))
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.write(offset, 0, &Replacement::Word(value))
    }
}

fn checked_range(size: usize, base: usize, delta: isize, len: usize) -> Result<Range<usize>> {
    let start = base as isize + delta;
    let oob = || Error::out_of_bounds(start, len, size);

    let start = usize::try_from(start).map_err(|_| oob())?;
    let end = start.checked_add(len).ok_or_else(oob)?;
    if end > size {
        return Err(oob());
    }

    Ok(start..end)
}

/// Returns the offset of the first exact occurrence of `pattern` at or after `offset`.
pub fn find_pattern(data: &[u8], pattern: &[u8], offset: usize) -> Option<usize> {
    if pattern.is_empty()
        || pattern.len() > data.len()
        || offset > data.len() - pattern.len()
    {
        return None;
    }

    data[offset..].windows(pattern.len()).position(|window| window == pattern).map(|pos| pos + offset)
}

/// Same as [`find_pattern`] but only matches fully contained in `window`.
pub fn find_pattern_in(data: &[u8], pattern: &[u8], window: Range<usize>) -> Option<usize> {
    let end = window.end.min(data.len());
    if window.start >= end {
        return None;
    }
    find_pattern(&data[window.start..end], pattern, 0).map(|pos| pos + window.start)
}

/// Finds a run of `len` consecutive `filler` bytes starting at or after `from`.
pub fn find_filler(data: &[u8], from: usize, len: usize, filler: u8) -> Option<usize> {
    if len == 0 {
        return None;
    }

    let mut run = 0usize;
    for (i, &b) in data.iter().enumerate().skip(from) {
        if b == filler {
            run += 1;
            if run == len {
                return Some(i + 1 - len);
            }
        } else {
            run = 0;
        }
    }

    None
}

/// Writes `bytes` at `offset`, refusing anything that leaves the buffer.
pub fn patch(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<()> {
    let range = checked_range(data.len(), offset, 0, bytes.len())?;
    data[range].copy_from_slice(bytes);
    Ok(())
}

pub fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    le_u32!(data, offset)
}

pub fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    le_u16!(data, offset)
}

pub fn write_u32(data: &mut [u8], offset: usize, value: u32) -> Result<()> {
    patch(data, offset, &value.to_le_bytes())
}

pub fn write_u16(data: &mut [u8], offset: usize, value: u16) -> Result<()> {
    patch(data, offset, &value.to_le_bytes())
}

/// Applies `directive` to every match, front to back, up to its application limit.
/// Scanning resumes after the end of the previous match. Returns how many times the
/// replacement was written; zero means this variant does not carry the pattern.
///
/// Every write is bounds checked before the first one happens, so an error leaves
/// `data` untouched.
pub fn apply_directive(data: &mut [u8], directive: &Directive) -> Result<usize> {
    if directive.max_applications == 0 {
        return Err(Error::InvalidDirective("max_applications must be at least 1"));
    }
    if directive.pattern.is_empty() {
        return Err(Error::InvalidDirective("pattern is empty"));
    }

    let mut scanner = ByteScanner::new(data);
    let mut sites = Vec::new();

    while sites.len() < directive.max_applications as usize {
        let Some(pos) = scanner.next_match(directive.pattern) else {
            break;
        };
        scanner.range(pos, directive.offset, directive.replacement.len())?;
        sites.push(pos);
    }

    for &pos in &sites {
        scanner.write(pos, directive.offset, &directive.replacement)?;
    }

    Ok(sites.len())
}

/// Applies directives in order and returns the total number of writes. Later
/// directives see the writes of earlier ones; if any of them fails, `data` is
/// left as it was.
pub fn apply_all(data: &mut [u8], directives: &[Directive]) -> Result<usize> {
    let mut staged = data.to_vec();
    let total = directives.iter().try_fold(0, |total, d| Ok::<_, Error>(total + apply_directive(&mut staged, d)?))?;

    data.copy_from_slice(&staged);
    Ok(total)
}
