/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/

/// Reads a little endian u32 at `$offset`, or `None` if it does not fit.
#[macro_export]
macro_rules! le_u32 {
    ($data:expr, $offset:expr) => {{
        let off: usize = $offset;
        if off.checked_add(4).is_some_and(|end| end <= $data.len()) {
            Some(u32::from_le_bytes([
                $data[off],
                $data[off + 1],
                $data[off + 2],
                $data[off + 3],
            ]))
        } else {
            None
        }
    }};
}

/// Reads a little endian u16 at `$offset`, or `None` if it does not fit.
#[macro_export]
macro_rules! le_u16 {
    ($data:expr, $offset:expr) => {{
        let off: usize = $offset;
        if off.checked_add(2).is_some_and(|end| end <= $data.len()) {
            Some(u16::from_le_bytes([$data[off], $data[off + 1]]))
        } else {
            None
        }
    }};
}
