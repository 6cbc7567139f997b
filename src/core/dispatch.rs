//! Read/write dispatch
//!
//! Splits a byte-range request into per-nugget segments, samples the swap
//! command channel once per request, lets the swap engine migrate each nugget
//! before it is touched, and then moves plaintext in and out of flakes.
//!
//! Every nugget's metadata, keycount and journal changes are committed before
//! the next nugget in the same request is processed.

use crate::device::Device;
use crate::error::{Result, SwitchCryptError};
use crate::swap::{Access, Migration};
use std::ops::Range;

/// Part of a request that falls inside one nugget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub nugget: u64,
    /// Offset inside the nugget
    pub offset: u64,
    /// Matching bytes of the caller's buffer
    pub buf_range: Range<usize>,
}

/// Split `[offset, offset + len)` on nugget boundaries
pub fn segments(offset: u64, len: usize, nugget_size: u64) -> Vec<Segment> {
    let mut out = Vec::new();
    if nugget_size == 0 {
        return out;
    }

    let mut done = 0usize;
    while done < len {
        let position = offset + done as u64;
        let nugget = position / nugget_size;
        let intra = position % nugget_size;
        let take = ((nugget_size - intra) as usize).min(len - done);

        out.push(Segment {
            nugget,
            offset: intra,
            buf_range: done..done + take,
        });
        done += take;
    }
    out
}

/// Flakes of a nugget covered by `[offset, offset + len)`, with the
/// overlapping range inside each flake
fn flake_spans(offset: u64, len: usize, flake_size: u64) -> impl Iterator<Item = (u32, Range<usize>)> {
    let end = offset + len as u64;
    let first = offset / flake_size;
    let last = if len == 0 { first } else { (end - 1) / flake_size + 1 };

    (first..last).map(move |flake| {
        let flake_start = flake * flake_size;
        let from = offset.max(flake_start) - flake_start;
        let to = end.min(flake_start + flake_size) - flake_start;
        (flake as u32, from as usize..to as usize)
    })
}

fn check_request(device: &Device, offset: u64, len: usize) -> Result<()> {
    let size = device.size();
    match offset.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(SwitchCryptError::OutOfBounds {
            offset,
            len: len as u64,
            size,
        }),
    }
}

/// Serve a read of `buf.len()` bytes at `offset`
pub fn dispatch_read(device: &mut Device, buf: &mut [u8], offset: u64) -> Result<()> {
    check_request(device, offset, buf.len())?;
    device.consume_pending_swap();

    let num_nuggets = device.num_nuggets();
    for segment in segments(offset, buf.len(), device.nugget_size()) {
        let out = &mut buf[segment.buf_range.clone()];

        if device.is_mirrored() {
            let source = device.engine().mirror_read_source(segment.nugget, num_nuggets);
            read_from_nugget(device, source, segment.offset, out)?;
            continue;
        }

        let migration = device.engine().decide(
            device.nugget_cipher(segment.nugget)?,
            device.is_pristine(segment.nugget),
        );
        device.migrate(segment.nugget, migration)?;
        walk_forward(device, segment.nugget, migration, Access::Read)?;

        read_from_nugget(device, segment.nugget, segment.offset, out)?;
    }

    Ok(())
}

/// Serve a write of `buf` at `offset`
pub fn dispatch_write(device: &mut Device, buf: &[u8], offset: u64) -> Result<()> {
    check_request(device, offset, buf.len())?;
    device.consume_pending_swap();

    let half = device.num_nuggets() / 2;
    for segment in segments(offset, buf.len(), device.nugget_size()) {
        let data = &buf[segment.buf_range.clone()];

        if device.is_mirrored() {
            write_into_nugget(device, segment.nugget, segment.offset, data)?;
            write_into_nugget(device, segment.nugget + half, segment.offset, data)?;
            continue;
        }

        let current = device.nugget_cipher(segment.nugget)?;
        let migration = device
            .engine()
            .decide(current, device.is_pristine(segment.nugget));

        match migration {
            Migration::Rekey => {
                let target = device.engine().active_cipher();
                device.rekey(segment.nugget, target, Some((segment.offset, data)))?;
            }
            _ => {
                device.migrate(segment.nugget, migration)?;
                write_into_nugget(device, segment.nugget, segment.offset, data)?;
            }
        }
        walk_forward(device, segment.nugget, migration, Access::Write)?;
    }

    Ok(())
}

/// Migrate the nuggets after one whose own migration was `migration`
fn walk_forward(device: &mut Device, nugget: u64, migration: Migration, access: Access) -> Result<()> {
    let window = device
        .engine()
        .forward_window(nugget, device.num_nuggets(), migration);
    for ahead in window {
        let ahead_migration = device.engine().decide_ahead(
            device.nugget_cipher(ahead)?,
            device.is_pristine(ahead),
            access,
        );
        device.migrate(ahead, ahead_migration)?;
    }
    Ok(())
}

fn read_from_nugget(device: &mut Device, nugget: u64, offset: u64, out: &mut [u8]) -> Result<()> {
    let flake_size = device.flake_size();
    let mut flake_buf = vec![0u8; flake_size as usize];
    let mut filled = 0usize;

    for (flake, span) in flake_spans(offset, out.len(), flake_size) {
        device.read_flake(nugget, flake, &mut flake_buf)?;
        let n = span.len();
        out[filled..filled + n].copy_from_slice(&flake_buf[span]);
        filled += n;
    }
    Ok(())
}

/// Write into a nugget that already uses the right cipher
///
/// Flakes not yet written under the current generation are merged into
/// zeros and encrypted directly. Touching a flake that already holds current
/// ciphertext would reuse its keystream, so the whole nugget is rekeyed
/// under its present cipher instead.
fn write_into_nugget(device: &mut Device, nugget: u64, offset: u64, data: &[u8]) -> Result<()> {
    let flake_size = device.flake_size();
    let spans: Vec<(u32, Range<usize>)> = flake_spans(offset, data.len(), flake_size).collect();

    let overwrites = device
        .journal(nugget)
        .map(|entry| spans.iter().any(|(flake, _)| entry.bitmask.is_set(*flake as usize)))
        .unwrap_or(false);
    if overwrites {
        let current = device.nugget_cipher(nugget)?;
        return device.rekey(nugget, current, Some((offset, data)));
    }

    let mut consumed = 0usize;
    for (flake, span) in spans {
        let mut plain = vec![0u8; flake_size as usize];
        let n = span.len();
        plain[span].copy_from_slice(&data[consumed..consumed + n]);
        device.write_flake(nugget, flake, &plain)?;
        consumed += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_split_on_nugget_edges() {
        let segs = segments(8, 40, 16);
        assert_eq!(
            segs,
            vec![
                Segment { nugget: 0, offset: 8, buf_range: 0..8 },
                Segment { nugget: 1, offset: 0, buf_range: 8..24 },
                Segment { nugget: 2, offset: 0, buf_range: 24..40 },
            ]
        );
    }

    #[test]
    fn test_segments_inside_one_nugget() {
        assert_eq!(
            segments(36, 4, 16),
            vec![Segment { nugget: 2, offset: 4, buf_range: 0..4 }]
        );
        assert!(segments(10, 0, 16).is_empty());
    }

    #[test]
    fn test_flake_spans() {
        let spans: Vec<_> = flake_spans(3, 10, 4).collect();
        assert_eq!(spans, vec![(0, 3..4), (1, 0..4), (2, 0..4), (3, 0..1)]);

        let spans: Vec<_> = flake_spans(4, 4, 4).collect();
        assert_eq!(spans, vec![(1, 0..4)]);

        assert_eq!(flake_spans(4, 0, 4).count(), 0);
    }
}
