//! Scatter/gather over ordered buffer sequences.
//!
//! A transfer across `[b0, b1, ...]` fills (or drains) `b0` up to its limit
//! before touching `b1`. A short transfer therefore leaves later buffers
//! untouched beyond what was moved.

use std::io::{self, IoSlice, IoSliceMut};

use crate::buffer::Buffer;
use crate::error::ChannelError;

/// Total bytes remaining across a buffer sequence.
pub fn remaining_total(bufs: &[&mut Buffer]) -> usize {
    bufs.iter().map(|buf| buf.remaining()).sum()
}

/// Distributes `count` transferred bytes across the sequence in order.
pub(crate) fn advance_all(bufs: &mut [&mut Buffer], mut count: usize) {
    for buf in bufs.iter_mut() {
        if count == 0 {
            break;
        }
        let step = count.min(buf.remaining());
        buf.advance(step);
        count -= step;
    }
}

/// Runs one logical read across the sequence.
///
/// Owned buffers are handed to `op` together as one vectored call. When a
/// view is present the buffers are filled one after another, stopping at
/// the first short transfer.
pub(crate) fn scatter_with<F>(bufs: &mut [&mut Buffer], mut op: F) -> Result<usize, ChannelError>
where
    F: FnMut(&mut [IoSliceMut<'_>]) -> io::Result<usize>,
{
    if bufs.iter().all(|buf| !buf.is_view()) {
        let mut slices: Vec<IoSliceMut<'_>> = bufs
            .iter_mut()
            .filter_map(|buf| buf.heap_window_mut())
            .map(IoSliceMut::new)
            .collect();
        let count = op(&mut slices)?;
        drop(slices);
        advance_all(bufs, count);
        return Ok(count);
    }

    let mut total = 0;
    for buf in bufs.iter_mut() {
        let wanted = buf.remaining();
        if wanted == 0 {
            continue;
        }
        match buf.fill_with(|window| op(&mut [IoSliceMut::new(window)])) {
            Ok(count) => {
                total += count;
                if count < wanted {
                    break;
                }
            }
            // Bytes already moved win over a later would-block
            Err(ChannelError::Io(err)) if err.kind() == io::ErrorKind::WouldBlock && total > 0 => {
                break
            }
            Err(err) => return Err(err),
        }
    }
    Ok(total)
}

/// Runs one logical write across the sequence. Mirrors [`scatter_with`].
pub(crate) fn gather_with<F>(bufs: &mut [&mut Buffer], mut op: F) -> Result<usize, ChannelError>
where
    F: FnMut(&[IoSlice<'_>]) -> io::Result<usize>,
{
    if bufs.iter().all(|buf| !buf.is_view()) {
        let slices: Vec<IoSlice<'_>> = bufs
            .iter()
            .filter_map(|buf| buf.heap_window())
            .map(IoSlice::new)
            .collect();
        let count = op(&slices)?;
        drop(slices);
        advance_all(bufs, count);
        return Ok(count);
    }

    let mut total = 0;
    for buf in bufs.iter_mut() {
        let wanted = buf.remaining();
        if wanted == 0 {
            continue;
        }
        match buf.drain_with(|window| op(&[IoSlice::new(window)])) {
            Ok(count) => {
                total += count;
                if count < wanted {
                    break;
                }
            }
            Err(ChannelError::Io(err)) if err.kind() == io::ErrorKind::WouldBlock && total > 0 => {
                break
            }
            Err(err) => return Err(err),
        }
    }
    Ok(total)
}
