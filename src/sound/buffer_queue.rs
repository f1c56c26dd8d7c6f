//! hands captured audio from the real time thread to the network thread
//!
//! Two bounded channels: filled blocks go one way, emptied buffers come back
//! the other way to be reused, so the audio callback does not allocate once
//! the pool is warm.  Neither side ever blocks.
//!
//! Audio may be dropped when the reader falls behind, interval markers may
//! not.  A marker that finds the FIFO full waits on the writer side and goes
//! out ahead of anything pushed later.
use std::collections::VecDeque;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TryRecvError, TrySendError};

/// blocks the FIFO can hold before the writer starts dropping
pub const FIFO_BLOCKS: usize = 1024;
/// room for markers waiting on a full FIFO before the queue has to grow
const HELD_MARKERS: usize = 8;

#[derive(Debug, PartialEq)]
pub enum Block {
    Audio(Vec<f32>),
    /// the interval that was broadcasting has ended
    EndOfInterval,
    /// not broadcasting for the interval that just started
    Silence,
}

pub fn block_fifo() -> (BlockWriter, BlockReader) {
    let (filled_tx, filled_rx) = sync_channel(FIFO_BLOCKS);
    let (free_tx, free_rx) = sync_channel(FIFO_BLOCKS);
    (
        BlockWriter {
            filled: filled_tx,
            free: free_rx,
            held: VecDeque::with_capacity(HELD_MARKERS),
            dropped: 0,
        },
        BlockReader {
            filled: filled_rx,
            free: free_tx,
        },
    )
}

/// the real time end
pub struct BlockWriter {
    filled: SyncSender<Block>,
    free: Receiver<Vec<f32>>,
    /// markers that found the FIFO full, oldest first
    held: VecDeque<Block>,
    dropped: usize,
}

impl BlockWriter {
    /// Copy a block of samples in.  Returns false when the block was dropped,
    /// either because the FIFO was full or because held markers still wait.
    pub fn push(&mut self, samples: &[f32]) -> bool {
        if !self.flush_held() {
            self.dropped += 1;
            return false;
        }
        let mut buf = match self.free.try_recv() {
            Ok(b) => b,
            Err(_) => Vec::with_capacity(samples.len()),
        };
        buf.clear();
        buf.extend_from_slice(samples);
        match self.filled.try_send(Block::Audio(buf)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped += 1;
                false
            }
        }
    }

    /// Queue a marker.  It is never dropped: when the FIFO is full it is held
    /// and resent ahead of later blocks.  Returns true if it went straight in.
    pub fn push_marker(&mut self, marker: Block) -> bool {
        self.held.push_back(marker);
        self.flush_held()
    }

    /// Retry held markers in order.  Returns true once none are left.
    pub fn flush_held(&mut self) -> bool {
        while let Some(marker) = self.held.pop_front() {
            match self.filled.try_send(marker) {
                Ok(()) => {}
                Err(TrySendError::Full(marker)) => {
                    self.held.push_front(marker);
                    return false;
                }
                // nobody left to read them
                Err(TrySendError::Disconnected(_)) => {
                    self.held.clear();
                    return false;
                }
            }
        }
        true
    }

    /// markers still waiting for room in the FIFO
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// blocks lost because the reader fell behind
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

/// the network thread end
pub struct BlockReader {
    filled: Receiver<Block>,
    free: SyncSender<Vec<f32>>,
}

impl BlockReader {
    pub fn pop(&self) -> Option<Block> {
        match self.filled.try_recv() {
            Ok(b) => Some(b),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// hand a buffer back for the writer to reuse
    pub fn recycle(&self, buf: Vec<f32>) {
        // a full pool just lets the buffer drop
        let _ = self.free.try_send(buf);
    }
}

#[cfg(test)]
mod test_buffer_queue {
    use super::*;

    #[test]
    fn fifo_order_with_markers() {
        let (mut w, r) = block_fifo();
        assert!(w.push(&[1.0, 2.0]));
        assert!(w.push_marker(Block::EndOfInterval));
        assert!(w.push_marker(Block::Silence));
        assert_eq!(r.pop(), Some(Block::Audio(vec![1.0, 2.0])));
        assert_eq!(r.pop(), Some(Block::EndOfInterval));
        assert_eq!(r.pop(), Some(Block::Silence));
        assert_eq!(r.pop(), None);
    }

    #[test]
    fn recycled_buffers_are_reused() {
        let (mut w, r) = block_fifo();
        w.push(&[0.0; 256]);
        if let Some(Block::Audio(buf)) = r.pop() {
            let ptr = buf.as_ptr();
            r.recycle(buf);
            w.push(&[1.0; 128]);
            match r.pop() {
                Some(Block::Audio(b)) => {
                    assert_eq!(b.as_ptr(), ptr);
                    assert_eq!(b.len(), 128);
                }
                other => panic!("unexpected {:?}", other),
            }
        } else {
            panic!("no block");
        }
    }

    #[test]
    fn full_fifo_drops() {
        let (mut w, _r) = block_fifo();
        for _ in 0..FIFO_BLOCKS {
            assert!(w.push(&[0.0]));
        }
        assert!(!w.push(&[0.0]));
        assert_eq!(w.dropped(), 1);
    }

    #[test]
    fn markers_survive_full_fifo() {
        let (mut w, r) = block_fifo();
        for _ in 0..FIFO_BLOCKS {
            assert!(w.push(&[0.0]));
        }
        assert!(!w.push_marker(Block::EndOfInterval));
        assert!(!w.push_marker(Block::Silence));
        assert_eq!(w.held(), 2);
        assert_eq!(w.dropped(), 0);

        // one slot frees up, audio still may not jump the markers
        assert_eq!(r.pop(), Some(Block::Audio(vec![0.0])));
        assert!(!w.push(&[1.0]));
        assert_eq!(w.held(), 1);
        assert_eq!(w.dropped(), 1);

        while r.pop().is_some() {}
        assert!(w.push(&[2.0]));
        assert_eq!(w.held(), 0);

        // drain again and check the order that came out
        let (mut w, r) = block_fifo();
        for _ in 0..FIFO_BLOCKS {
            w.push(&[0.0]);
        }
        w.push_marker(Block::EndOfInterval);
        w.push_marker(Block::Silence);
        let mut tail = vec![];
        for _ in 0..2 {
            while let Some(b) = r.pop() {
                tail.push(b);
            }
            assert!(w.push(&[3.0]));
        }
        while let Some(b) = r.pop() {
            tail.push(b);
        }
        assert_eq!(tail.len(), FIFO_BLOCKS + 4);
        let n = tail.len();
        assert_eq!(tail[n - 4], Block::EndOfInterval);
        assert_eq!(tail[n - 3], Block::Silence);
        assert_eq!(tail[n - 2], Block::Audio(vec![3.0]));
        assert_eq!(tail[n - 1], Block::Audio(vec![3.0]));
    }
}
