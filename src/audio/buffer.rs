//! Lock-free queues between device callbacks and the pipeline thread
//!
//! Both are single-producer single-consumer in practice: the capture
//! callback pushes batches the pipeline pops, and the pipeline pushes
//! samples the render callback pops.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One capture callback worth of interleaved samples
#[derive(Clone, Debug, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub channels: u16,
    /// Callback sequence number
    pub sequence: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, channels: u16, sequence: u32) -> Self {
        Self {
            samples,
            channels,
            sequence,
        }
    }

    /// Whole frames in this batch
    pub fn frames(&self) -> usize {
        match self.channels {
            0 => 0,
            channels => self.samples.len() / channels as usize,
        }
    }
}

/// Bounded queue of capture batches
pub struct RingBuffer {
    queue: ArrayQueue<AudioFrame>,
    overflow_count: AtomicUsize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            overflow_count: AtomicUsize::new(0),
        }
    }

    /// Push a batch. Returns false and counts an overflow if the queue is
    /// full; the batch is lost.
    pub fn push(&self, frame: AudioFrame) -> bool {
        match self.queue.push(frame) {
            Ok(()) => true,
            Err(_) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn pop(&self) -> Option<AudioFrame> {
        self.queue.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Drop everything queued
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }
}

/// Thread-safe handle to a ring buffer
pub type SharedRingBuffer = Arc<RingBuffer>;

pub fn create_shared_buffer(capacity: usize) -> SharedRingBuffer {
    Arc::new(RingBuffer::new(capacity))
}

/// Sample FIFO feeding a render callback.
///
/// The callback takes whole frames only, so a frame that is still being
/// pushed stays queued and channel slots never shift.
pub struct SampleFifo {
    queue: ArrayQueue<f32>,
    channels: usize,
    underrun_count: AtomicUsize,
}

impl SampleFifo {
    /// FIFO of `capacity` samples holding interleaved `channels`-sample frames
    pub fn new(capacity: usize, channels: usize) -> Self {
        let channels = channels.max(1);
        Self {
            queue: ArrayQueue::new(capacity.max(channels)),
            channels,
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Free space in samples
    pub fn space(&self) -> usize {
        self.queue.capacity() - self.queue.len()
    }

    /// Push as many whole frames as fit, returning how many samples were
    /// taken
    pub fn push_slice(&self, samples: &[f32]) -> usize {
        let fit = samples.len().min(self.space());
        let whole = fit - fit % self.channels;
        samples[..whole]
            .iter()
            .take_while(|&&s| self.queue.push(s).is_ok())
            .count()
    }

    /// Fill `out` with whole frames from the FIFO, padding with silence on
    /// underrun
    pub fn pop_into(&self, out: &mut [f32]) {
        let mut starved = false;
        for frame in out.chunks_mut(self.channels) {
            if frame.len() == self.channels && self.queue.len() >= self.channels {
                for slot in frame.iter_mut() {
                    *slot = self.queue.pop().unwrap_or_default();
                }
            } else {
                starved = true;
                frame.fill(0.0);
            }
        }
        if starved {
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }
}
