//! Playback to a render device
//!
//! The render stage writes into a [`RenderClient`], waiting for buffer space
//! with short sleeps, then forwards to its successor. The cpal client keeps
//! the output stream on a thread of its own, fed through a lock-free sample
//! FIFO that plays silence on underrun.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::SampleFifo;
use crate::audio::device::{AudioDevice, DataFlow};
use crate::audio::format::StreamFormat;
use crate::constants::{POLL_INTERVAL, RENDER_BUFFER_MS};
use crate::error::{AudioError, Result};
use crate::sink::{Chain, Sink};

/// Device-side buffer of a render endpoint
pub trait RenderClient {
    /// Frames that can be written without blocking
    fn available_frames(&self) -> Result<usize>;

    /// Write `frames` interleaved frames; never more than available
    fn write(&mut self, samples: &[f32], frames: usize) -> Result<()>;
}

/// Render endpoint that can be opened in a given format
pub trait RenderDevice {
    /// Native sample rate of the endpoint
    fn sample_rate(&self) -> Result<u32>;

    fn open(self: Box<Self>, format: StreamFormat) -> Result<Box<dyn RenderClient>>;
}

impl RenderDevice for AudioDevice {
    fn sample_rate(&self) -> Result<u32> {
        Ok(self.mix_format()?.sample_rate)
    }

    fn open(self: Box<Self>, format: StreamFormat) -> Result<Box<dyn RenderClient>> {
        Ok(Box::new(CpalRenderer::open(*self, format)?))
    }
}

/// cpal output stream fed from a sample FIFO
pub struct CpalRenderer {
    channels: usize,
    fifo: Arc<SampleFifo>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Receiver<AudioError>,
}

impl CpalRenderer {
    /// Open `device` for playback of `format` and start the stream
    pub fn open(device: AudioDevice, format: StreamFormat) -> Result<Self> {
        if device.flow != DataFlow::Render {
            return Err(AudioError::NotARenderDevice(format!("{} ({})", device.id, device.name)).into());
        }

        let channels = format.channels();
        let config = StreamConfig {
            channels: channels as u16,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let capacity = format.sample_rate as usize * channels * RENDER_BUFFER_MS as usize / 1000;
        let fifo = Arc::new(SampleFifo::new(capacity, channels));
        let running = Arc::new(AtomicBool::new(true));

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<std::result::Result<(), AudioError>>(1);

        let device_id = device.id.clone();
        let cpal_device = device.into_inner();
        let fifo_for_stream = fifo.clone();
        let running_for_loop = running.clone();

        let handle = thread::Builder::new()
            .name("render".into())
            .spawn(move || {
                let stream = cpal_device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        fifo_for_stream.pop_into(data);
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                let stream = match stream.map_err(|e| e.to_string()).and_then(|s| {
                    s.play().map_err(|e| e.to_string())?;
                    Ok(s)
                }) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e)));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                drop(stream);
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e.into());
            }
            Err(_) => {
                let _ = handle.join();
                return Err(AudioError::StreamError("render thread exited".into()).into());
            }
        }

        tracing::debug!("Rendering {} to {}", format, device_id);

        Ok(Self {
            channels,
            fifo,
            running,
            thread_handle: Some(handle),
            error_rx,
        })
    }

    /// Callbacks that ran out of samples
    pub fn underrun_count(&self) -> usize {
        self.fifo.underrun_count()
    }
}

impl RenderClient for CpalRenderer {
    fn available_frames(&self) -> Result<usize> {
        if let Ok(e) = self.error_rx.try_recv() {
            return Err(e.into());
        }
        Ok(self.fifo.space() / self.channels.max(1))
    }

    fn write(&mut self, samples: &[f32], frames: usize) -> Result<()> {
        self.fifo.push_slice(&samples[..frames * self.channels]);
        Ok(())
    }
}

impl Drop for CpalRenderer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Plays every batch on a render client, then forwards it.
pub struct RenderSink {
    chain: Chain,
    client: Box<dyn RenderClient>,
}

impl RenderSink {
    /// Render through `client`, which must accept the successor's format
    pub fn new(next: Box<dyn Sink>, client: Box<dyn RenderClient>) -> Self {
        Self {
            chain: Chain::new(next),
            client,
        }
    }

    /// Open `device` in the successor's format
    pub fn open(next: Box<dyn Sink>, device: Box<dyn RenderDevice>) -> Result<Self> {
        let client = device.open(next.format())?;
        Ok(Self::new(next, client))
    }

    fn wait_for_space(&self) -> Result<usize> {
        loop {
            let available = self.client.available_frames()?;
            if available > 0 {
                return Ok(available);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Sink for RenderSink {
    fn name(&self) -> &'static str {
        "render"
    }

    fn format(&self) -> StreamFormat {
        self.chain.format()
    }

    fn next(&self) -> Option<&dyn Sink> {
        Some(self.chain.next())
    }

    fn can_play(&self) -> bool {
        true
    }

    fn is_open(&self) -> bool {
        self.chain.is_open()
    }

    fn is_playing(&self) -> bool {
        true
    }

    fn process(&mut self, samples: &[f32], frames: usize) -> Result<bool> {
        let channels = self.chain.channels();
        let mut pending = &samples[..frames * channels];

        while !pending.is_empty() {
            let available = self.wait_for_space()?;
            let count = available.min(pending.len() / channels);
            let (now, later) = pending.split_at(count * channels);
            self.client.write(now, count)?;
            pending = later;
        }

        self.chain.process(samples, frames)
    }

    fn flush(&mut self) -> Result<()> {
        self.chain.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::ChannelMask;
    use crate::sink::{describe, NullSink};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Client with a fixed-size buffer drained by a few frames per poll
    struct SlowClient {
        capacity: usize,
        queued: RefCell<usize>,
        drain_per_poll: usize,
        written: Rc<RefCell<Vec<f32>>>,
        polls: RefCell<usize>,
    }

    impl RenderClient for SlowClient {
        fn available_frames(&self) -> Result<usize> {
            *self.polls.borrow_mut() += 1;
            let mut queued = self.queued.borrow_mut();
            *queued = queued.saturating_sub(self.drain_per_poll);
            Ok(self.capacity - *queued)
        }

        fn write(&mut self, samples: &[f32], frames: usize) -> Result<()> {
            assert!(frames <= self.capacity - *self.queued.borrow());
            *self.queued.borrow_mut() += frames;
            self.written.borrow_mut().extend_from_slice(samples);
            Ok(())
        }
    }

    #[test]
    fn test_writes_in_pieces() {
        let format = StreamFormat::new(48000, ChannelMask::STEREO);
        let written = Rc::new(RefCell::new(Vec::new()));
        let client = SlowClient {
            capacity: 4,
            queued: RefCell::new(0),
            drain_per_poll: 2,
            written: written.clone(),
            polls: RefCell::new(0),
        };
        let mut sink = RenderSink::new(Box::new(NullSink::new(format)), Box::new(client));

        assert!(sink.can_play());
        assert!(sink.is_playing());
        assert_eq!(describe(&sink), vec!["render", "null"]);

        let samples: Vec<f32> = (0..20).map(|i| i as f32).collect();
        assert!(sink.process(&samples, 10).unwrap());
        assert_eq!(*written.borrow(), samples);
    }

    #[test]
    #[ignore = "requires audio hardware"]
    fn test_default_device_playback() {
        use crate::audio::device::{default_device, Role};

        let device = default_device(DataFlow::Render, Role::Console).unwrap();
        let format = device.mix_format().unwrap();
        let mut sink =
            RenderSink::open(Box::new(NullSink::new(format)), Box::new(device)).unwrap();
        let silence = vec![0.0; format.channels() * 480];
        sink.process(&silence, 480).unwrap();
    }
}
