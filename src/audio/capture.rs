//! Audio capture and the capture loop
//!
//! A [`CaptureClient`] delivers interleaved f32 batches in the endpoint's
//! mix format. The cpal implementation runs the device stream on a
//! dedicated thread that owns it and queues each callback's samples into a
//! lock-free ring buffer; the pipeline thread polls that buffer.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::{create_shared_buffer, AudioFrame, SharedRingBuffer};
use crate::audio::device::{AudioDevice, DataFlow};
use crate::audio::format::StreamFormat;
use crate::constants::{CAPTURE_RING_CAPACITY, POLL_INTERVAL};
use crate::error::{AudioError, Result};
use crate::sink::Sink;

/// Source of captured batches
pub trait CaptureClient {
    /// Format of every batch, fixed for the client's lifetime
    fn format(&self) -> StreamFormat;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Next batch, `None` if nothing is ready yet
    fn next_batch(&mut self) -> Result<Option<AudioFrame>>;
}

/// cpal-backed capture. Render devices are captured in loopback.
pub struct CpalCapture {
    device_id: String,
    device: cpal::Device,
    format: StreamFormat,
    config: StreamConfig,
    running: Arc<AtomicBool>,
    buffer: SharedRingBuffer,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<AudioError>>,
    sequence: Arc<AtomicU32>,
}

impl CpalCapture {
    /// Negotiate the device's mix format, which must be 32-bit float.
    pub fn new(device: AudioDevice) -> Result<Self> {
        let supported = device.default_config()?;
        if supported.sample_format() != cpal::SampleFormat::F32 {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} delivers {:?} samples",
                device.id, supported.sample_format()
            ))
            .into());
        }

        let format = device.mix_format()?;
        let config = supported.config();

        if device.flow == DataFlow::Render {
            tracing::debug!("Capturing {} in loopback", device.id);
        }

        Ok(Self {
            device_id: device.id.clone(),
            device: device.into_inner(),
            format,
            config,
            running: Arc::new(AtomicBool::new(false)),
            buffer: create_shared_buffer(CAPTURE_RING_CAPACITY),
            thread_handle: None,
            error_rx: None,
            sequence: Arc::new(AtomicU32::new(0)),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Callbacks dropped because the pipeline fell behind
    pub fn overflow_count(&self) -> usize {
        self.buffer.overflow_count()
    }

    fn check_errors(&self) -> Result<()> {
        match self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok()) {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

impl CaptureClient for CpalCapture {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = self.device.clone();
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<std::result::Result<(), AudioError>>(1);
        self.error_rx = Some(error_rx);
        self.buffer.clear();
        self.sequence.store(0, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let running_for_loop = self.running.clone();
        let buffer = self.buffer.clone();
        let sequence = self.sequence.clone();
        let config = self.config.clone();
        let channels = self.config.channels;

        let handle = thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                let stream = device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        let seq = sequence.fetch_add(1, Ordering::Relaxed);
                        let _ = buffer.push(AudioFrame::new(data.to_vec(), channels, seq));
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                // Stream is dropped here, stopping capture
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);

        match ready_rx.recv() {
            Ok(Ok(())) => {
                tracing::debug!("Capture started on {}", self.device_id);
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                Err(AudioError::StreamError("capture thread exited".into()).into())
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::debug!("Capture stopped on {}", self.device_id);
        }
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<AudioFrame>> {
        self.check_errors()?;
        Ok(self.buffer.pop())
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Drives a sink chain from a capture client.
pub struct CaptureSource {
    client: Box<dyn CaptureClient>,
}

impl CaptureSource {
    pub fn new(client: Box<dyn CaptureClient>) -> Self {
        Self { client }
    }

    pub fn format(&self) -> StreamFormat {
        self.client.format()
    }

    /// Pump batches into `sink` while it is open and playing, until at least
    /// `stop_after_frames` frames have been delivered.
    ///
    /// The sink is flushed once at the end if any batch reported a side
    /// effect. On error the client is stopped before the error propagates.
    pub fn run(&mut self, sink: &mut dyn Sink, stop_after_frames: u64) -> Result<()> {
        let format = self.client.format();
        if sink.format() != format {
            return Err(AudioError::IncompatibleSink {
                source_format: format.to_string(),
                sink_format: sink.format().to_string(),
            }
            .into());
        }

        self.client.start()?;
        match self.pump(sink, stop_after_frames) {
            Ok(()) => self.client.stop(),
            Err(e) => {
                let _ = self.client.stop();
                Err(e)
            }
        }
    }

    fn pump(&mut self, sink: &mut dyn Sink, mut remaining: u64) -> Result<()> {
        let mut shall_flush = false;

        while sink.is_open() && sink.is_playing() && remaining > 0 {
            let Some(batch) = self.client.next_batch()? else {
                thread::sleep(POLL_INTERVAL);
                continue;
            };

            if batch.channels as usize != sink.channels() {
                return Err(AudioError::IncompatibleSink {
                    source_format: format!("{}-channel batch", batch.channels),
                    sink_format: sink.format().to_string(),
                }
                .into());
            }

            let frames = batch.frames();
            if sink.process(&batch.samples, frames)? {
                shall_flush = true;
            }
            remaining = remaining.saturating_sub(frames as u64);
        }

        if shall_flush {
            sink.flush()?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockCapture;
    use super::*;
    use crate::audio::format::ChannelMask;
    use crate::sink::testing::RecordingSink;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Forwards to a mock while letting the test inspect it afterwards
    struct Shared(Rc<RefCell<MockCapture>>);

    impl CaptureClient for Shared {
        fn format(&self) -> StreamFormat {
            self.0.borrow().format()
        }
        fn start(&mut self) -> Result<()> {
            self.0.borrow_mut().start()
        }
        fn stop(&mut self) -> Result<()> {
            self.0.borrow_mut().stop()
        }
        fn next_batch(&mut self) -> Result<Option<AudioFrame>> {
            self.0.borrow_mut().next_batch()
        }
    }

    fn stereo() -> StreamFormat {
        StreamFormat::new(48000, ChannelMask::STEREO)
    }

    #[test]
    fn test_rejects_incompatible_sink() {
        let mock = MockCapture::new(stereo(), vec![]);
        let mut source = CaptureSource::new(Box::new(mock));
        let (mut sink, _log) = RecordingSink::new(StreamFormat::new(44100, ChannelMask::STEREO));

        let result = source.run(&mut sink, 100);
        assert!(matches!(
            result,
            Err(crate::Error::Audio(AudioError::IncompatibleSink { .. }))
        ));
    }

    #[test]
    fn test_runs_until_budget_and_flushes_once() {
        let mock = Rc::new(RefCell::new(MockCapture::new(
            stereo(),
            vec![Some(vec![0.1; 8]), None, Some(vec![0.2; 8]), Some(vec![0.3; 8])],
        )));
        let mut source = CaptureSource::new(Box::new(Shared(mock.clone())));
        let (mut sink, log) = RecordingSink::new(stereo());

        source.run(&mut sink, 6).unwrap();

        let log = log.borrow();
        assert_eq!(log.frames, 8);
        assert_eq!(log.calls, 2);
        assert_eq!(log.flushes, 1);
        assert_eq!(mock.borrow().started, 1);
        assert_eq!(mock.borrow().stopped, 1);
    }

    #[test]
    fn test_stops_client_on_error() {
        let mut mock = MockCapture::new(stereo(), vec![Some(vec![0.1; 8])]);
        mock.fail_after = Some(1);
        let mock = Rc::new(RefCell::new(mock));
        let mut source = CaptureSource::new(Box::new(Shared(mock.clone())));
        let (mut sink, log) = RecordingSink::new(stereo());

        assert!(source.run(&mut sink, 1000).is_err());
        assert_eq!(mock.borrow().stopped, 1);
        assert_eq!(log.borrow().flushes, 0);
    }

    #[test]
    fn test_skips_when_not_playing() {
        let mock = MockCapture::new(stereo(), vec![Some(vec![0.1; 8])]);
        let mut source = CaptureSource::new(Box::new(mock));
        let (mut sink, log) = RecordingSink::new(stereo());
        sink.playing = false;

        source.run(&mut sink, 1000).unwrap();
        assert_eq!(log.borrow().calls, 0);
        assert_eq!(log.borrow().flushes, 0);
    }

    #[test]
    fn test_rejects_batch_with_wrong_channel_count() {
        let mut mock = MockCapture::new(stereo(), vec![Some(vec![0.1; 8])]);
        mock.batch_channels = Some(1);
        let mock = Rc::new(RefCell::new(mock));
        let mut source = CaptureSource::new(Box::new(Shared(mock.clone())));
        let (mut sink, log) = RecordingSink::new(stereo());

        let result = source.run(&mut sink, 1000);
        assert!(matches!(
            result,
            Err(crate::Error::Audio(AudioError::IncompatibleSink { .. }))
        ));
        assert_eq!(log.borrow().calls, 0);
        assert_eq!(mock.borrow().stopped, 1);
    }
}
