//! Network stage: frames audio into datagrams
//!
//! Delivery is best-effort. A failed send is counted and logged, never
//! retried, and never stops the pipeline.

use bytes::{BufMut, BytesMut};
use socket2::{SockAddr, Socket};

use super::udp::{create_socket, NetworkTarget};
use crate::audio::format::StreamFormat;
use crate::constants::MAX_PAYLOAD_SAMPLES;
use crate::error::Result;
use crate::protocol::{PacketHeader, HEADER_LEN};
use crate::sink::{Chain, Sink};

/// Sender statistics
#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
}

/// Sends every batch to a UDP peer, then forwards it.
pub struct NetworkSink {
    chain: Chain,
    socket: Socket,
    peer: SockAddr,
    header: [u8; HEADER_LEN],
    packet: BytesMut,
    stats: NetworkStats,
}

impl NetworkSink {
    /// Fails if the successor's sample rate has no wire encoding, or if the
    /// peer cannot be resolved.
    pub fn new(next: Box<dyn Sink>, target: &NetworkTarget) -> Result<Self> {
        let chain = Chain::new(next);
        let header = PacketHeader::for_format(&chain.format())?.encode();
        let (socket, peer) = create_socket(target)?;

        tracing::info!(
            "Streaming {} to {}:{}",
            chain.format(),
            target.peer_address(),
            target.peer_service()
        );

        Ok(Self {
            chain,
            socket,
            peer,
            header,
            packet: BytesMut::with_capacity(HEADER_LEN + MAX_PAYLOAD_SAMPLES * 4),
            stats: NetworkStats::default(),
        })
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    /// Samples per datagram: whole frames only
    fn max_samples(&self) -> usize {
        MAX_PAYLOAD_SAMPLES - MAX_PAYLOAD_SAMPLES % self.chain.channels()
    }

    fn send_packet(&mut self, payload: &[f32]) {
        self.packet.clear();
        self.packet.put_slice(&self.header);
        for sample in payload {
            self.packet.put_f32_le(*sample);
        }

        match self.socket.send_to(&self.packet, &self.peer) {
            Ok(sent) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += sent as u64;
            }
            Err(e) => {
                self.stats.send_failures += 1;
                if self.stats.send_failures == 1 {
                    tracing::warn!("Failed to send packet: {}", e);
                } else {
                    tracing::debug!("Failed to send packet: {}", e);
                }
            }
        }
    }
}

impl Sink for NetworkSink {
    fn name(&self) -> &'static str {
        "network"
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
        let samples = &samples[..frames * self.chain.channels()];
        let max_samples = self.max_samples();
        for payload in samples.chunks(max_samples) {
            self.send_packet(payload);
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
    use crate::error::{ConfigError, Error};
    use crate::protocol::decode_samples;
    use crate::sink::NullSink;
    use std::net::UdpSocket;
    use std::time::Duration;

    fn loopback_target(receiver: &UdpSocket) -> NetworkTarget {
        NetworkTarget {
            bind_address: None,
            peer_address: Some("127.0.0.1".into()),
            peer_service: Some(receiver.local_addr().unwrap().port().to_string()),
        }
    }

    #[test]
    fn test_rejects_unrepresentable_rate() {
        let next = Box::new(NullSink::new(StreamFormat::new(22050, ChannelMask::STEREO)));
        let result = NetworkSink::new(next, &NetworkTarget::default());
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::UnsupportedSampleRate(22050)))
        ));
    }

    #[test]
    fn test_splits_into_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let format = StreamFormat::new(48000, ChannelMask::STEREO);
        let mut sink =
            NetworkSink::new(Box::new(NullSink::new(format)), &loopback_target(&receiver)).unwrap();
        assert!(sink.can_play());
        assert!(sink.is_playing());

        let samples: Vec<f32> = (0..1200).map(|i| i as f32).collect();
        assert!(sink.process(&samples, 600).unwrap());
        assert_eq!(sink.stats().packets_sent, 5);

        let mut received = Vec::new();
        let mut buf = [0u8; 2048];
        for _ in 0..5 {
            let len = receiver.recv(&mut buf).unwrap();
            assert_eq!(&buf[..HEADER_LEN], &[1, 32, 2, 0x00, 0x03]);
            let payload = decode_samples(&buf[..len]).unwrap();
            assert!(payload.len() <= MAX_PAYLOAD_SAMPLES);
            assert_eq!(payload.len() % 2, 0);
            received.extend(payload);
        }
        assert_eq!(received, samples);
    }

    #[test]
    fn test_odd_channel_count_keeps_whole_frames() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let format = StreamFormat::new(96000, ChannelMask(0x13f));
        let mut sink =
            NetworkSink::new(Box::new(NullSink::new(format)), &loopback_target(&receiver)).unwrap();
        let channels = format.channels();
        assert_eq!(channels, 7);

        sink.process(&vec![0.5; channels * 50], 50).unwrap();

        let mut buf = [0u8; 2048];
        let len = receiver.recv(&mut buf).unwrap();
        assert_eq!(buf[0], 2);
        assert_eq!(buf[2], 7);
        assert_eq!((len - HEADER_LEN) / 4, 287);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_send_failure_still_forwards() {
        use crate::sink::testing::RecordingSink;

        // Broadcast without SO_BROADCAST is refused by the kernel
        let target = NetworkTarget {
            bind_address: None,
            peer_address: Some("255.255.255.255".into()),
            peer_service: Some("4010".into()),
        };
        let format = StreamFormat::new(48000, ChannelMask::STEREO);
        let (next, log) = RecordingSink::new(format);
        let mut sink = NetworkSink::new(Box::new(next), &target).unwrap();

        let samples: Vec<f32> = (0..960).map(|i| i as f32).collect();
        assert!(sink.process(&samples, 480).unwrap());
        assert!(sink.process(&samples, 480).unwrap());

        assert_eq!(sink.stats().packets_sent, 0);
        assert!(sink.stats().send_failures > 0);
        let log = log.borrow();
        assert_eq!(log.calls, 2);
        assert_eq!(log.frames, 960);
        assert_eq!(log.samples[..960], samples[..]);
    }
}
