//! Download-mode session.
//!
//! `OdinSession` owns the transport and drives the framed conversation:
//! handshake, version negotiation, session open, PIT exchange, end of
//! session, reboot. Per-member uploads borrow the session through the
//! transfer pipeline. Every reply is validated on arrival; an
//! unexpected echo or a refusal drops the session to `Failed` and the
//! transport is released when the session goes away.

pub mod machine;

pub use machine::SessionPhase;

use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::FlashError;
use crate::protocol::constants::*;
use crate::protocol::frame::{CmdPacket, Reply};
use crate::transport::{TransportError, UsbTransport};

pub struct OdinSession<T: UsbTransport> {
    transport: T,
    phase: SessionPhase,
    protocol_version: u16,
    preferred_packet_size: u16,
    declared_total: u64,
}

impl<T: UsbTransport> OdinSession<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            phase: SessionPhase::Disconnected,
            protocol_version: 0,
            preferred_packet_size: 0,
            declared_total: 0,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Protocol version from the device, valid after `query_version`.
    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    /// Device-preferred packet size, valid after `query_version`.
    pub fn preferred_packet_size(&self) -> u16 {
        self.preferred_packet_size
    }

    /// Byte total declared at session open.
    pub fn declared_total(&self) -> u64 {
        self.declared_total
    }

    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    /// Write `ODIN`, expect an answer starting with `LOKE`.
    #[instrument(skip(self))]
    pub fn handshake(&mut self) -> Result<(), FlashError> {
        self.advance(SessionPhase::Handshaking)?;
        self.guarded(|s| {
            s.transport.write(HANDSHAKE_HELLO)?;
            let answer = s.read_raw(64, COMMAND_TIMEOUT)?;
            if answer.len() < 4 || &answer[..4] != HANDSHAKE_ACK {
                return Err(FlashError::HandshakeFailed { answer });
            }
            info!("Handshake accepted");
            Ok(())
        })
    }

    /// Query protocol version and preferred packet size.
    #[instrument(skip(self))]
    pub fn query_version(&mut self) -> Result<(), FlashError> {
        self.guarded(|s| {
            s.send_packet(&CmdPacket::with_u32(
                CMD_SESSION,
                SESSION_VERSION,
                SESSION_VERSION_ARG,
            ))?;
            let reply = s.expect_cmd(CMD_SESSION, COMMAND_TIMEOUT)?;
            s.protocol_version = (reply.data >> 16) as u16;
            s.preferred_packet_size = reply.data as u16;
            info!(
                version = s.protocol_version,
                packet_size = s.preferred_packet_size,
                "Protocol negotiated"
            );
            Ok(())
        })?;
        self.advance(SessionPhase::Negotiated)
    }

    /// Request the larger part size when the device advertises one.
    #[instrument(skip(self))]
    pub fn negotiate_part_size(&mut self) -> Result<(), FlashError> {
        if self.preferred_packet_size == 0 {
            debug!("Device did not advertise a packet size, keeping defaults");
            return Ok(());
        }
        self.guarded(|s| {
            s.send_packet(&CmdPacket::with_u32(
                CMD_SESSION,
                SESSION_PART_SIZE,
                SESSION_PART_SIZE_ARG,
            ))?;
            let reply = s.expect_cmd(CMD_SESSION, COMMAND_TIMEOUT)?;
            if reply.data != 0 {
                return Err(FlashError::ProtocolMismatch {
                    expected: CMD_SESSION,
                    got_cmd: reply.cmd_echo,
                    got_data: reply.data,
                });
            }
            Ok(())
        })
    }

    /// Open the session, declaring the exact number of post-decompression
    /// bytes the transfer phase will move.
    #[instrument(skip(self))]
    pub fn begin_session(&mut self, total_bytes: u64) -> Result<(), FlashError> {
        self.advance(SessionPhase::Setup)?;
        self.guarded(|s| {
            s.send_packet(&CmdPacket::with_u64(
                CMD_SESSION,
                SESSION_TOTAL_BYTES,
                total_bytes,
            ))?;
            let reply = s.expect_cmd(CMD_SESSION, COMMAND_TIMEOUT)?;
            if reply.data != 0 {
                return Err(FlashError::ProtocolMismatch {
                    expected: CMD_SESSION,
                    got_cmd: reply.cmd_echo,
                    got_data: reply.data,
                });
            }
            s.declared_total = total_bytes;
            info!(total_bytes, "Session open");
            Ok(())
        })?;
        self.advance(SessionPhase::Ready)
    }

    /// Receive the device's PIT. A device that never answers the size
    /// request is fatal here; callers that can fall back to filename
    /// matching use `try_receive_pit`.
    #[instrument(skip(self))]
    pub fn receive_pit(&mut self) -> Result<Vec<u8>, FlashError> {
        match self.try_receive_pit()? {
            Some(data) => Ok(data),
            None => {
                let phase = self.phase;
                self.phase = SessionPhase::Failed;
                Err(FlashError::Timeout {
                    phase,
                    source: TransportError::Timeout {
                        timeout_ms: COMMAND_TIMEOUT.as_millis() as u64,
                    },
                })
            }
        }
    }

    /// Receive the device's PIT, treating a device that does not serve
    /// one as `Ok(None)` rather than a session failure.
    ///
    /// Works before or after session open: matching needs the PIT before
    /// the byte total can be declared.
    #[instrument(skip(self))]
    pub fn try_receive_pit(&mut self) -> Result<Option<Vec<u8>>, FlashError> {
        self.require_any(&[SessionPhase::Negotiated, SessionPhase::Ready])?;

        // The size announcement is the one read that gets a second try.
        let mut attempt = 0;
        let size = loop {
            let result = self
                .send_packet(&CmdPacket::with_u32(CMD_PIT, PIT_DUMP, 0))
                .and_then(|()| self.expect_cmd(CMD_PIT, COMMAND_TIMEOUT));
            match result {
                Ok(reply) => break reply.data,
                Err(e) if e.is_timeout() && attempt == 0 => {
                    warn!("PIT size read timed out, retrying once");
                    attempt += 1;
                }
                Err(e) if e.is_timeout() => {
                    warn!("device does not serve a PIT");
                    return Ok(None);
                }
                Err(e) => {
                    self.phase = SessionPhase::Failed;
                    return Err(e);
                }
            }
        };

        self.guarded(|s| {
            if size == 0 || size > PIT_SIZE_LIMIT {
                return Err(FlashError::InvalidPit(
                    crate::pit::PitError::SizeOutOfRange { announced: size },
                ));
            }

            let mut data = Vec::with_capacity(size as usize);
            let mut counter = 0u32;
            while data.len() < size as usize {
                s.send_packet(&CmdPacket::with_u32(CMD_PIT, PIT_PART, counter))?;
                let part = s.read_raw(PIT_READ_CHUNK, COMMAND_TIMEOUT)?;
                if part.is_empty() {
                    return Err(FlashError::Transport(TransportError::ReadFailed(
                        "empty PIT part".into(),
                    )));
                }
                let want = (size as usize - data.len()).min(part.len());
                data.extend_from_slice(&part[..want]);
                counter += 1;
            }

            s.send_packet(&CmdPacket::with_u32(CMD_PIT, PIT_END, 0))?;
            s.expect_cmd(CMD_PIT, COMMAND_TIMEOUT)?;
            info!(bytes = data.len(), parts = counter, "PIT received");
            Ok(Some(data))
        })
    }

    /// Upload a replacement PIT, streamed in 1 MiB pieces with a single
    /// trailing acknowledgement.
    ///
    /// Bootloaders speaking protocol version 3 or lower take no PIT
    /// info; the upload is a silent success there.
    #[instrument(skip(self, pit))]
    pub fn send_pit(&mut self, pit: &[u8]) -> Result<(), FlashError> {
        self.require_any(&[SessionPhase::Ready])?;
        if self.protocol_version <= 3 {
            debug!(
                version = self.protocol_version,
                "old protocol takes no PIT info, skipping upload"
            );
            return Ok(());
        }
        self.guarded(|s| {
            s.send_packet(&CmdPacket::with_u32(CMD_PIT, PIT_FLASH, pit.len() as u32))?;
            for piece in pit.chunks(PIT_FLASH_CHUNK) {
                s.transport.write(piece)?;
            }
            s.expect_cmd(CMD_PIT, COMMAND_TIMEOUT)?;
            info!(bytes = pit.len(), "PIT uploaded");
            Ok(())
        })
    }

    /// Close the session.
    #[instrument(skip(self))]
    pub fn end_session(&mut self) -> Result<(), FlashError> {
        self.advance(SessionPhase::Closing)?;
        self.guarded(|s| {
            s.send_packet(&CmdPacket::with_u32(CMD_END, END_SESSION, 0))?;
            s.expect_cmd(CMD_END, COMMAND_TIMEOUT)?;
            info!("Session closed");
            Ok(())
        })
    }

    /// Reboot the device. The link usually drops before the reply
    /// arrives, which is not an error.
    #[instrument(skip(self))]
    pub fn reboot(&mut self) -> Result<(), FlashError> {
        self.advance(SessionPhase::Rebooting)?;
        if let Err(e) = self.send_packet(&CmdPacket::with_u32(CMD_END, END_REBOOT, 0)) {
            debug!(error = %e, "link dropped while sending reboot");
        } else if let Err(e) = self.read_reply(COMMAND_TIMEOUT) {
            debug!(error = %e, "no reboot reply (link down, expected)");
        }
        info!("Reboot requested");
        self.advance(SessionPhase::Disconnected)
    }

    // ------------------------------------------------------------------
    // Plumbing shared with the transfer pipeline
    // ------------------------------------------------------------------

    /// Transition to `next`, rejecting anything the phase graph forbids.
    pub(crate) fn advance(&mut self, next: SessionPhase) -> Result<(), FlashError> {
        if !self.phase.can_advance_to(next) {
            let err = FlashError::Transition {
                from: self.phase,
                to: next,
            };
            self.phase = SessionPhase::Failed;
            return Err(err);
        }
        debug!(from = %self.phase, to = %next, "Phase transition");
        self.phase = next;
        Ok(())
    }

    pub(crate) fn fail(&mut self) {
        self.phase = SessionPhase::Failed;
    }

    pub(crate) fn send_packet(&mut self, pkt: &CmdPacket) -> Result<(), FlashError> {
        self.transport.write(pkt.as_bytes())?;
        Ok(())
    }

    pub(crate) fn read_raw(
        &mut self,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, FlashError> {
        match self.transport.read(max_len, timeout) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.is_timeout() => Err(FlashError::Timeout {
                phase: self.phase,
                source: e,
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn read_reply(&mut self, timeout: Duration) -> Result<Reply, FlashError> {
        let bytes = self.read_raw(REPLY_SIZE, timeout)?;
        Ok(Reply::parse(&bytes)?)
    }

    /// Read a reply and require `expected_cmd` as its echo. Refusals and
    /// mismatches are fatal.
    pub(crate) fn expect_cmd(
        &mut self,
        expected_cmd: u32,
        timeout: Duration,
    ) -> Result<Reply, FlashError> {
        let reply = self.read_reply(timeout)?;
        if reply.is_refusal() {
            return Err(FlashError::Refused { code: reply.data });
        }
        if reply.cmd_echo != expected_cmd {
            return Err(FlashError::ProtocolMismatch {
                expected: expected_cmd,
                got_cmd: reply.cmd_echo,
                got_data: reply.data,
            });
        }
        Ok(reply)
    }

    /// Run `op`; any error drops the session to `Failed`.
    fn guarded<R>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<R, FlashError>,
    ) -> Result<R, FlashError> {
        match op(self) {
            Ok(v) => Ok(v),
            Err(e) => {
                self.phase = SessionPhase::Failed;
                Err(e)
            }
        }
    }

    fn require_any(&mut self, phases: &[SessionPhase]) -> Result<(), FlashError> {
        if !phases.contains(&self.phase) {
            let err = FlashError::Phase {
                required: phases[0],
                actual: self.phase,
            };
            self.phase = SessionPhase::Failed;
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn session_with_version(
        version: u16,
        mock_setup: impl Fn(&MockTransport),
    ) -> OdinSession<MockTransport> {
        let mock = MockTransport::new();
        mock.queue_response(b"LOKE");
        mock.queue_reply(CMD_SESSION, (u32::from(version) << 16) | 512); // version reply
        mock.queue_reply(CMD_SESSION, 0); // part size ack
        mock_setup(&mock);
        let mut session = OdinSession::new(mock);
        session.handshake().unwrap();
        session.query_version().unwrap();
        session.negotiate_part_size().unwrap();
        session
    }

    fn ready_session(mock_setup: impl Fn(&MockTransport)) -> OdinSession<MockTransport> {
        session_with_version(3, mock_setup)
    }

    #[test]
    fn handshake_accepts_loke() {
        let mock = MockTransport::new();
        mock.queue_response(b"LOKE");
        let mut session = OdinSession::new(mock);
        session.handshake().unwrap();
        assert_eq!(session.phase(), SessionPhase::Handshaking);
        assert_eq!(session.transport().writes()[0].data, b"ODIN");
    }

    #[test]
    fn handshake_rejects_anything_else() {
        let mock = MockTransport::new();
        mock.queue_response(b"NOPE");
        let mut session = OdinSession::new(mock);
        let err = session.handshake().unwrap_err();
        assert!(matches!(err, FlashError::HandshakeFailed { .. }));
        assert_eq!(session.phase(), SessionPhase::Failed);
    }

    #[test]
    fn version_reply_splits_into_version_and_packet_size() {
        let session = ready_session(|_| {});
        assert_eq!(session.protocol_version(), 3);
        assert_eq!(session.preferred_packet_size(), 512);
        assert_eq!(session.phase(), SessionPhase::Negotiated);
    }

    #[test]
    fn zero_packet_size_skips_negotiation() {
        let mock = MockTransport::new();
        mock.queue_response(b"LOKE");
        mock.queue_reply(CMD_SESSION, 4 << 16); // preferred size 0
        let mut session = OdinSession::new(mock);
        session.handshake().unwrap();
        session.query_version().unwrap();
        session.negotiate_part_size().unwrap();
        // only the handshake and the version query hit the wire
        assert_eq!(session.transport().writes().len(), 2);
    }

    #[test]
    fn begin_session_declares_total() {
        let mut session = ready_session(|mock| {
            mock.queue_reply(CMD_SESSION, 0);
        });
        session.begin_session(209_715_200).unwrap();
        assert_eq!(session.phase(), SessionPhase::Ready);
        assert_eq!(session.declared_total(), 209_715_200);

        let frames = session.transport().frames(CMD_SESSION, SESSION_TOTAL_BYTES);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len, CMD_PACKET_SIZE);
        assert_eq!(&frames[0].data[8..16], &209_715_200u64.to_le_bytes()[..]);
    }

    #[test]
    fn refusal_is_fatal() {
        let mut session = ready_session(|mock| {
            mock.queue_reply(REPLY_REFUSED, 0x42);
        });
        let err = session.begin_session(1).unwrap_err();
        assert!(matches!(err, FlashError::Refused { code: 0x42 }));
        assert_eq!(session.phase(), SessionPhase::Failed);
    }

    #[test]
    fn mismatched_echo_is_fatal() {
        let mut session = ready_session(|mock| {
            mock.queue_reply(CMD_XMIT, 0);
        });
        let err = session.begin_session(1).unwrap_err();
        assert!(matches!(
            err,
            FlashError::ProtocolMismatch {
                expected: CMD_SESSION,
                got_cmd: CMD_XMIT,
                ..
            }
        ));
    }

    #[test]
    fn receive_pit_assembles_chunked_reads() {
        let pit_bytes = crate::pit::Pit {
            entries: vec![Default::default(); 5],
        }
        .serialize();
        assert!(pit_bytes.len() > PIT_READ_CHUNK);

        let mut session = ready_session(|mock| {
            mock.queue_reply(CMD_PIT, pit_bytes.len() as u32);
        });
        // responses for the (101,2,counter) loop, then the end ack
        {
            let mock = session.transport();
            for part in pit_bytes.chunks(PIT_READ_CHUNK) {
                mock.queue_response(part);
            }
            mock.queue_reply(CMD_PIT, 0);
        }

        let received = session.receive_pit().unwrap();
        assert_eq!(received, pit_bytes);

        let parts = session.transport().frames(CMD_PIT, PIT_PART);
        assert_eq!(parts.len(), pit_bytes.len().div_ceil(PIT_READ_CHUNK));
        // counters run 0, 1, 2, ...
        for (i, frame) in parts.iter().enumerate() {
            assert_eq!(frame.u32_at(8), Some(i as u32));
        }
        assert_eq!(session.transport().frames(CMD_PIT, PIT_END).len(), 1);
    }

    #[test]
    fn pit_size_read_retries_once_on_timeout() {
        // nothing queued: both size reads time out
        let mut session = ready_session(|_| {});
        let err = session.receive_pit().unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(session.phase(), SessionPhase::Failed);
        // the retry happened: two size requests hit the wire
        assert_eq!(session.transport().frames(CMD_PIT, PIT_DUMP).len(), 2);
    }

    #[test]
    fn pitless_device_leaves_session_usable() {
        let mut session = ready_session(|_| {});
        assert!(session.try_receive_pit().unwrap().is_none());
        assert_eq!(session.phase(), SessionPhase::Negotiated);
        // the session can still be opened afterwards
        session.transport().queue_reply(CMD_SESSION, 0);
        session.begin_session(0).unwrap();
    }

    #[test]
    fn oversized_pit_announcement_rejected() {
        let mut session = ready_session(|mock| {
            mock.queue_reply(CMD_PIT, PIT_SIZE_LIMIT + 1);
        });
        assert!(matches!(
            session.receive_pit().unwrap_err(),
            FlashError::InvalidPit(_)
        ));
    }

    #[test]
    fn send_pit_streams_and_reads_one_reply() {
        let mut session = session_with_version(4, |mock| {
            mock.queue_reply(CMD_SESSION, 0); // begin_session
            mock.queue_reply(CMD_PIT, 0); // upload ack
        });
        session.begin_session(0).unwrap();

        let pit = vec![0xA5u8; 3 * 1024 * 1024 / 2]; // 1.5 MiB -> 2 pieces
        session.send_pit(&pit).unwrap();

        let writes = session.transport().writes();
        // command frame, then two data pieces
        let cmd_idx = writes
            .iter()
            .position(|w| w.header() == Some((CMD_PIT, PIT_FLASH)))
            .unwrap();
        assert_eq!(writes[cmd_idx].u32_at(8), Some(pit.len() as u32));
        assert_eq!(writes[cmd_idx + 1].len, PIT_FLASH_CHUNK);
        assert_eq!(writes[cmd_idx + 2].len, pit.len() - PIT_FLASH_CHUNK);
    }

    #[test]
    fn send_pit_is_a_noop_on_protocol_3_and_older() {
        for version in [1, 3] {
            let mut session = session_with_version(version, |mock| {
                mock.queue_reply(CMD_SESSION, 0); // begin_session
            });
            session.begin_session(0).unwrap();

            session.send_pit(&[0xA5u8; 64]).unwrap();
            assert_eq!(session.phase(), SessionPhase::Ready);
            assert!(session.transport().frames(CMD_PIT, PIT_FLASH).is_empty());
            // nothing was read either: no reply expected on the no-op path
            assert_eq!(session.transport().pending_replies(), 0);
        }
    }

    #[test]
    fn end_session_and_reboot() {
        let mut session = ready_session(|mock| {
            mock.queue_reply(CMD_SESSION, 0);
            mock.queue_reply(CMD_END, 0);
            // no reboot reply queued: the link is allowed to drop
        });
        session.begin_session(0).unwrap();
        session.end_session().unwrap();
        assert_eq!(session.phase(), SessionPhase::Closing);
        session.reboot().unwrap();
        assert_eq!(session.phase(), SessionPhase::Disconnected);

        assert_eq!(session.transport().frames(CMD_END, END_SESSION).len(), 1);
        assert_eq!(session.transport().frames(CMD_END, END_REBOOT).len(), 1);
    }

    #[test]
    fn every_command_frame_is_1024_bytes() {
        let mut session = ready_session(|mock| {
            mock.queue_reply(CMD_SESSION, 0);
            mock.queue_reply(CMD_END, 0);
        });
        session.begin_session(42).unwrap();
        session.end_session().unwrap();

        for w in session.transport().writes() {
            if w.header().is_some_and(|(cmd, _)| (100..=103).contains(&cmd)) {
                assert_eq!(w.len, CMD_PACKET_SIZE);
            }
        }
    }
}
