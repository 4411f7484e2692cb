//! Transfer pipeline.
//!
//! Uploads one archive member at a time: activate, announce a chunk of
//! at most 30 MiB, stream it in acknowledged 128 KiB blocks, commit it
//! with a finalizer. Member bytes arrive either straight from the
//! archive file or out of a streaming decoder, and accumulate in a
//! single bounded buffer that is reused for every chunk and never
//! grown.
//!
//! The zero-length writes around data blocks and finalizers are part of
//! the ordering contract; devices hang without them. Their errors are
//! ignored.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::archive::{Compression, Firmware, Member};
use crate::decompress::{GzipStream, Lz4FrameDecoder};
use crate::error::FlashError;
use crate::events::{FlashEvent, FlashObserver};
use crate::matcher::PartitionTarget;
use crate::protocol::constants::*;
use crate::protocol::frame::CmdPacket;
use crate::session::{OdinSession, SessionPhase};
use crate::transport::UsbTransport;

/// Cooperative stop request, honored at chunk boundaries only:
/// interrupting a chunk mid-flight risks a partially written partition.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Upload state for a single member.
pub struct MemberUpload<'s, T: UsbTransport> {
    session: &'s mut OdinSession<T>,
    observer: &'s dyn FlashObserver,
    cancel: &'s CancelToken,
    name: String,
    target: PartitionTarget,
    /// Exact decompressed size, known before the upload starts.
    total: u64,
    sent: u64,
    buf: Vec<u8>,
    last_progress: Instant,
}

impl<'s, T: UsbTransport> MemberUpload<'s, T> {
    /// Activate the file-transfer mode for one member.
    pub fn begin(
        session: &'s mut OdinSession<T>,
        observer: &'s dyn FlashObserver,
        cancel: &'s CancelToken,
        name: &str,
        target: PartitionTarget,
        total: u64,
    ) -> Result<Self, FlashError> {
        session.advance(SessionPhase::Transferring)?;
        let activation = session
            .send_packet(&CmdPacket::with_u32(CMD_XMIT, XMIT_FLASH, 0))
            .and_then(|()| session.expect_cmd(CMD_XMIT, COMMAND_TIMEOUT));
        if let Err(e) = activation {
            session.fail();
            return Err(e);
        }

        observer.on_event(&FlashEvent::MemberStarted {
            name: name.to_string(),
            partition_id: target.partition_id,
            total,
        });

        Ok(Self {
            session,
            observer,
            cancel,
            name: name.to_string(),
            target,
            total,
            sent: 0,
            buf: Vec::with_capacity(SEND_BUFFER_SIZE),
            last_progress: Instant::now(),
        })
    }

    /// Append bytes, flushing full 30 MiB chunks as they accumulate.
    pub fn push(&mut self, mut data: &[u8]) -> Result<(), FlashError> {
        while !data.is_empty() {
            let room = SEND_BUFFER_SIZE - self.buf.len();
            let take = room.min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == SEND_BUFFER_SIZE {
                self.flush_chunk()?;
            }
        }
        Ok(())
    }

    /// Flush the remainder and verify the member's byte count.
    pub fn finish(mut self) -> Result<u64, FlashError> {
        if !self.buf.is_empty() {
            self.flush_chunk()?;
        }
        if self.sent != self.total {
            self.session.fail();
            return Err(FlashError::ByteAccounting {
                declared: self.total,
                actual: self.sent,
            });
        }
        self.observer.on_event(&FlashEvent::MemberCompleted {
            name: self.name.clone(),
        });
        info!(member = %self.name, bytes = self.sent, "Member uploaded");
        Ok(self.sent)
    }

    fn flush_chunk(&mut self) -> Result<(), FlashError> {
        if self.cancel.is_cancelled() {
            self.session.fail();
            return Err(FlashError::Cancelled);
        }

        let result = self.send_chunk();
        if result.is_err() {
            self.session.fail();
        }
        result
    }

    fn send_chunk(&mut self) -> Result<(), FlashError> {
        let chunk_len = self.buf.len();
        let last = self.sent + chunk_len as u64 >= self.total;
        debug!(
            member = %self.name,
            bytes = chunk_len,
            last,
            "Sending chunk"
        );

        self.session.send_packet(&CmdPacket::with_u32(
            CMD_XMIT,
            XMIT_PART,
            chunk_len as u32,
        ))?;
        self.session.expect_cmd(CMD_XMIT, COMMAND_TIMEOUT)?;

        // Device preparation window.
        std::thread::sleep(CHUNK_PREP_DELAY);

        let mut padded = vec![0u8; FILE_BLOCK_SIZE];
        for (index, block) in self.buf.chunks(FILE_BLOCK_SIZE).enumerate() {
            if index != 0 {
                let _ = self.session.transport().write_zlp();
            }
            if block.len() == FILE_BLOCK_SIZE {
                self.session.transport().write(block)?;
            } else {
                padded[..block.len()].copy_from_slice(block);
                padded[block.len()..].fill(0);
                self.session.transport().write(&padded)?;
            }
            self.session.expect_cmd(CMD_XMIT, COMMAND_TIMEOUT)?;
        }

        let _ = self.session.transport().write_zlp();
        self.session.send_packet(&CmdPacket::file_finalizer(
            chunk_len as u32,
            self.target.device_type,
            self.target.partition_id,
            last,
        ))?;
        let _ = self.session.transport().write_zlp();

        match self.session.read_reply(FINALIZER_TIMEOUT) {
            Ok(reply) if reply.is_refusal() => {
                return Err(FlashError::TransferRejected {
                    code: reply.data,
                    partition_id: self.target.partition_id,
                });
            }
            Ok(reply) if reply.cmd_echo != CMD_XMIT => {
                return Err(FlashError::ProtocolMismatch {
                    expected: CMD_XMIT,
                    got_cmd: reply.cmd_echo,
                    got_data: reply.data,
                });
            }
            Ok(_) => {}
            Err(e) if e.is_timeout() && last => {
                warn!(member = %self.name, "no reply to the final finalizer, tolerated");
            }
            Err(e) => return Err(e),
        }

        self.sent += chunk_len as u64;
        self.buf.clear();
        self.report_progress(last);
        Ok(())
    }

    fn report_progress(&mut self, force: bool) {
        if !force && self.last_progress.elapsed() < PROGRESS_INTERVAL {
            return;
        }
        self.last_progress = Instant::now();
        let percent = if self.total > 0 {
            ((self.sent * 100) / self.total) as u8
        } else {
            100
        };
        self.observer.on_event(&FlashEvent::Progress {
            name: self.name.clone(),
            sent: self.sent,
            total: self.total,
            percent,
        });
    }
}

/// Upload one member end to end, routing it through the decoder its
/// compression calls for. Returns the number of bytes committed.
pub fn upload_member<T: UsbTransport>(
    session: &mut OdinSession<T>,
    firmware: &mut Firmware,
    member: &Member,
    target: PartitionTarget,
    resolved_size: u64,
    cancel: &CancelToken,
    observer: &dyn FlashObserver,
) -> Result<u64, FlashError> {
    let mut upload = MemberUpload::begin(
        session,
        observer,
        cancel,
        &member.name,
        target,
        resolved_size,
    )?;

    match member.compression {
        Compression::None => {
            let mut reader = firmware.reader(member);
            let mut scratch = vec![0u8; FILE_BLOCK_SIZE];
            loop {
                let n = std::io::Read::read(&mut reader, &mut scratch)
                    .map_err(crate::archive::ArchiveError::from)?;
                if n == 0 {
                    break;
                }
                upload.push(&scratch[..n])?;
            }
        }
        Compression::Lz4 => {
            let mut decoder = Lz4FrameDecoder::new(firmware.reader(member))?;
            while let Some(block) = decoder.next_block()? {
                upload.push(block)?;
            }
        }
        Compression::Gzip => {
            let mut decoder = GzipStream::new(firmware.reader(member));
            while let Some(block) = decoder.next_block()? {
                upload.push(block)?;
            }
        }
    }

    upload.finish()
}
