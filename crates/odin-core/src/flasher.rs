//! Flasher - high-level orchestrator for a download-mode session.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::archive::{Compression, Firmware, Member, Source};
use crate::decompress::{self, DecompressError};
use crate::error::FlashError;
use crate::events::{FlashEvent, FlashObserver, TracingObserver};
use crate::matcher::{self, PartitionTarget};
use crate::pit::Pit;
use crate::session::OdinSession;
use crate::transfer::{CancelToken, upload_member};
use crate::transport::{DeviceInfo, NusbTransport, TransportError, UsbTransport, enumerate};

/// Configuration for a flashing run.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Path to the firmware distribution (TAR, optionally `.md5`-tailed).
    pub firmware_path: Option<String>,
    /// Path to a PIT file uploaded in place of the device's table.
    pub pit_path: Option<String>,
    /// Reboot the device after a successful flash.
    pub reboot: bool,
    /// Check the distribution's digest before flashing.
    pub verify_md5: bool,
}

impl FlashConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(std::io::Error::other)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, content)
    }
}

/// Result of a completed flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashSummary {
    pub members_flashed: usize,
    pub bytes_sent: u64,
}

/// One member scheduled for upload.
struct PlanEntry {
    member: Member,
    target: PartitionTarget,
    /// Exact post-decompression size.
    size: u64,
}

/// High-level flasher owning at most one session at a time.
pub struct Flasher<T: UsbTransport> {
    observer: Arc<dyn FlashObserver>,
    session: Option<OdinSession<T>>,
    device: Option<DeviceInfo>,
    cancel: CancelToken,
}

impl Flasher<NusbTransport> {
    /// Flasher with the default tracing observer.
    pub fn new() -> Self {
        Self::with_observer(Arc::new(TracingObserver))
    }

    /// Enumerate devices currently in download mode.
    pub fn list_devices() -> Result<Vec<DeviceInfo>, FlashError> {
        Ok(enumerate()?)
    }

    /// Open the first device in download mode and run handshake and
    /// version negotiation.
    pub fn connect(&mut self) -> Result<DeviceInfo, FlashError> {
        let transport = NusbTransport::open().map_err(|e| match e {
            TransportError::DeviceNotFound { .. } => FlashError::NoDevice,
            other => FlashError::Transport(other),
        })?;
        self.attach(transport)
    }
}

impl Default for Flasher<NusbTransport> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: UsbTransport> Flasher<T> {
    pub fn with_observer(observer: Arc<dyn FlashObserver>) -> Self {
        Self {
            observer,
            session: None,
            device: None,
            cancel: CancelToken::new(),
        }
    }

    /// Handle to request a stop at the next chunk boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn device(&self) -> Option<&DeviceInfo> {
        self.device.as_ref()
    }

    /// Run handshake and negotiation over an already-open transport.
    #[instrument(skip(self, transport))]
    pub fn attach(&mut self, transport: T) -> Result<DeviceInfo, FlashError> {
        let mut info = DeviceInfo {
            vendor_id: transport.vendor_id(),
            product_id: transport.product_id(),
            ..Default::default()
        };

        let mut session = OdinSession::new(transport);
        session.handshake()?;
        session.query_version()?;
        session.negotiate_part_size()?;

        info.protocol_version = session.protocol_version();
        info.default_packet_size = session.preferred_packet_size();

        self.observer.on_event(&FlashEvent::DeviceConnected {
            vid: info.vendor_id,
            pid: info.product_id,
        });

        self.session = Some(session);
        self.device = Some(info.clone());
        Ok(info)
    }

    /// Parse a firmware distribution.
    pub fn load_firmware(&self, source: Box<dyn Source>) -> Result<Firmware, FlashError> {
        Ok(Firmware::load(source)?)
    }

    /// Receive the device's partition table without transferring
    /// anything else.
    pub fn dump_pit(&mut self) -> Result<Vec<u8>, FlashError> {
        let session = self.session.as_mut().ok_or(FlashError::NotConnected)?;
        let data = session.receive_pit()?;
        self.observer
            .on_event(&FlashEvent::PitReceived { bytes: data.len() });
        Ok(data)
    }

    /// Flash every matched member of `firmware`, then close the session
    /// and optionally reboot.
    #[instrument(skip_all, fields(members = firmware.members.len(), reboot))]
    pub fn flash(
        &mut self,
        firmware: &mut Firmware,
        pit_override: Option<&[u8]>,
        reboot: bool,
    ) -> Result<FlashSummary, FlashError> {
        let result = self.run_flash(firmware, pit_override, reboot);
        match &result {
            Ok(summary) => {
                info!(
                    members = summary.members_flashed,
                    bytes = summary.bytes_sent,
                    "Flash complete"
                );
                self.observer.on_event(&FlashEvent::Complete);
            }
            Err(e) => {
                self.observer.on_event(&FlashEvent::Error {
                    message: e.to_string(),
                });
                // a failed session is unusable; release the transport
                self.session = None;
            }
        }
        result
    }

    fn run_flash(
        &mut self,
        firmware: &mut Firmware,
        pit_override: Option<&[u8]>,
        reboot: bool,
    ) -> Result<FlashSummary, FlashError> {
        let session = self.session.as_mut().ok_or(FlashError::NotConnected)?;

        // The matching table: an explicit override wins, then the
        // device's own table, then the PIT carried inside the archive.
        // With no table anywhere, fall back to filename matching.
        let pit = match pit_override {
            Some(bytes) => Some(Pit::parse(bytes)?),
            None => match session.try_receive_pit()? {
                Some(bytes) => Some(Pit::parse(&bytes)?),
                None => match &firmware.embedded_pit {
                    Some(bytes) => {
                        warn!("device did not serve a PIT, matching against the archive's table");
                        Some(Pit::parse(bytes)?)
                    }
                    None => {
                        warn!("no PIT from device or archive, using filename heuristic");
                        None
                    }
                },
            },
        };

        let plan = Self::build_plan(firmware, pit.as_ref())?;
        let total: u64 = plan.iter().map(|p| p.size).sum();

        session.begin_session(total)?;

        if let Some(bytes) = pit_override {
            session.send_pit(bytes)?;
        }

        let mut bytes_sent = 0u64;
        for entry in &plan {
            bytes_sent += upload_member(
                session,
                firmware,
                &entry.member,
                entry.target,
                entry.size,
                &self.cancel,
                self.observer.as_ref(),
            )?;
        }

        if bytes_sent != session.declared_total() {
            session.fail();
            return Err(FlashError::ByteAccounting {
                declared: session.declared_total(),
                actual: bytes_sent,
            });
        }

        session.end_session()?;
        if reboot {
            session.reboot()?;
        }

        Ok(FlashSummary {
            members_flashed: plan.len(),
            bytes_sent,
        })
    }

    /// Match members against the PIT and resolve exact decompressed
    /// sizes, so the declared total equals the transferred total.
    fn build_plan(
        firmware: &mut Firmware,
        pit: Option<&Pit>,
    ) -> Result<Vec<PlanEntry>, FlashError> {
        let members = firmware.members.clone();
        let mut plan = Vec::with_capacity(members.len());
        for member in members {
            let Some(target) = matcher::resolve(&member.name, pit) else {
                warn!(member = %member.name, "no PIT entry matches, skipping");
                continue;
            };
            let size = resolved_size(firmware, &member)?;
            plan.push(PlanEntry {
                member,
                target,
                size,
            });
        }
        Ok(plan)
    }

    /// Close the session and release the transport.
    pub fn disconnect(&mut self) {
        if self.session.take().is_some() {
            self.observer.on_event(&FlashEvent::DeviceDisconnected);
        }
        self.device = None;
    }
}

/// Exact number of bytes a member will put on the wire.
fn resolved_size(firmware: &mut Firmware, member: &Member) -> Result<u64, FlashError> {
    match member.compression {
        Compression::None => Ok(member.size),
        Compression::Lz4 => Ok(decompress::decoded_size(firmware.reader(member))?),
        Compression::Gzip => {
            let mut reader = firmware.reader(member);
            decompress::isize_hint(&mut reader).map_err(|e| {
                FlashError::Decompression(DecompressError::Gzip {
                    position: 0,
                    source: e,
                })
            })
        }
    }
}
