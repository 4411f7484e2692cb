//! Event system for UI decoupling.
//!
//! Allows CLI/GUI frontends to subscribe to flashing events without
//! tight coupling to the core logic. Observers run synchronously inside
//! the session task and must never touch the transport themselves.

use crate::session::SessionPhase;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Events emitted while talking to a device.
#[derive(Debug, Clone)]
pub enum FlashEvent {
    /// Device connected and handshaken.
    DeviceConnected { vid: u16, pid: u16 },
    /// Device released.
    DeviceDisconnected,
    /// Session phase changed.
    PhaseChanged {
        from: SessionPhase,
        to: SessionPhase,
    },
    /// A member's upload began.
    MemberStarted {
        name: String,
        partition_id: u32,
        total: u64,
    },
    /// Progress of the current member, throttled.
    Progress {
        name: String,
        sent: u64,
        total: u64,
        percent: u8,
    },
    /// A member's upload finished.
    MemberCompleted { name: String },
    /// PIT received from the device.
    PitReceived { bytes: usize },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Error occurred.
    Error { message: String },
    /// All operations completed successfully.
    Complete,
}

/// Observer trait for receiving flash events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait FlashObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &FlashEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {
        // Do nothing
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::DeviceConnected { vid, pid } => {
                tracing::info!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), "Device connected");
            }
            FlashEvent::DeviceDisconnected => {
                tracing::info!("Device released");
            }
            FlashEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            FlashEvent::MemberStarted {
                name,
                partition_id,
                total,
            } => {
                tracing::info!(member = %name, partition = partition_id, bytes = total, "Upload started");
            }
            FlashEvent::Progress {
                name,
                sent,
                total,
                percent,
            } => {
                tracing::debug!(member = %name, sent = sent, total = total, progress = %format!("{}%", percent), "Progress");
            }
            FlashEvent::MemberCompleted { name } => {
                tracing::info!(member = %name, "Upload complete");
            }
            FlashEvent::PitReceived { bytes } => {
                tracing::info!(bytes = bytes, "PIT received");
            }
            FlashEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            FlashEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
            FlashEvent::Complete => {
                tracing::info!("Operation complete");
            }
        }
    }
}
