/* Character-device adapter: translates file operations arriving from an
 * opaque user peer into device operations, copying data across the
 * trust boundary through bounded buffers.
 *
 * The framework that actually registers nodes in /dev and multiplexes
 * user I/O into these methods is an external collaborator behind
 * `CharDevHost`; everything device-shaped lives here. */

use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use thiserror::Error;

use crate::device::{ControlError, Device, OpenError, ReadOutcome};
use crate::proto::ReportKind;
use crate::transport::MAX_REPORT_SIZE;

/* Node naming: btsixa<N>, symlinked to the conventional uhid<N> name by
 * external machinery. We cannot take the uhid name directly because a
 * real wired device with the same unit number may appear. */
pub const DEV_NAME_PREFIX: &str = "btsixa";

/* Reading is sufficient for using the controller; writing allows
 * setting LEDs and rumbling. */
pub const DEV_NODE_MODE: u32 = 0o644;
pub const DEV_NODE_GROUP: &str = "operator";

/* ------------------------------------------------------------------ */
/* Host framework seams                                                 */
/* ------------------------------------------------------------------ */

/* Polled by blocked device operations: has the peer that issued the
 * current upcall stopped waiting for it? */
pub trait CancelProbe: Send + Sync {
    fn cancelled(&self) -> bool;
}

pub struct NeverCancelled;

impl CancelProbe for NeverCancelled {
    fn cancelled(&self) -> bool {
        false
    }
}

/* A created node; dropping the handle destroys it. */
pub trait NodeHandle: Send {}

/* The character-device framework. Its worker pool routes each file
 * operation on a created node into the matching `DeviceNode` method. */
pub trait CharDevHost: Send + Sync {
    fn create(&self, name: &str, node: Arc<DeviceNode>) -> Result<Box<dyn NodeHandle>>;

    fn cancel_probe(&self) -> Arc<dyn CancelProbe>;
}

/* Degraded mode for platforms without a userspace character-device
 * framework: sessions still run, drive LEDs and activation, but no node
 * appears and the device keeps the all-LEDs-blinking pattern. */
pub struct NullChardev;

impl CharDevHost for NullChardev {
    fn create(&self, _name: &str, _node: Arc<DeviceNode>) -> Result<Box<dyn NodeHandle>> {
        bail!("No character-device framework available");
    }

    fn cancel_probe(&self) -> Arc<dyn CancelProbe> {
        Arc::new(NeverCancelled)
    }
}

/* ------------------------------------------------------------------ */
/* Unit numbers                                                         */
/* ------------------------------------------------------------------ */

/* Per-process pool of exported unit numbers; the smallest free number
 * is always handed out so reconnecting controllers reclaim their LED. */
#[derive(Default)]
pub struct UnitPool {
    used: Mutex<Vec<bool>>,
}

impl UnitPool {
    pub fn new() -> UnitPool {
        UnitPool::default()
    }

    pub fn allocate(&self) -> u32 {
        let mut used = self.used.lock();
        match used.iter().position(|&in_use| !in_use) {
            Some(unit) => {
                used[unit] = true;
                unit as u32
            }
            None => {
                used.push(true);
                (used.len() - 1) as u32
            }
        }
    }

    pub fn release(&self, unit: u32) {
        let mut used = self.used.lock();
        if let Some(slot) = used.get_mut(unit as usize) {
            *slot = false;
        }
    }
}

/* ------------------------------------------------------------------ */
/* File operations                                                      */
/* ------------------------------------------------------------------ */

/* Per-operation open flags as reported by the framework. */
#[derive(Debug, Clone, Copy, Default)]
pub struct FileFlags {
    pub read: bool,
    pub write: bool,
    pub nonblock: bool,
}

impl FileFlags {
    pub fn read_write() -> FileFlags {
        FileFlags {
            read: true,
            write: true,
            nonblock: false,
        }
    }
}

/* Framework-level operation results, one per error the user peer can
 * observe. */
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FileError {
    #[error("Device is busy")]
    Busy,
    #[error("Operation would block")]
    WouldBlock,
    #[error("Invalid argument")]
    Invalid,
    #[error("I/O error")]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollEvents {
    pub read: bool,
    pub write: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorInfo {
    /* True descriptor length, reported even when the caller's buffer is
     * shorter. */
    pub total: usize,
    pub copied: usize,
}

fn control_result(err: ControlError) -> FileError {
    match err {
        ControlError::Disconnected => FileError::Other,
        ControlError::NotReady => FileError::WouldBlock,
        ControlError::Refused(_) => FileError::Invalid,
    }
}

/* The file implementation bound to one created node. */
pub struct DeviceNode {
    dev: Arc<Device>,
}

impl DeviceNode {
    pub fn new(dev: Arc<Device>) -> DeviceNode {
        DeviceNode { dev }
    }

    pub fn open(&self, _flags: FileFlags) -> Result<(), FileError> {
        self.dev.open().map_err(|e| match e {
            OpenError::Busy => FileError::Busy,
            OpenError::Disconnected => FileError::Other,
        })
    }

    pub fn close(&self) {
        self.dev.close();
    }

    /* Read the buffered input report. A disconnected device reads as
     * end-of-file (empty result). */
    pub fn read(&self, len: usize, flags: FileFlags) -> Result<Vec<u8>, FileError> {
        if !flags.read {
            return Err(FileError::Other);
        }
        let mut buf = vec![0u8; len.min(MAX_REPORT_SIZE)];
        match self.dev.read(&mut buf, flags.nonblock) {
            ReadOutcome::Data(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            ReadOutcome::Empty => Err(FileError::WouldBlock),
            ReadOutcome::Disconnected => Ok(Vec::new()),
        }
    }

    pub fn write(&self, data: &[u8], flags: FileFlags) -> Result<usize, FileError> {
        if !flags.write {
            return Err(FileError::Other);
        }
        let len = data.len().min(MAX_REPORT_SIZE);
        match self.dev.write(&data[..len]) {
            Ok(()) => Ok(len),
            Err(_) => Err(FileError::Invalid),
        }
    }

    /* Writing never blocks; reading is ready once a report is buffered
     * or the device is gone (the read will then return EOF). */
    pub fn poll(&self, events: PollEvents) -> PollEvents {
        PollEvents {
            read: events.read && self.dev.input_ready(),
            write: events.write,
        }
    }

    /* ---------------------------------------------------------------- */
    /* ioctl surface                                                      */
    /* ---------------------------------------------------------------- */

    /* First report ID, or 0 for an ID-less descriptor. */
    pub fn report_id(&self) -> u8 {
        self.dev.descriptor().first_id
    }

    /* Copy out the served report descriptor, reporting its true length
     * alongside however much fit. */
    pub fn descriptor(&self, buf: &mut [u8]) -> DescriptorInfo {
        let bytes = self.dev.descriptor().bytes;
        let copied = buf.len().min(bytes.len());
        buf[..copied].copy_from_slice(&bytes[..copied]);
        DescriptorInfo {
            total: bytes.len(),
            copied,
        }
    }

    /* Synchronous GET_REPORT. `buf[0]` carries the report ID on entry
     * for numbered descriptors; the reply overwrites `buf`. */
    pub fn get_report(&self, kind: u8, buf: &mut [u8], flags: FileFlags) -> Result<usize, FileError> {
        if !flags.read {
            return Err(FileError::Other);
        }
        let kind = ReportKind::from_u8(kind).ok_or(FileError::Invalid)?;
        self.dev.get_report(kind, buf).map_err(control_result)
    }

    pub fn set_report(&self, kind: u8, data: &[u8], flags: FileFlags) -> Result<(), FileError> {
        if !flags.write {
            return Err(FileError::Other);
        }
        let kind = ReportKind::from_u8(kind).ok_or(FileError::Invalid)?;
        let len = data.len().min(MAX_REPORT_SIZE);
        self.dev.set_report(kind, &data[..len]).map_err(control_result)
    }
}
