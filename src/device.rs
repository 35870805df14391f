/* Device state machine — the heart of a live session.
 *
 * Each paired connection gets one `Device`, shared between the control
 * reader, the interrupt reader, the supervising session worker, and the
 * character-device worker pool. One mutex protects the lifecycle state,
 * the latest-input slot, the in-flight control query and the diagnostic
 * counters; one condition variable covers every predicate.
 *
 * Every internal wait is a 100 ms timed wait against the monotonic
 * clock, so cancellation sources that never signal the condvar (a peer
 * abandoning an upcall, a disconnect initiated on another thread) are
 * observed within one quantum. */

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::adapter::{HidAdapter, PowerMode, ReportDescriptor};
use crate::addr::BdAddr;
use crate::chardev::{CancelProbe, CharDevHost, DeviceNode, UnitPool, DEV_NAME_PREFIX};
use crate::proto::{self, CtrlTransaction, ReportKind};
use crate::transport::{self, ChannelRole, HidChannel, MAX_REPORT_SIZE};

/* Upper bound on how long a cancellation source can go unnoticed. */
const WAIT_QUANTUM: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Closed,
    Opened,
    /* Absorbing: no transition leaves it. */
    Disconnected,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OpenError {
    #[error("Device is already open")]
    Busy,
    #[error("Device is disconnected")]
    Disconnected,
}

/* Failure of a write on the interrupt channel. */
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Device is disconnected")]
pub struct Disconnected;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("Device is disconnected")]
    Disconnected,
    /* HANDSHAKE result NOT_READY. */
    #[error("Device is not ready")]
    NotReady,
    /* Any other non-zero HANDSHAKE result, e.g. an invalid report ID. */
    #[error("Request refused by device (handshake code {0})")]
    Refused(u8),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /* Bytes copied out; the slot is cleared. */
    Data(usize),
    /* Non-blocking read with nothing buffered. */
    Empty,
    /* End of file for the reader. */
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryKind {
    Get,
    Set,
}

/* The single in-flight control query. The reply envelope is owned here,
 * never by the caller's frame, so a caller that gives up can simply
 * leave; the control reader frees the abandoned slot when the matching
 * reply arrives (`cancelled`), and no stale buffer is ever written. */
struct ControlQuery {
    kind: QueryKind,
    report: ReportKind,
    capacity: usize,
    reply: Vec<u8>,
    /* None while the reply is outstanding. */
    result: Option<u8>,
    cancelled: bool,
}

struct Inner {
    state: Lifecycle,
    timeout_armed: bool,
    /* Directions whose first interrupt transaction has been printed. */
    printed: u8,
    /* Latest-value slot: overwritten by each input report, cleared by
     * the reader that consumes it. */
    input: Box<[u8; MAX_REPORT_SIZE]>,
    input_len: usize,
    query: Option<ControlQuery>,
}

pub struct Device {
    addr: BdAddr,
    adapter: &'static dyn HidAdapter,
    ctrl: Arc<dyn HidChannel>,
    intr: Arc<dyn HidChannel>,
    debug: u8,
    idle_timeout: Option<Duration>,
    cancel: Arc<dyn CancelProbe>,
    /* Exported unit number, -1 while no character device exists. */
    unit: AtomicI32,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Device {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        addr: BdAddr,
        adapter: &'static dyn HidAdapter,
        ctrl: Arc<dyn HidChannel>,
        intr: Arc<dyn HidChannel>,
        debug: u8,
        idle_timeout: Option<Duration>,
        cancel: Arc<dyn CancelProbe>,
    ) -> Device {
        Device {
            addr,
            adapter,
            ctrl,
            intr,
            debug,
            idle_timeout,
            cancel,
            unit: AtomicI32::new(-1),
            inner: Mutex::new(Inner {
                state: Lifecycle::Closed,
                timeout_armed: false,
                printed: 0,
                input: Box::new([0u8; MAX_REPORT_SIZE]),
                input_len: 0,
                query: None,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn addr(&self) -> BdAddr {
        self.addr
    }

    pub fn model(&self) -> &'static str {
        self.adapter.model()
    }

    pub fn descriptor(&self) -> &'static ReportDescriptor {
        self.adapter.descriptor()
    }

    pub fn unit(&self) -> Option<u32> {
        match self.unit.load(Ordering::SeqCst) {
            unit if unit >= 0 => Some(unit as u32),
            _ => None,
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.lock().state == Lifecycle::Disconnected
    }

    /* ---------------------------------------------------------------- */
    /* Lifecycle                                                          */
    /* ---------------------------------------------------------------- */

    pub fn open(&self) -> Result<(), OpenError> {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                Lifecycle::Opened => return Err(OpenError::Busy),
                Lifecycle::Disconnected => return Err(OpenError::Disconnected),
                Lifecycle::Closed => {
                    inner.state = Lifecycle::Opened;
                    inner.timeout_armed = false;
                    inner.input_len = 0;
                    self.cond.notify_all();
                }
            }
        }
        self.reflect_state(true);
        Ok(())
    }

    pub fn close(&self) {
        self.reflect_state(false);
        let mut inner = self.inner.lock();
        if inner.state == Lifecycle::Opened {
            inner.state = Lifecycle::Closed;
        }
        self.cond.notify_all();
    }

    /* Universal recovery action: mark the device gone and unblock both
     * channel readers. Shutdown, not close — closing a descriptor that
     * another thread is still reading would race the descriptor number
     * being reused under it. The sockets are dropped only after both
     * reader threads have been joined. */
    pub fn disconnect(&self) {
        {
            let mut inner = self.inner.lock();
            inner.state = Lifecycle::Disconnected;
            self.cond.notify_all();
        }
        self.intr.shutdown();
        self.ctrl.shutdown();
    }

    /* Drive the controller's LEDs and activation to match the open
     * state: the unit's own LED, steady while opened and blinking while
     * closed, all four blinking when no character device exists. At
     * debug level 3 the controller keeps streaming while closed so the
     * interrupt traffic can be observed without an opener. */
    fn reflect_state(&self, opened: bool) {
        match self.unit() {
            /* Unit 0 is LED 1, like the first wired device. */
            Some(unit) => self.adapter.leds(self, 1 << (unit % 4), !opened),
            None => self.adapter.leds(self, 0xf, true),
        }
        let mode = if opened || self.debug > 2 {
            PowerMode::On
        } else {
            PowerMode::Off
        };
        self.adapter.activate(self, mode);
    }

    /* ---------------------------------------------------------------- */
    /* Reads and writes                                                   */
    /* ---------------------------------------------------------------- */

    /* Consume the buffered input report, blocking until one arrives
     * unless `nonblock`. A report buffered before a disconnect is still
     * delivered; only an empty slot reports end-of-file. */
    pub fn read(&self, buf: &mut [u8], nonblock: bool) -> ReadOutcome {
        let mut inner = self.inner.lock();
        loop {
            if inner.input_len != 0 {
                break;
            }
            if inner.state == Lifecycle::Disconnected || self.cancel.cancelled() {
                return ReadOutcome::Disconnected;
            }
            if nonblock {
                return ReadOutcome::Empty;
            }
            self.timed_wait(&mut inner);
        }
        let n = buf.len().min(inner.input_len);
        buf[..n].copy_from_slice(&inner.input[..n]);
        inner.input_len = 0;
        ReadOutcome::Data(n)
    }

    /* Poll probe: readable when a report is buffered or the device is
     * gone (the reader will then see EOF rather than block). */
    pub fn input_ready(&self) -> bool {
        let inner = self.inner.lock();
        inner.input_len != 0 || inner.state == Lifecycle::Disconnected
    }

    /* Send an output report on the interrupt channel. */
    pub fn write(&self, data: &[u8]) -> Result<(), Disconnected> {
        self.send_message(ChannelRole::Interrupt, proto::HDR_DATA_OUTPUT, data)
    }

    /* ---------------------------------------------------------------- */
    /* Control queries                                                    */
    /* ---------------------------------------------------------------- */

    /* Synchronous GET_REPORT. When the descriptor is numbered, `buf[0]`
     * carries the requested report ID on entry. Returns the number of
     * bytes copied into `buf`. */
    pub fn get_report(&self, kind: ReportKind, buf: &mut [u8]) -> Result<usize, ControlError> {
        let capacity = buf.len().min(MAX_REPORT_SIZE);
        /* Captured before the reply clobbers the buffer. */
        let id = if self.descriptor().numbered() && !buf.is_empty() {
            buf[0]
        } else {
            0
        };

        let mut inner = self.claim_query_slot()?;
        inner.query = Some(ControlQuery {
            kind: QueryKind::Get,
            report: kind,
            capacity,
            reply: Vec::new(),
            result: None,
            cancelled: false,
        });
        drop(inner);

        /* The Sixaxis requires the requested size in the message. */
        let request = [id, capacity as u8, (capacity >> 8) as u8];
        let payload = if self.descriptor().numbered() {
            &request[..]
        } else {
            &request[1..]
        };
        let sent = self
            .send_message(ChannelRole::Control, proto::get_report_header(kind), payload)
            .is_ok();

        let (code, reply) = self.await_reply(sent)?;
        match code {
            proto::HANDSHAKE_SUCCESSFUL => {
                let n = reply.len().min(buf.len());
                buf[..n].copy_from_slice(&reply[..n]);
                Ok(n)
            }
            proto::HANDSHAKE_NOT_READY => Err(ControlError::NotReady),
            code => Err(ControlError::Refused(code)),
        }
    }

    /* Synchronous SET_REPORT with the report body sent verbatim. */
    pub fn set_report(&self, kind: ReportKind, data: &[u8]) -> Result<(), ControlError> {
        let mut inner = self.claim_query_slot()?;
        inner.query = Some(ControlQuery {
            kind: QueryKind::Set,
            report: kind,
            capacity: 0,
            reply: Vec::new(),
            result: None,
            cancelled: false,
        });
        drop(inner);

        let sent = self
            .send_message(ChannelRole::Control, proto::set_report_header(kind), data)
            .is_ok();

        let (code, _) = self.await_reply(sent)?;
        match code {
            proto::HANDSHAKE_SUCCESSFUL => Ok(()),
            proto::HANDSHAKE_NOT_READY => Err(ControlError::NotReady),
            code => Err(ControlError::Refused(code)),
        }
    }

    /* At most one control query is in flight; later callers park here
     * until the slot frees up. */
    fn claim_query_slot(&self) -> Result<MutexGuard<'_, Inner>, ControlError> {
        let mut inner = self.inner.lock();
        loop {
            if inner.state == Lifecycle::Disconnected || self.cancel.cancelled() {
                return Err(ControlError::Disconnected);
            }
            if inner.query.is_none() {
                return Ok(inner);
            }
            self.timed_wait(&mut inner);
        }
    }

    /* Park until the control reader completes the installed query. On
     * cancellation the slot is marked and left in place: the reader
     * frees it when the stray reply arrives, and this caller must not
     * touch it again. */
    fn await_reply(&self, sent: bool) -> Result<(u8, Vec<u8>), ControlError> {
        let mut inner = self.inner.lock();
        while sent && inner.query.as_ref().is_some_and(|q| q.result.is_none()) {
            if inner.state == Lifecycle::Disconnected || self.cancel.cancelled() {
                if let Some(query) = inner.query.as_mut() {
                    query.cancelled = true;
                }
                return Err(ControlError::Disconnected);
            }
            self.timed_wait(&mut inner);
        }
        let query = inner.query.take();
        self.cond.notify_all();
        match query.and_then(|q| q.result.map(|code| (code, q.reply))) {
            Some(completed) => Ok(completed),
            /* Send failure; the device is already disconnected. */
            None => Err(ControlError::Disconnected),
        }
    }

    /* ---------------------------------------------------------------- */
    /* Channel readers                                                    */
    /* ---------------------------------------------------------------- */

    /* Control reader: matches replies to the in-flight query and
     * handles device-initiated control operations. Any transaction a
     * device must not send unsolicited is a protocol violation that
     * tears the session down. */
    pub(crate) fn ctrl_loop(&self) {
        let mut payload = vec![0u8; MAX_REPORT_SIZE];
        loop {
            let mut header = 0u8;
            let Ok(size) = self.recv_message(ChannelRole::Control, &mut header, &mut payload)
            else {
                break;
            };
            let unexpected = match CtrlTransaction::parse(header) {
                CtrlTransaction::Handshake { code } => !self.complete_handshake(code),
                CtrlTransaction::Data { .. } => !self.complete_data(&mut payload[..size]),
                CtrlTransaction::HidControl { op } => {
                    if op == proto::CONTROL_VIRTUAL_CABLE_UNPLUG {
                        /* TODO: erase the persistent pairing record once
                         * one exists; today the unplug only ends the
                         * session. */
                        info!("{}: virtual cable unplug by device", self.addr);
                        self.disconnect();
                    }
                    /* Shall ignore other operations. */
                    false
                }
                CtrlTransaction::Unexpected { .. } => true,
            };
            if unexpected {
                debug!(
                    "{}: unexpected control message {:#04x}, disconnecting",
                    self.addr, header
                );
                break;
            }
        }
        self.disconnect();
    }

    /* A HANDSHAKE completes whichever query is awaiting its reply;
     * without one it is a protocol violation (false). */
    fn complete_handshake(&self, code: u8) -> bool {
        let mut inner = self.inner.lock();
        let Some(mut query) = inner.query.take() else {
            return false;
        };
        if query.result.is_some() {
            inner.query = Some(query);
            return false;
        }
        if !query.cancelled {
            query.result = Some(code);
            /* No data delivered on a handshake reply. */
            query.reply.clear();
            inner.query = Some(query);
        }
        self.cond.notify_all();
        true
    }

    /* A DATA transaction answers a pending GET_REPORT. */
    fn complete_data(&self, payload: &mut [u8]) -> bool {
        let mut inner = self.inner.lock();
        let Some(mut query) = inner.query.take() else {
            return false;
        };
        if query.kind != QueryKind::Get || query.result.is_some() {
            inner.query = Some(query);
            return false;
        }
        if !query.cancelled {
            self.adapter.fixup_input(query.report, payload);
            let n = query.capacity.min(payload.len());
            query.reply.extend_from_slice(&payload[..n]);
            query.result = Some(proto::HANDSHAKE_SUCCESSFUL);
            inner.query = Some(query);
        }
        self.cond.notify_all();
        true
    }

    /* Interrupt reader: input reports freshen the latest-value slot
     * while the device is open and are dropped otherwise. */
    pub(crate) fn intr_loop(&self) {
        let mut payload = vec![0u8; MAX_REPORT_SIZE];
        loop {
            let mut header = 0u8;
            let Ok(size) = self.recv_message(ChannelRole::Interrupt, &mut header, &mut payload)
            else {
                break;
            };
            if header != proto::HDR_DATA_INPUT {
                debug!(
                    "{}: unexpected interrupt message {:#04x}, disconnecting",
                    self.addr, header
                );
                break;
            }
            let report = &mut payload[..size];
            self.adapter.fixup_input(ReportKind::Input, report);
            let mut inner = self.inner.lock();
            if inner.state == Lifecycle::Opened {
                /* One report of buffering is enough. Consumers treat
                 * input reports as snapshots of the current state, and
                 * a slow reader must never be left consuming stale
                 * reports from the back of a queue. */
                inner.input[..size].copy_from_slice(report);
                inner.input_len = size;
                self.cond.notify_one();
            }
        }
        self.disconnect();
    }

    /* ---------------------------------------------------------------- */
    /* Framing and diagnostics                                            */
    /* ---------------------------------------------------------------- */

    fn channel(&self, role: ChannelRole) -> &dyn HidChannel {
        match role {
            ChannelRole::Control => self.ctrl.as_ref(),
            ChannelRole::Interrupt => self.intr.as_ref(),
        }
    }

    fn send_message(
        &self,
        role: ChannelRole,
        header: u8,
        payload: &[u8],
    ) -> Result<(), Disconnected> {
        if self.debug > 0 {
            self.log_message(true, role, header, payload);
        }
        if let Err(e) = transport::send_transaction(self.channel(role), header, payload) {
            debug!(
                "{}: send on {} channel failed: {}",
                self.addr,
                role.name(),
                e
            );
            self.disconnect();
            return Err(Disconnected);
        }
        Ok(())
    }

    fn recv_message(
        &self,
        role: ChannelRole,
        header: &mut u8,
        payload: &mut [u8],
    ) -> Result<usize, Disconnected> {
        match transport::recv_transaction(self.channel(role), header, payload) {
            Ok(size) => {
                if self.debug > 0 {
                    self.log_message(false, role, *header, &payload[..size]);
                }
                Ok(size)
            }
            Err(e) => {
                debug!(
                    "{}: {} channel closed: {}",
                    self.addr,
                    role.name(),
                    e
                );
                self.disconnect();
                Err(Disconnected)
            }
        }
    }

    /* Transaction summary. The device mutex doubles as the output lock
     * so dumps from concurrent threads do not interleave; control
     * traffic always prints, interrupt traffic only its first
     * transaction per direction unless debugging harder. */
    fn log_message(&self, send: bool, role: ChannelRole, header: u8, payload: &[u8]) {
        let mut inner = self.inner.lock();
        let ctrl = role == ChannelRole::Control;
        let bit = 1u8 << u8::from(send);
        if ctrl || self.debug > 1 || inner.printed & bit == 0 {
            debug!(
                "{} {} {} message {:#04x} and {} bytes: {:02x?}",
                self.addr,
                if send { "sending" } else { "received" },
                role.name(),
                header,
                payload.len(),
                payload
            );
        }
        if !(ctrl || self.debug > 1) && inner.printed & bit == 0 {
            debug!("(use -dd to print subsequent interrupt messages)");
            inner.printed |= bit;
        }
    }

    fn timed_wait(&self, inner: &mut MutexGuard<'_, Inner>) {
        self.cond.wait_until(inner, Instant::now() + WAIT_QUANTUM);
    }

    /* ---------------------------------------------------------------- */
    /* Session worker                                                     */
    /* ---------------------------------------------------------------- */

    /* Run the session to completion: spawn both channel readers, issue
     * the initial activation and LED state, expose the character
     * device, then supervise the lifecycle until disconnect or the
     * closed-state inactivity timer fires. */
    pub fn run(self: Arc<Self>, chardev: &dyn CharDevHost, units: &UnitPool) -> Result<()> {
        let ctrl_reader = {
            let dev = Arc::clone(&self);
            thread::Builder::new()
                .name(format!("ctrl {}", self.addr))
                .spawn(move || dev.ctrl_loop())
                .context("Spawning control reader")?
        };
        let intr_reader = {
            let dev = Arc::clone(&self);
            thread::Builder::new()
                .name(format!("intr {}", self.addr))
                .spawn(move || dev.intr_loop())
                .context("Spawning interrupt reader")?
        };

        let unit = units.allocate();
        self.unit.store(unit as i32, Ordering::SeqCst);

        /* Our control traffic goes first, before a user can reach the
         * device. */
        self.reflect_state(false);

        let name = format!("{}{}", DEV_NAME_PREFIX, unit);
        let node = match chardev.create(&name, Arc::new(DeviceNode::new(Arc::clone(&self)))) {
            Ok(node) => {
                info!("{}: {} at {}", name, self.model(), self.addr);
                Some(node)
            }
            Err(e) => {
                warn!("{}: won't create character device: {e:#}", name);
                units.release(unit);
                self.unit.store(-1, Ordering::SeqCst);
                None
            }
        };

        let timed_out = self.supervise();

        drop(node);
        if let Some(unit) = self.unit() {
            units.release(unit);
            self.unit.store(-1, Ordering::SeqCst);
            info!("{}{} detached", DEV_NAME_PREFIX, unit);
        }

        if timed_out {
            /* Never opened within the configured window: park the
             * controller so it powers down instead of staying awake
             * forever, then end the session. */
            info!("{}: closed-state inactivity timeout, parking", self.addr);
            self.adapter.activate(&self, PowerMode::Parked);
            self.disconnect();
        }

        if ctrl_reader.join().is_err() || intr_reader.join().is_err() {
            bail!("Channel reader thread panicked");
        }
        Ok(())
    }

    /* Park until the device disconnects or the closed-state inactivity
     * timer expires. The timer is armed whenever the device sits in
     * Closed and disarmed by a successful open. */
    fn supervise(&self) -> bool {
        let mut inner = self.inner.lock();
        let mut deadline = Instant::now();
        loop {
            if inner.state == Lifecycle::Disconnected {
                return false;
            }
            if let Some(timeout) = self.idle_timeout {
                if !inner.timeout_armed && inner.state == Lifecycle::Closed {
                    inner.timeout_armed = true;
                    deadline = Instant::now() + timeout;
                }
            }
            if inner.timeout_armed {
                if self.cond.wait_until(&mut inner, deadline).timed_out() {
                    return true;
                }
            } else {
                self.cond.wait(&mut inner);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chardev::testing::RecordingChardev;
    use crate::sixaxis::SIXAXIS;
    use crate::transport::testing::MockChannel;
    use std::sync::atomic::AtomicBool;

    struct FlagProbe(AtomicBool);

    impl FlagProbe {
        fn new() -> Arc<FlagProbe> {
            Arc::new(FlagProbe(AtomicBool::new(false)))
        }

        fn set(&self, cancelled: bool) {
            self.0.store(cancelled, Ordering::SeqCst);
        }
    }

    impl CancelProbe for FlagProbe {
        fn cancelled(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Fixture {
        dev: Arc<Device>,
        ctrl: Arc<MockChannel>,
        intr: Arc<MockChannel>,
        probe: Arc<FlagProbe>,
    }

    fn fixture(auto_handshake: bool, idle_timeout: Option<Duration>) -> Fixture {
        let ctrl = Arc::new(if auto_handshake {
            MockChannel::with_auto_handshake()
        } else {
            MockChannel::new()
        });
        let intr = Arc::new(MockChannel::new());
        let probe = FlagProbe::new();
        let dev = Arc::new(Device::new(
            "11:22:33:44:55:66".parse().unwrap(),
            &SIXAXIS,
            Arc::clone(&ctrl) as Arc<dyn HidChannel>,
            Arc::clone(&intr) as Arc<dyn HidChannel>,
            0,
            idle_timeout,
            Arc::clone(&probe) as Arc<dyn CancelProbe>,
        ));
        Fixture {
            dev,
            ctrl,
            intr,
            probe,
        }
    }

    fn spawn_ctrl_reader(dev: &Arc<Device>) -> thread::JoinHandle<()> {
        let dev = Arc::clone(dev);
        thread::spawn(move || dev.ctrl_loop())
    }

    fn input_report(fill: u8) -> Vec<u8> {
        /* Short reports bypass the Sixaxis rewrite, which keeps the
         * payload comparisons literal. */
        let mut datagram = vec![proto::HDR_DATA_INPUT];
        datagram.extend_from_slice(&[fill; 8]);
        datagram
    }

    #[test]
    fn latest_value_buffering() {
        let f = fixture(true, None);
        let reader = spawn_ctrl_reader(&f.dev);
        f.dev.open().unwrap();

        for fill in 1..=5 {
            f.intr.push(&input_report(fill));
        }
        f.intr.shutdown();
        f.dev.intr_loop();

        let mut buf = [0u8; 16];
        assert_eq!(f.dev.read(&mut buf, false), ReadOutcome::Data(8));
        assert_eq!(&buf[..8], &[5u8; 8], "only the newest report survives");
        /* Slot consumed and the device is gone: EOF. */
        assert_eq!(f.dev.read(&mut buf, false), ReadOutcome::Disconnected);
        reader.join().unwrap();
    }

    #[test]
    fn reports_dropped_while_closed() {
        let f = fixture(true, None);
        f.intr.push(&input_report(9));
        f.intr.shutdown();
        f.dev.intr_loop();

        assert!(f.dev.is_disconnected());
        let mut buf = [0u8; 16];
        assert_eq!(f.dev.read(&mut buf, false), ReadOutcome::Disconnected);
    }

    #[test]
    fn nonblocking_read_on_empty_slot() {
        let f = fixture(true, None);
        let reader = spawn_ctrl_reader(&f.dev);
        f.dev.open().unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(f.dev.read(&mut buf, true), ReadOutcome::Empty);
        assert!(!f.dev.input_ready());

        f.dev.disconnect();
        assert!(f.dev.input_ready(), "poll reports readable after disconnect");
        reader.join().unwrap();
    }

    #[test]
    fn open_close_transitions() {
        let f = fixture(true, None);
        let reader = spawn_ctrl_reader(&f.dev);

        f.dev.open().unwrap();
        assert_eq!(f.dev.open(), Err(OpenError::Busy));
        f.dev.close();
        f.dev.open().unwrap();

        f.dev.disconnect();
        assert_eq!(f.dev.open(), Err(OpenError::Disconnected));
        reader.join().unwrap();
    }

    #[test]
    fn disconnect_absorbs() {
        let f = fixture(false, None);
        f.dev.disconnect();
        assert!(f.dev.is_disconnected());
        assert!(f.ctrl.is_closed() && f.intr.is_closed());

        assert_eq!(f.dev.open(), Err(OpenError::Disconnected));
        let mut buf = [0u8; 8];
        assert_eq!(f.dev.read(&mut buf, false), ReadOutcome::Disconnected);
        assert_eq!(f.dev.write(&[1, 2]), Err(Disconnected));
        assert_eq!(
            f.dev.get_report(ReportKind::Input, &mut buf),
            Err(ControlError::Disconnected)
        );
        assert_eq!(
            f.dev.set_report(ReportKind::Output, &[0]),
            Err(ControlError::Disconnected)
        );
        assert!(f.dev.is_disconnected());
    }

    #[test]
    fn write_sends_output_data_transaction() {
        let f = fixture(false, None);
        f.dev.write(&[0x01, 0x02]).unwrap();
        assert_eq!(f.intr.sent(), vec![vec![0xa2, 0x01, 0x02]]);

        f.intr.shutdown();
        assert_eq!(f.dev.write(&[0x03]), Err(Disconnected));
        assert!(f.dev.is_disconnected());
    }

    #[test]
    fn get_report_request_and_data_reply() {
        let f = fixture(false, None);
        let reader = spawn_ctrl_reader(&f.dev);

        let caller = {
            let dev = Arc::clone(&f.dev);
            thread::spawn(move || {
                let mut buf = [0u8; 49];
                buf[0] = 1;
                let r = dev.get_report(ReportKind::Input, &mut buf);
                (r, buf)
            })
        };

        /* Request carries the report ID and the 49-byte maximum. */
        let sent = f.ctrl.wait_sent(1);
        assert_eq!(sent[0], vec![0x49, 0x01, 49, 0x00]);

        let mut reply = vec![0xa1];
        reply.extend_from_slice(&[0u8; 49]);
        reply[1] = 0x01;
        f.ctrl.push(&reply);

        let (result, buf) = caller.join().unwrap();
        assert_eq!(result, Ok(49));
        assert_eq!(buf[0], 0x01);
        /* The reply went through the input rewrite: an idle D-pad reads
         * as a centered hat. */
        assert_eq!(buf[5], 0xf0);

        f.ctrl.shutdown();
        reader.join().unwrap();
    }

    #[test]
    fn set_report_handshake_codes() {
        let f = fixture(false, None);
        let reader = spawn_ctrl_reader(&f.dev);

        for (i, (code, expected)) in [
            (proto::HANDSHAKE_SUCCESSFUL, Ok(())),
            (proto::HANDSHAKE_NOT_READY, Err(ControlError::NotReady)),
            (0x04, Err(ControlError::Refused(4))),
        ]
        .into_iter()
        .enumerate()
        {
            let caller = {
                let dev = Arc::clone(&f.dev);
                thread::spawn(move || dev.set_report(ReportKind::Feature, &[0xf4, 0x42, 1, 0, 0]))
            };
            let sent = f.ctrl.wait_sent(i + 1);
            assert_eq!(
                sent.last().unwrap(),
                &vec![0x53, 0xf4, 0x42, 1, 0, 0],
                "SET_REPORT(feature) header and verbatim body"
            );
            f.ctrl.push(&[code]);
            assert_eq!(caller.join().unwrap(), expected);
        }

        f.ctrl.shutdown();
        reader.join().unwrap();
    }

    #[test]
    fn led_blink_sends_reset_then_pattern() {
        let f = fixture(true, None);
        let reader = spawn_ctrl_reader(&f.dev);

        SIXAXIS.leds(&f.dev, 0b1010, true);

        let sent = f.ctrl.wait_sent(2);
        assert_eq!(sent.len(), 2);
        for message in &sent {
            assert_eq!(message[0], 0x52, "SET_REPORT(output)");
            assert_eq!(message.len(), 1 + 36);
            assert_eq!(message[1], 0x01);
            assert_eq!(message[11], 0b1010 << 1, "bitmap at byte 10");
        }
        /* First the resync report with every timer zeroed, then the
         * blink cadence for LEDs 2 and 4. */
        assert!(sent[0][12..].iter().all(|&b| b == 0));
        assert_eq!(&sent[1][22..27], &[0xff, 0x27, 0x10, 99, 1]);
        assert_eq!(&sent[1][12..17], &[0xff, 0x27, 0x10, 99, 1]);

        f.ctrl.shutdown();
        reader.join().unwrap();
    }

    #[test]
    fn single_query_in_flight() {
        let f = fixture(false, None);
        let reader = spawn_ctrl_reader(&f.dev);

        let spawn_set = |body: u8| {
            let dev = Arc::clone(&f.dev);
            thread::spawn(move || dev.set_report(ReportKind::Output, &[body]))
        };
        let first = spawn_set(0xaa);
        let second = spawn_set(0xbb);

        /* Exactly one request reaches the wire until its reply lands. */
        f.ctrl.wait_sent(1);
        thread::sleep(Duration::from_millis(250));
        assert_eq!(f.ctrl.sent_count(), 1);

        f.ctrl.push(&[proto::HANDSHAKE_SUCCESSFUL]);
        f.ctrl.wait_sent(2);
        f.ctrl.push(&[proto::HANDSHAKE_SUCCESSFUL]);

        first.join().unwrap().unwrap();
        second.join().unwrap().unwrap();

        let mut bodies: Vec<u8> = f.ctrl.sent().iter().map(|m| m[1]).collect();
        bodies.sort_unstable();
        assert_eq!(bodies, vec![0xaa, 0xbb]);

        f.ctrl.shutdown();
        reader.join().unwrap();
    }

    #[test]
    fn stray_handshake_disconnects() {
        let f = fixture(false, None);
        let reader = spawn_ctrl_reader(&f.dev);

        f.ctrl.push(&[proto::HANDSHAKE_SUCCESSFUL]);
        reader.join().unwrap();
        assert!(f.dev.is_disconnected());
        assert!(f.ctrl.is_closed() && f.intr.is_closed());
    }

    #[test]
    fn virtual_cable_unplug_disconnects() {
        let f = fixture(false, None);
        let reader = spawn_ctrl_reader(&f.dev);

        f.ctrl.push(&[0x15]);
        reader.join().unwrap();
        assert!(f.dev.is_disconnected());
    }

    #[test]
    fn unexpected_interrupt_header_disconnects() {
        let f = fixture(false, None);
        f.intr.push(&[0xa2, 0x00]);
        f.dev.intr_loop();
        assert!(f.dev.is_disconnected());
    }

    #[test]
    fn cancelled_caller_buffer_is_left_alone() {
        let f = fixture(false, None);
        let reader = spawn_ctrl_reader(&f.dev);

        let caller = {
            let dev = Arc::clone(&f.dev);
            thread::spawn(move || {
                let mut buf = [0xee_u8; 49];
                buf[0] = 1;
                let r = dev.get_report(ReportKind::Input, &mut buf);
                (r, buf)
            })
        };
        f.ctrl.wait_sent(1);

        /* The peer walks away from the upcall before the reply lands. */
        f.probe.set(true);
        let (result, buf) = caller.join().unwrap();
        assert_eq!(result, Err(ControlError::Disconnected));
        assert_eq!(buf[0], 1);
        assert!(buf[1..].iter().all(|&b| b == 0xee), "buffer untouched");

        /* The late reply frees the slot instead of completing it, so a
         * fresh query can go out. */
        f.probe.set(false);
        let mut reply = vec![0xa1];
        reply.extend_from_slice(&[0u8; 49]);
        f.ctrl.push(&reply);

        let caller = {
            let dev = Arc::clone(&f.dev);
            thread::spawn(move || {
                let mut buf = [0u8; 49];
                buf[0] = 1;
                dev.get_report(ReportKind::Input, &mut buf)
            })
        };
        f.ctrl.wait_sent(2);
        let mut reply = vec![0xa1];
        reply.extend_from_slice(&[0u8; 49]);
        reply[1] = 0x01;
        f.ctrl.push(&reply);
        assert_eq!(caller.join().unwrap(), Ok(49));

        f.ctrl.shutdown();
        reader.join().unwrap();
    }

    #[test]
    fn inactivity_timeout_parks_and_tears_down() {
        let f = fixture(true, Some(Duration::from_millis(300)));
        let chardev = RecordingChardev::new(Arc::clone(&f.ctrl));
        let units = UnitPool::new();

        let worker = {
            let dev = Arc::clone(&f.dev);
            let chardev = chardev.clone();
            thread::spawn(move || dev.run(chardev.as_ref(), &units).unwrap())
        };
        worker.join().unwrap();

        assert!(f.dev.is_disconnected());
        let sent = f.ctrl.sent();
        let park = vec![0x53, 0xf4, 0x42, 8, 0, 0];
        assert!(sent.contains(&park), "parked activation must be sent");

        /* The initial off-activation went out before the node was
         * advertised. */
        let created = chardev.created();
        assert_eq!(created.len(), 1);
        let (name, sent_at_create) = &created[0];
        assert_eq!(name, "btsixa0");
        let off = vec![0x53, 0xf4, 0x42, 1, 0, 0];
        assert!(
            sent_at_create.contains(&off),
            "activation precedes the character device"
        );
    }

    #[test]
    fn session_worker_full_lifecycle() {
        let f = fixture(true, None);
        let chardev = RecordingChardev::new(Arc::clone(&f.ctrl));
        let units = UnitPool::new();

        let worker = {
            let dev = Arc::clone(&f.dev);
            let chardev = chardev.clone();
            thread::spawn(move || dev.run(chardev.as_ref(), &units).unwrap())
        };

        /* Wait for the device to come up, then drive open/close through
         * its lifetime and let the peer disappear. */
        chardev.wait_created(1);
        assert_eq!(f.dev.unit(), Some(0));

        f.dev.open().unwrap();
        f.intr.push(&input_report(7));
        let mut buf = [0u8; 16];
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match f.dev.read(&mut buf, true) {
                ReadOutcome::Data(8) => break,
                _ if Instant::now() > deadline => panic!("input never arrived"),
                _ => thread::sleep(Duration::from_millis(5)),
            }
        }
        f.dev.close();

        f.ctrl.shutdown();
        f.intr.shutdown();
        worker.join().unwrap();
        assert!(f.dev.is_disconnected());
        assert_eq!(f.dev.unit(), None, "unit released at teardown");
    }
}
