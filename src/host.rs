/* Session assembler: pairs the two L2CAP channels a controller opens
 * (control PSM 0x11, interrupt PSM 0x13) by peer address and spawns one
 * session worker per completed pair.
 *
 * A global table keyed by address holds each peer's channel slots. The
 * first accepted channel creates the entry, a duplicate of an occupied
 * slot is rejected outright, and the arrival of the opposite channel is
 * the unique point at which both halves exist — the worker is spawned
 * there and removes the entry when the session ends. */

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::adapter::{self, HidAdapter, SdpLookup};
use crate::addr::BdAddr;
use crate::chardev::{CharDevHost, UnitPool};
use crate::device::Device;
use crate::l2cap::{L2capListener, PSM_HID_CONTROL, PSM_HID_INTERRUPT};
use crate::transport::{ChannelRole, HidChannel};

#[derive(Debug, Clone)]
pub struct Config {
    /* Local adapter address both listeners bind to. */
    pub bdaddr: BdAddr,
    /* Diagnostic verbosity, the -d count. */
    pub debug: u8,
    /* Closed-state inactivity timeout; None disables it. */
    pub idle_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            bdaddr: BdAddr::ANY,
            debug: 0,
            idle_timeout: None,
        }
    }
}

enum ChannelSlot {
    Vacant,
    Pending(Arc<dyn HidChannel>),
    /* Handed to a running session worker. */
    Claimed,
}

impl ChannelSlot {
    fn is_vacant(&self) -> bool {
        matches!(self, ChannelSlot::Vacant)
    }
}

struct SessionEntry {
    ctrl: ChannelSlot,
    intr: ChannelSlot,
}

impl SessionEntry {
    fn new() -> SessionEntry {
        SessionEntry {
            ctrl: ChannelSlot::Vacant,
            intr: ChannelSlot::Vacant,
        }
    }

    fn slot_mut(&mut self, role: ChannelRole) -> &mut ChannelSlot {
        match role {
            ChannelRole::Control => &mut self.ctrl,
            ChannelRole::Interrupt => &mut self.intr,
        }
    }

    /* Claim both channels if this is the moment both are present. */
    fn take_pair(&mut self) -> Option<(Arc<dyn HidChannel>, Arc<dyn HidChannel>)> {
        if !matches!(self.ctrl, ChannelSlot::Pending(_))
            || !matches!(self.intr, ChannelSlot::Pending(_))
        {
            return None;
        }
        let ChannelSlot::Pending(ctrl) = std::mem::replace(&mut self.ctrl, ChannelSlot::Claimed)
        else {
            return None;
        };
        let ChannelSlot::Pending(intr) = std::mem::replace(&mut self.intr, ChannelSlot::Claimed)
        else {
            return None;
        };
        Some((ctrl, intr))
    }
}

struct Shared {
    config: Config,
    sdp: Box<dyn SdpLookup>,
    chardev: Arc<dyn CharDevHost>,
    units: UnitPool,
    sessions: Mutex<HashMap<BdAddr, SessionEntry>>,
}

/* Cheap handle over the daemon state; clones share everything. Worker
 * threads each carry their own clone. */
#[derive(Clone)]
pub struct Daemon {
    shared: Arc<Shared>,
}

impl Daemon {
    pub fn new(config: Config, sdp: Box<dyn SdpLookup>, chardev: Arc<dyn CharDevHost>) -> Daemon {
        Daemon {
            shared: Arc::new(Shared {
                config,
                sdp,
                chardev,
                units: UnitPool::new(),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /* Bind both listeners and serve forever. Only returns on a fatal
     * initialisation failure. */
    pub fn run(&self) -> Result<()> {
        let ctrl_listener = L2capListener::bind(self.shared.config.bdaddr, PSM_HID_CONTROL)
            .context("Binding HID control listener")?;
        let intr_listener = L2capListener::bind(self.shared.config.bdaddr, PSM_HID_INTERRUPT)
            .context("Binding HID interrupt listener")?;
        info!(
            "listening on {} (control PSM {:#04x}, interrupt PSM {:#04x})",
            self.shared.config.bdaddr, PSM_HID_CONTROL, PSM_HID_INTERRUPT
        );

        let mut acceptors = Vec::new();
        for (role, listener) in [
            (ChannelRole::Control, ctrl_listener),
            (ChannelRole::Interrupt, intr_listener),
        ] {
            let daemon = self.clone();
            let acceptor = thread::Builder::new()
                .name(format!("accept {}", role.name()))
                .spawn(move || daemon.accept_loop(role, listener))
                .context("Spawning accept loop")?;
            acceptors.push(acceptor);
        }
        for acceptor in acceptors {
            if acceptor.join().is_err() {
                anyhow::bail!("Accept loop panicked");
            }
        }
        Ok(())
    }

    /* One accept loop per listening socket. An accept failure is fatal
     * for the daemon; everything session-level recovers per session. */
    fn accept_loop(self, role: ChannelRole, listener: L2capListener) {
        loop {
            match listener.accept() {
                Ok((socket, addr)) => self.attach(role, addr, Arc::new(socket)),
                Err(e) => {
                    error!("accept() failed on {} listener: {}", role.name(), e);
                    std::process::exit(1);
                }
            }
        }
    }

    /* Route a freshly accepted channel into the session table; spawn
     * the session worker at the unique moment both halves are
     * present. */
    pub fn attach(&self, role: ChannelRole, addr: BdAddr, channel: Arc<dyn HidChannel>) {
        let mut sessions = self.shared.sessions.lock();
        debug!("connection from {} on {} channel", addr, role.name());

        let entry = sessions.entry(addr).or_insert_with(SessionEntry::new);
        if !entry.slot_mut(role).is_vacant() {
            /* This peer already has that channel. */
            debug!("{}: duplicate {} channel, rejecting", addr, role.name());
            channel.shutdown();
            return;
        }
        *entry.slot_mut(role) = ChannelSlot::Pending(channel);

        if let Some((ctrl, intr)) = entry.take_pair() {
            let daemon = self.clone();
            let worker = thread::Builder::new()
                .name(format!("session {addr}"))
                .spawn(move || daemon.run_session(addr, ctrl, intr));
            if let Err(e) = worker {
                error!("Spawning session worker failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    /* Session worker: classify the peer, run the device to completion,
     * then drop the table entry. The channels close when the last
     * reference is dropped here, after every thread using them has been
     * joined. */
    fn run_session(self, addr: BdAddr, ctrl: Arc<dyn HidChannel>, intr: Arc<dyn HidChannel>) {
        match self.classify(addr) {
            Some(adapter) => {
                let dev = Arc::new(Device::new(
                    addr,
                    adapter,
                    ctrl,
                    intr,
                    self.shared.config.debug,
                    self.shared.config.idle_timeout,
                    self.shared.chardev.cancel_probe(),
                ));
                if let Err(e) = dev.run(self.shared.chardev.as_ref(), &self.shared.units) {
                    error!("Fatal session failure for {}: {e:#}", addr);
                    std::process::exit(1);
                }
            }
            None => {
                ctrl.shutdown();
                intr.shutdown();
            }
        }

        self.shared.sessions.lock().remove(&addr);
        info!("connection from {} closed", addr);
    }

    /* SDP lookup plus adapter matching; unsupported peers get their
     * session dropped without a device. */
    fn classify(&self, addr: BdAddr) -> Option<&'static dyn HidAdapter> {
        let info = match self.shared.sdp.pnp_info(addr) {
            Ok(info) => info,
            Err(e) => {
                warn!("{}: SDP lookup failed: {e:#}", addr);
                return None;
            }
        };
        let adapter = adapter::match_adapter(&info);
        debug!(
            "connection is from {}: vendor {:#06x} (by {:#06x}), product {:#06x}, release {:#06x}",
            adapter.map_or("unknown device", |a| a.model()),
            info.vendor,
            info.source,
            info.product,
            info.version
        );
        adapter
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.shared.sessions.lock().len()
    }
}
