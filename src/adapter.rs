/* Device adapter framework: the capability set each supported gamepad
 * model implements, PnP identity matching, and the SDP lookup seam.
 *
 * There is exactly one adapter today (the Sixaxis), but the transport
 * core only ever talks to the trait, so further models slot in without
 * touching the session machinery. */

use anyhow::Result;

use crate::addr::BdAddr;
use crate::device::Device;
use crate::proto::ReportKind;
use crate::sixaxis;

/* ------------------------------------------------------------------ */
/* Report descriptor record                                             */
/* ------------------------------------------------------------------ */

/* A fixed HID report descriptor served in place of whatever the peer
 * offers over the air, which is unauthenticated and potentially
 * corrupt. */
pub struct ReportDescriptor {
    pub bytes: &'static [u8],
    /* First report ID, or 0 when the wire protocol carries reports
     * without an ID prefix. Doubles as the has-IDs flag. */
    pub first_id: u8,
}

impl ReportDescriptor {
    pub fn numbered(&self) -> bool {
        self.first_id != 0
    }
}

/* ------------------------------------------------------------------ */
/* Activation                                                           */
/* ------------------------------------------------------------------ */

/* Power states a controller can be driven into. `Parked` tells an idle
 * controller to power down instead of staying awake forever. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Off,
    On,
    Parked,
}

/* ------------------------------------------------------------------ */
/* Capability set                                                       */
/* ------------------------------------------------------------------ */

/* Everything model-specific the transport core needs: a fixed
 * descriptor, the activation sequence, an LED pattern, and the input
 * report rewrite. Methods that talk to the controller go through the
 * device's control protocol and may block like any other caller. */
pub trait HidAdapter: Send + Sync {
    fn model(&self) -> &'static str;

    fn descriptor(&self) -> &'static ReportDescriptor;

    /* Issue the vendor activation sequence. Must run before any input
     * report is expected and on every open/close transition. */
    fn activate(&self, dev: &Device, mode: PowerMode);

    /* Drive the LED bitmap, steady or blinking. */
    fn leds(&self, dev: &Device, bitmap: u8, blink: bool);

    /* Rewrite a report received from the controller in place. Applied
     * to interrupt input reports and to GET_REPORT data replies. */
    fn fixup_input(&self, kind: ReportKind, data: &mut [u8]);
}

/* ------------------------------------------------------------------ */
/* PnP identity and matching                                            */
/* ------------------------------------------------------------------ */

/* Vendor-ID source value meaning "USB Implementers Forum", per the
 * Device ID profile; the Sixaxis reports its USB identity this way. */
pub const VENDOR_ID_SOURCE_USB: u16 = 0x0002;

pub const SONY_VENDOR_ID: u16 = 0x054c;
pub const SIXAXIS_PRODUCT_ID: u16 = 0x0268;

/* PnP attributes from the peer's Device ID service record. */
#[derive(Debug, Clone, Copy, Default)]
pub struct PnpInfo {
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
    pub source: u16,
}

/* Match a discovered peer to its adapter; `None` means an unsupported
 * device the session worker drops on the floor. */
pub fn match_adapter(info: &PnpInfo) -> Option<&'static dyn HidAdapter> {
    if info.source == VENDOR_ID_SOURCE_USB
        && info.vendor == SONY_VENDOR_ID
        && info.product == SIXAXIS_PRODUCT_ID
    {
        Some(&sixaxis::SIXAXIS)
    } else {
        None
    }
}

/* ------------------------------------------------------------------ */
/* SDP seam                                                             */
/* ------------------------------------------------------------------ */

/* Vendor/product discovery is an external collaborator: the session
 * worker hands it a peer address and gets PnP attributes back. */
pub trait SdpLookup: Send + Sync {
    fn pnp_info(&self, addr: BdAddr) -> Result<PnpInfo>;
}

/* Fixed answer for every peer. Stands in until a real SDP client is
 * wired up; useless for telling controllers apart, but this daemon only
 * ever admits the one model anyway. */
pub struct FixedPnp(pub PnpInfo);

impl FixedPnp {
    pub fn sixaxis() -> FixedPnp {
        FixedPnp(PnpInfo {
            vendor: SONY_VENDOR_ID,
            product: SIXAXIS_PRODUCT_ID,
            version: 0x0100,
            source: VENDOR_ID_SOURCE_USB,
        })
    }
}

impl SdpLookup for FixedPnp {
    fn pnp_info(&self, _addr: BdAddr) -> Result<PnpInfo> {
        Ok(self.0)
    }
}
