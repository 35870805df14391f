/* Sony Sixaxis adapter: fixed report descriptor, vendor activation,
 * LED timers, and the input-report rewrite.
 *
 * The descriptor is simplified and served in place of the one the
 * controller offers over the air, which is unauthenticated and
 * potentially corrupt. Semantics are altered somewhat: all buttons have
 * force sensors but only L2/R2 are mapped as axes (Wheel/Slider), and
 * the three tilt axes are left unmapped.
 *
 * Buttons are reshuffled programmatically so they are useful without
 * extra configuration: the report's multibyte values are big-endian
 * while USB expects little-endian, so the face-button order is
 * effectively reversed on the wire. Renumbering in the descriptor is
 * not enough because common consumers ignore the numbering, so the
 * reshuffled values are placed in padding and reading the report with
 * the original layout still works. The D-pad cannot physically be
 * pressed in opposite directions and is converted to a hat. */

use crate::adapter::{HidAdapter, PowerMode, ReportDescriptor};
use crate::device::Device;
use crate::proto::ReportKind;

/* Input reports are fixed-size; anything else passes through untouched. */
pub const INPUT_REPORT_SIZE: usize = 49;
/* Output and feature reports are 48 bytes as declared below. */
pub const OUTPUT_REPORT_SIZE: usize = 48;

static DESCRIPTOR_BYTES: [u8; 148] = [
    0x05, 0x01, //       Usage Page (Generic Desktop)
    0x09, 0x05, //       Usage (Gamepad)
    0xa1, 0x01, //       Collection (Application)
    0x85, 0x01, //           Report ID (1)
    0x15, 0x00, //           Logical Minimum (0)
    0x25, 0x01, //           Logical Maximum (1)
    0x75, 0x01, //           Report Size (1)
    0x95, 0x14, //           Report Count (20)
    0x81, 0x01, //           Input (Const)
    //                       - 8 bits original padding
    //                       - 12 shuffled-away buttons
    0x05, 0x09, //           Usage Page (Button)
    0x19, 0x01, //           Usage Minimum (Button 1)
    0x29, 0x04, //           Usage Maximum (Button 4)
    0x95, 0x04, //           Report Count (4)
    0x81, 0x02, //           Input (Data, Variable, Absolute)
    //                       - X, O, Square, Triangle reshuffled in place
    0x81, 0x01, //           Input (Const)
    //                       - 3 shuffled-away buttons (1 soldered) and padding
    0x19, 0x05, //           Usage Minimum (Button 5)
    0x29, 0x0b, //           Usage Maximum (Button 11)
    0x95, 0x07, //           Report Count (7)
    0x81, 0x02, //           Input (Data, Variable, Absolute)
    //                       - reshuffled buttons
    0x95, 0x01, //           Report Count (1)
    0x81, 0x01, //           Input (Const)
    0x05, 0x01, //           Usage Page (Generic Desktop)
    0x09, 0x39, //           Usage (Hat Switch)
    0x15, 0x00, //           Logical Minimum (0)
    0x25, 0x07, //           Logical Maximum (7)
    0x35, 0x00, //           Physical Minimum (0)
    0x46, 0x3b, 0x01, //     Physical Maximum (315)
    0x65, 0x14, //           Unit (Degrees)
    0x75, 0x04, //           Report Size (4)
    0x81, 0x42, //           Input (Data, Variable, Absolute, Null State)
    //                       - converted D-pad
    0x65, 0x00, //           Unit (None)
    0x09, 0x01, //           Usage (Pointer)
    0xa1, 0x00, //           Collection (Physical)
    0x09, 0x30, //               Usage (X)
    0x09, 0x31, //               Usage (Y)
    0x15, 0x00, //               Logical Minimum (0)
    0x26, 0xff, 0x00, //         Logical Maximum (255)
    0x35, 0x80, //               Physical Minimum (-128)
    0x45, 0x7f, //               Physical Maximum (127)
    0x75, 0x08, //               Report Size (8)
    0x95, 0x02, //               Report Count (2)
    0x81, 0x02, //               Input (Data, Variable, Absolute)
    0xc0, //                 End Collection
    0x09, 0x01, //           Usage (Pointer)
    0xa1, 0x00, //           Collection (Physical)
    0x09, 0x33, //               Usage (Rx) [not X]
    0x09, 0x34, //               Usage (Ry) [not Y]
    0x81, 0x02, //               Input (Data, Variable, Absolute)
    0xc0, //                 End Collection
    0x95, 0x08, //           Report Count (8)
    0x81, 0x01, //           Input (Const)
    0x09, 0x38, //           Usage (Wheel) [not second Slider]
    0x09, 0x36, //           Usage (Slider)
    0x35, 0x00, //           Physical Minimum (0)
    0x46, 0xff, 0x00, //     Physical Maximum (255)
    0x95, 0x02, //           Report Count (2)
    0x81, 0x02, //           Input (Data, Variable, Absolute)
    //                       - L2, R2
    0x45, 0x00, //           Physical Maximum (0)
    0x95, 0x1d, //           Report Count (29)
    0x81, 0x01, //           Input (Const)
    0x15, 0x00, //           Logical Minimum (0)
    0x26, 0xff, 0x00, //     Logical Maximum (255)
    0x75, 0x08, //           Report Size (8)
    0x95, 0x30, //           Report Count (48)
    0x09, 0x01, //           Usage (Pointer)
    0x91, 0x02, //           Output (Data, Variable, Absolute)
    0x15, 0x00, //           Logical Minimum (0)
    0x26, 0xff, 0x00, //     Logical Maximum (255)
    0x75, 0x08, //           Report Size (8)
    0x95, 0x30, //           Report Count (48)
    0x09, 0x01, //           Usage (Pointer)
    0xb1, 0x02, //           Feature (Data, Variable, Absolute)
    0xc0, //             End Collection
];

pub static SIXAXIS_DESCRIPTOR: ReportDescriptor = ReportDescriptor {
    bytes: &DESCRIPTOR_BYTES,
    first_id: 1,
};

/* D-pad bitmask (Up | Right<<1 | Down<<2 | Left<<3) to hat direction;
 * impossible combinations map to 15 (centered / null state). */
static HAT: [u8; 16] = [15, 0, 2, 1, 4, 15, 3, 15, 6, 7, 15, 15, 5, 15, 15, 15];

/* ------------------------------------------------------------------ */
/* Report builders                                                      */
/* ------------------------------------------------------------------ */

/* Activation feature report. The controller will not stream input
 * until it has seen v=3; v=8 parks it so it powers down. */
fn operational_report(mode: PowerMode) -> [u8; 5] {
    let v = match mode {
        PowerMode::Off => 1,
        PowerMode::On => 3,
        PowerMode::Parked => 8,
    };
    [0xf4, 0x42, v, 0x00, 0x00]
}

/* LED output report skeleton: first byte 0x01, LED bitmap at byte 10
 * shifted left by one bit, all four timers zeroed. */
fn led_base_report(bitmap: u8) -> [u8; 36] {
    let mut report = [0u8; 36];
    report[0] = 0x01;
    report[10] = bitmap << 1;
    report
}

/* Each LED timer is controlled by 5 bytes:
 * - duration in 20 ms increments (0 = off, 0xff = forever)
 * - 2-byte big-endian tick length in 1 us increments
 * - off time in ticks
 * - on time in ticks */
fn led_pattern_report(bitmap: u8, blink: bool) -> [u8; 36] {
    let mut report = led_base_report(bitmap);
    for i in 0..4 {
        if bitmap & (1 << i) != 0 {
            let timer = &mut report[26 - 5 * i..26 - 5 * i + 5];
            timer[0] = 0xff;
            if blink {
                timer[1] = 0x27; // 10 ms tick
                timer[2] = 0x10;
                timer[3] = 99; // 990 ms off
                timer[4] = 1; // 10 ms on
            } else {
                timer[1] = 0x80; // continuously on
                timer[4] = 0x80;
            }
        }
    }
    report
}

/* ------------------------------------------------------------------ */
/* Adapter                                                              */
/* ------------------------------------------------------------------ */

pub struct SixaxisAdapter;

pub static SIXAXIS: SixaxisAdapter = SixaxisAdapter;

impl HidAdapter for SixaxisAdapter {
    fn model(&self) -> &'static str {
        "Sixaxis gamepad"
    }

    fn descriptor(&self) -> &'static ReportDescriptor {
        &SIXAXIS_DESCRIPTOR
    }

    fn activate(&self, dev: &Device, mode: PowerMode) {
        /* A failed set_report has already moved the device to
         * Disconnected; nothing further to do with the result. */
        let _ = dev.set_report(ReportKind::Feature, &operational_report(mode));
    }

    fn leds(&self, dev: &Device, bitmap: u8, blink: bool) {
        if blink {
            /* Sync all timers by switching them off first. */
            let _ = dev.set_report(ReportKind::Output, &led_base_report(bitmap));
        }
        let _ = dev.set_report(ReportKind::Output, &led_pattern_report(bitmap, blink));
    }

    fn fixup_input(&self, kind: ReportKind, data: &mut [u8]) {
        if kind != ReportKind::Input || data.len() != INPUT_REPORT_SIZE || data[0] != 1 {
            return;
        }
        let (b2, b3, b4) = (data[2], data[3], data[4]);
        data[3] = (b3 & 0x0f)          // lower nibble
            | (b3 >> 3 & 0x10)         // Square
            | (b3 >> 1 & 0x20)         // X
            | (b3 << 1 & 0x40)         // O
            | (b3 << 3 & 0x80); //        Triangle
        data[4] = (b4 & 0x0f)          // lower nibble
            | (b3 << 1 & 0x10)         // R1
            | (b3 << 3 & 0x20)         // L1
            | (b2 << 4 & 0x40)         // R3
            | (b2 << 6 & 0x80); //        L3
        data[5] = (b2 >> 3 & 0x01)     // Start
            | (b2 << 1 & 0x02)         // Select
            | (b4 << 2 & 0x04)         // PS
            | (HAT[(b2 >> 4) as usize] << 4); // D-pad
    }
}
