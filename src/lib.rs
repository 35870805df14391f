/* btsixad: bridge Bluetooth Sony Sixaxis gamepads to character devices
 * that behave like wired USB HID devices.
 *
 * A controller opens two L2CAP channels; the session assembler in
 * `host` pairs them, the state machine in `device` couples both streams
 * with the file interface in `chardev`, and the `sixaxis` adapter
 * supplies the model-specific descriptor, activation and report
 * rewrites. */

pub mod adapter;
pub mod addr;
pub mod chardev;
pub mod device;
pub mod host;
pub mod l2cap;
pub mod proto;
pub mod sixaxis;
pub mod transport;
