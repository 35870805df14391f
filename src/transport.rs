/* One L2CAP channel and the framing of a single HID transaction on it.
 *
 * The socket layer is seq-packet, so one send/receive moves exactly one
 * transaction: a 1-byte header plus payload, gathered/scattered in a
 * single operation. Policy lives here; sockets live in `l2cap`. */

use std::io;

use thiserror::Error;

/* Protocol limit is 0xffff; everything this daemon handles fits well
 * below it. */
pub const MAX_REPORT_SIZE: usize = 1024;

/* Which of the two per-session channels a transaction travelled on. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Control,
    Interrupt,
}

impl ChannelRole {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelRole::Control => "control",
            ChannelRole::Interrupt => "interrupt",
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    /* Zero-length read: the peer closed the channel. */
    #[error("Peer closed the channel")]
    Closed,

    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("Channel I/O failed: {0}")]
    Io(#[from] io::Error),
}

/* A bidirectional sequenced-packet channel carrying HID transactions.
 *
 * Implemented by the real L2CAP socket and by the scripted in-memory
 * channel the tests drive. Implementations retry interrupted syscalls
 * and must not raise SIGPIPE on writes to a closed peer. */
pub trait HidChannel: Send + Sync {
    /* Receive one datagram into header + payload slots. Returns the
     * total byte count; 0 means the peer closed the channel. */
    fn recv(&self, header: &mut u8, payload: &mut [u8]) -> io::Result<usize>;

    /* Send one datagram gathered from header + payload. Returns the
     * byte count actually written. */
    fn send(&self, header: u8, payload: &[u8]) -> io::Result<usize>;

    /* Shut the channel down for reading and writing so blocked peers
     * observe EOF. Deliberately not a close: the descriptor must stay
     * valid until every thread using it has been joined. */
    fn shutdown(&self);
}

/* Send one transaction; anything but a complete write is a disconnect
 * condition for the session. */
pub fn send_transaction(
    channel: &dyn HidChannel,
    header: u8,
    payload: &[u8],
) -> Result<(), ChannelError> {
    let expected = 1 + payload.len();
    let written = channel.send(header, payload)?;
    if written < expected {
        return Err(ChannelError::ShortWrite { written, expected });
    }
    Ok(())
}

/* Receive one transaction. Returns the payload length; the header byte
 * lands in `header`. A zero-length datagram is the peer closing. */
pub fn recv_transaction(
    channel: &dyn HidChannel,
    header: &mut u8,
    payload: &mut [u8],
) -> Result<usize, ChannelError> {
    let total = channel.recv(header, payload)?;
    if total == 0 {
        return Err(ChannelError::Closed);
    }
    Ok(total - 1)
}

#[cfg(test)]
pub(crate) mod testing {
    /* Scripted in-memory channel used across the device, chardev and
     * host test suites. Incoming datagrams are queued by the test;
     * outgoing ones are captured for inspection. `shutdown` wakes a
     * blocked receiver with EOF, exactly like a socket shutdown. */

    use super::*;
    use parking_lot::{Condvar, Mutex};
    use std::collections::VecDeque;
    use std::time::{Duration, Instant};

    use crate::proto;

    #[derive(Default)]
    struct MockState {
        incoming: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
        closed: bool,
    }

    #[derive(Default)]
    pub struct MockChannel {
        state: Mutex<MockState>,
        cond: Condvar,
        /* Reply to every SET_REPORT with a success handshake, standing in
         * for a well-behaved controller. */
        pub auto_handshake: bool,
    }

    impl MockChannel {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_auto_handshake() -> Self {
            MockChannel {
                auto_handshake: true,
                ..Self::default()
            }
        }

        /* Queue a datagram for the device's reader thread. */
        pub fn push(&self, datagram: &[u8]) {
            let mut state = self.state.lock();
            state.incoming.push_back(datagram.to_vec());
            self.cond.notify_all();
        }

        pub fn sent(&self) -> Vec<Vec<u8>> {
            self.state.lock().sent.clone()
        }

        pub fn sent_count(&self) -> usize {
            self.state.lock().sent.len()
        }

        pub fn is_closed(&self) -> bool {
            self.state.lock().closed
        }

        /* Spin until at least `n` datagrams have been sent. Panics after
         * two seconds so a broken test fails instead of hanging. */
        pub fn wait_sent(&self, n: usize) -> Vec<Vec<u8>> {
            let deadline = Instant::now() + Duration::from_secs(2);
            let mut state = self.state.lock();
            while state.sent.len() < n {
                if self
                    .cond
                    .wait_until(&mut state, deadline)
                    .timed_out()
                {
                    panic!("expected {} sent datagrams, saw {}", n, state.sent.len());
                }
            }
            state.sent.clone()
        }
    }

    impl HidChannel for MockChannel {
        fn recv(&self, header: &mut u8, payload: &mut [u8]) -> io::Result<usize> {
            let mut state = self.state.lock();
            loop {
                if let Some(datagram) = state.incoming.pop_front() {
                    *header = datagram[0];
                    let n = (datagram.len() - 1).min(payload.len());
                    payload[..n].copy_from_slice(&datagram[1..1 + n]);
                    return Ok(1 + n);
                }
                if state.closed {
                    return Ok(0);
                }
                self.cond.wait(&mut state);
            }
        }

        fn send(&self, header: u8, payload: &[u8]) -> io::Result<usize> {
            let mut state = self.state.lock();
            if state.closed {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            let mut datagram = Vec::with_capacity(1 + payload.len());
            datagram.push(header);
            datagram.extend_from_slice(payload);
            state.sent.push(datagram);
            if self.auto_handshake && header >> 4 == proto::TRANS_SET_REPORT {
                state.incoming.push_back(vec![proto::HANDSHAKE_SUCCESSFUL]);
            }
            self.cond.notify_all();
            Ok(1 + payload.len())
        }

        fn shutdown(&self) {
            let mut state = self.state.lock();
            state.closed = true;
            self.cond.notify_all();
        }
    }

    #[test]
    fn mock_shutdown_unblocks_recv() {
        use std::sync::Arc;

        let channel = Arc::new(MockChannel::new());
        let reader = {
            let channel = Arc::clone(&channel);
            std::thread::spawn(move || {
                let mut header = 0;
                let mut payload = [0u8; 8];
                channel.recv(&mut header, &mut payload)
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        channel.shutdown();
        assert_eq!(reader.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn framing_maps_eof_and_send_failure() {
        let channel = MockChannel::new();
        channel.push(&[0xa1, 1, 2, 3]);

        let mut header = 0;
        let mut payload = [0u8; 8];
        let n = recv_transaction(&channel, &mut header, &mut payload).unwrap();
        assert_eq!((header, n), (0xa1, 3));
        assert_eq!(&payload[..3], &[1, 2, 3]);

        channel.shutdown();
        assert!(matches!(
            recv_transaction(&channel, &mut header, &mut payload),
            Err(ChannelError::Closed)
        ));
        assert!(send_transaction(&channel, 0xa2, &[0]).is_err());
    }
}
