use std::collections::VecDeque;

use super::{Device, DeviceCapabilities, Medium, RxToken as RxTokenTrait, TxToken as TxTokenTrait};
use crate::time::Instant;

/// A loopback device, used for testing.
///
/// It keeps the transmitted packets in a queue and returns them back
/// in a first-in-first-out order on `receive`.
#[derive(Debug)]
pub struct Loopback {
    queue: VecDeque<Vec<u8>>,
    medium: Medium,
}

impl Loopback {
    /// Creates a loopback device.
    ///
    /// Every packet transmitted through this device will be received through it
    /// in FIFO order.
    pub fn new(medium: Medium) -> Loopback {
        Loopback {
            queue: VecDeque::new(),
            medium,
        }
    }
}

impl Device for Loopback {
    type RxToken<'a> = RxToken;
    type TxToken<'a> = TxToken<'a>;

    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            medium: self.medium,
            max_transmission_unit: 65535,
            ..DeviceCapabilities::default()
        }
    }

    fn receive(&mut self, _timestamp: Instant) -> Option<(RxToken, TxToken)> {
        self.queue.pop_front().map(move |buffer| {
            let rx = RxToken { buffer };
            let tx = TxToken {
                queue: &mut self.queue,
            };
            (rx, tx)
        })
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<TxToken> {
        Some(TxToken {
            queue: &mut self.queue,
        })
    }
}

#[doc(hidden)]
pub struct RxToken {
    buffer: Vec<u8>,
}

impl RxTokenTrait for RxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.buffer[..])
    }
}

#[doc(hidden)]
pub struct TxToken<'a> {
    queue: &'a mut VecDeque<Vec<u8>>,
}

impl<'a> TxTokenTrait for TxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0; len];
        let result = f(&mut buffer);
        self.queue.push_back(buffer);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transmitted_frame_is_received_back() {
        let mut dev = Loopback::new(Medium::Ip);
        let tx = dev.transmit(Instant::from_millis(0)).unwrap();
        tx.consume(4, |buf| buf.copy_from_slice(&[1, 2, 3, 4]));

        let (rx, _tx) = dev.receive(Instant::from_millis(0)).unwrap();
        rx.consume(|buf| assert_eq!(buf, &[1, 2, 3, 4]));
    }

    #[test]
    fn empty_queue_yields_no_rx_token() {
        let mut dev = Loopback::new(Medium::Ip);
        assert!(dev.receive(Instant::from_millis(0)).is_none());
    }
}
