//! Hand-off queue between the I/O thread and the application.
//!
//! The server invokes its `Handler` on the I/O thread. Applications that want
//! to process traffic on their own thread (a UI or render loop, say) install a
//! `DeliveryQueue` as the handler and drain the paired `DeliveryReceiver`
//! whenever it suits them. Backed by a wait-free SPSC ring buffer.

use std::net::SocketAddr;

use rtrb::{Consumer, Producer, RingBuffer};

use crate::net::connection::{ConnectionId, Message};
use crate::net::server::{Handler, Peers};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Connected { id: ConnectionId, peer: SocketAddr },
    Message { id: ConnectionId, message: Message },
    Disconnected { id: ConnectionId },
}

pub struct DeliveryQueue {
    producer: Producer<Delivery>,
    dropped: u64,
}

pub struct DeliveryReceiver {
    consumer: Consumer<Delivery>,
}

pub fn delivery_queue(capacity: usize) -> (DeliveryQueue, DeliveryReceiver) {
    let (producer, consumer) = RingBuffer::new(capacity.max(1));
    (
        DeliveryQueue {
            producer,
            dropped: 0,
        },
        DeliveryReceiver { consumer },
    )
}

impl DeliveryQueue {
    fn push(&mut self, delivery: Delivery) {
        if self.producer.push(delivery).is_err() {
            self.dropped += 1;
            log::warn!(
                "delivery queue full, dropped event ({} dropped so far)",
                self.dropped
            );
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Handler for DeliveryQueue {
    fn on_connect(&mut self, _peers: &mut Peers<'_>, id: ConnectionId, peer: SocketAddr) {
        self.push(Delivery::Connected { id, peer });
    }

    fn on_message(&mut self, _peers: &mut Peers<'_>, id: ConnectionId, message: Message) {
        self.push(Delivery::Message { id, message });
    }

    fn on_disconnect(&mut self, _peers: &mut Peers<'_>, id: ConnectionId) {
        self.push(Delivery::Disconnected { id });
    }
}

impl DeliveryReceiver {
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.consumer.pop().ok()
    }

    /// Everything queued right now, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = Delivery> + '_ {
        std::iter::from_fn(move || self.consumer.pop().ok())
    }

    /// True once the server side has been dropped, i.e. the loop has exited.
    pub fn is_closed(&self) -> bool {
        self.consumer.is_abandoned()
    }
}
