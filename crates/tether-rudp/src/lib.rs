#![deny(unreachable_pub, unsafe_code)]

//! sans io implementation of a reliable, sequenced datagram stream
//!
//! [`RudpStream`] layers ordered, loss-recovering delivery over an
//! unreliable datagram carrier. It keeps a sliding send window governed by
//! a baton based congestion controller and a receive window acknowledged
//! with a run-length gap vector, either piggybacked on data packets or
//! delivered out-of-band as an [`ExternalAck`].
//!
//! All I/O and timing is left to the embedder: wire packets are ingested
//! with [`RudpStream::handle_packet`], timers are driven by
//! [`RudpStream::poll`] / [`RudpStream::timeout`] and outbound traffic is
//! reported through [`RudpStreamEvent`]s.

mod packet;
mod stream;

pub use packet::{Flags, PacketError, RudpPacket, VectorState};
pub use stream::{
    CongestionState, Direction, ExternalAck, RudpStream, RudpStreamConfig, RudpStreamError,
    RudpStreamEvent, RudpStreamState,
};
