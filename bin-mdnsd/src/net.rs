//! The multicast side of the daemon: one socket joined to the mDNS
//! group, an outbound task turning the engine's questions into
//! datagrams, and an inbound task feeding received records back.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket as StdUdpSocket};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use mdns_engine::engine::{Event, OutboundQuestion};
use mdns_types::protocol::types::{Packet, PACKET_MAX_LEN};

pub const MDNS_PORT: u16 = 5353;
pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// A reusable UDP socket bound to the mDNS port and joined to the
/// group on the given interface.  Address reuse matters: other mDNS
/// daemons may share the port on this host.
pub fn multicast_socket(interface: Ipv4Addr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MDNS_PORT).into())?;
    socket.join_multicast_v4(&MDNS_GROUP, &interface)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;

    UdpSocket::from_std(StdUdpSocket::from(socket))
}

/// Put the engine's questions on the wire, with their Known-Answer
/// sections.
pub async fn outbound_task(
    socket: Arc<UdpSocket>,
    mut questions: mpsc::UnboundedReceiver<OutboundQuestion>,
) {
    while let Some(question) = questions.recv().await {
        let packet = Packet::query(question.key, question.known_answers);
        match packet.to_octets() {
            Ok(octets) => {
                if let Err(error) = socket.send_to(&octets, (MDNS_GROUP, MDNS_PORT)).await {
                    tracing::debug!(?error, "multicast send error");
                }
            }
            Err(error) => tracing::warn!(%error, "could not serialise question"),
        }
    }
}

/// Feed records from multicast responses into the engine.  Queries
/// from other hosts are the record publisher's concern, not the
/// resolver's, and are ignored here.
pub async fn inbound_task(socket: Arc<UdpSocket>, events: mpsc::UnboundedSender<Event>) {
    let mut buf = vec![0u8; PACKET_MAX_LEN];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((length, peer)) => match Packet::from_octets(&buf[..length]) {
                Ok(packet) if packet.is_response => {
                    for record in packet.records() {
                        if events.send(Event::Record { record }).is_err() {
                            return;
                        }
                    }
                }
                Ok(_) => {}
                Err(error) => tracing::debug!(?peer, %error, "dropping unparseable packet"),
            },
            Err(error) => tracing::debug!(?error, "multicast recv error"),
        }
    }
}
