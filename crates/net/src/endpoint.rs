use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use crate::protocol::{Frame, Packet, MAX_PACKET_SIZE};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EndpointStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Test-only outgoing packet drop. `loss` is a fraction in [0, 1].
#[derive(Debug, Clone, Copy, Default)]
pub struct LossConditioner {
    pub enabled: bool,
    pub loss: f32,
}

impl LossConditioner {
    pub fn should_drop(&self) -> bool {
        if !self.enabled || self.loss <= 0.0 {
            return false;
        }
        fastrand::f32() < self.loss
    }
}

/// Non-blocking UDP socket speaking the packet format. One per role.
pub struct UdpEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    recv_buffer: [u8; MAX_PACKET_SIZE],
    stats: EndpointStats,
    conditioner: LossConditioner,
}

impl UdpEndpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            recv_buffer: [0u8; MAX_PACKET_SIZE],
            stats: EndpointStats::default(),
            conditioner: LossConditioner::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> EndpointStats {
        self.stats
    }

    pub fn set_conditioner(&mut self, conditioner: LossConditioner) {
        self.conditioner = conditioner;
    }

    pub fn send_to(&mut self, frame: Frame, addr: SocketAddr) -> io::Result<usize> {
        let packet = Packet::new(frame);
        let data = packet
            .serialize()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        if data.len() > MAX_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "packet exceeds MTU",
            ));
        }

        if self.conditioner.should_drop() {
            self.stats.packets_dropped += 1;
            return Ok(data.len());
        }

        let bytes = self.socket.send_to(&data, addr)?;
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes as u64;
        Ok(bytes)
    }

    /// Drains every packet currently queued on the socket. Malformed or
    /// stale-versioned datagrams are skipped, not errored.
    pub fn receive(&mut self) -> io::Result<Vec<(Frame, SocketAddr)>> {
        let mut frames = Vec::new();

        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => {
                    if size < 8 {
                        continue;
                    }

                    match Packet::deserialize(&self.recv_buffer[..size]) {
                        Ok(packet) => {
                            if !packet.header.is_valid() {
                                continue;
                            }
                            self.stats.packets_received += 1;
                            self.stats.bytes_received += size as u64;
                            frames.push((packet.frame, addr));
                        }
                        Err(_) => continue,
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        Ok(frames)
    }
}
