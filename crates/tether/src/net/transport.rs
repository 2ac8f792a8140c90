use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::rc::Rc;

use super::protocol::MAX_PACKET_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("datagram of {len} bytes exceeds the datagram limit")]
    Oversized { len: usize },
    #[error("address {0} already bound")]
    AddrInUse(SocketAddr),
}

/// Unreliable, unordered, non-blocking datagram delivery.
pub trait Transport {
    fn send_to(&mut self, bytes: &[u8], addr: SocketAddr) -> Result<usize, TransportError>;

    /// Copies the next pending datagram into `buf`. `Ok(None)` means nothing
    /// is waiting; it never blocks.
    fn poll_recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, TransportError>;

    fn local_addr(&self) -> SocketAddr;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send_to(&mut self, bytes: &[u8], addr: SocketAddr) -> Result<usize, TransportError> {
        (**self).send_to(bytes, addr)
    }

    fn poll_recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, TransportError> {
        (**self).poll_recv(buf)
    }

    fn local_addr(&self) -> SocketAddr {
        (**self).local_addr()
    }
}

pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        log::debug!("udp transport bound to {}", local_addr);
        Ok(Self { socket, local_addr })
    }
}

impl Transport for UdpTransport {
    fn send_to(&mut self, bytes: &[u8], addr: SocketAddr) -> Result<usize, TransportError> {
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(TransportError::Oversized { len: bytes.len() });
        }
        match self.socket.send_to(bytes, addr) {
            Ok(sent) => Ok(sent),
            // A full send buffer behaves like loss.
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn poll_recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, TransportError> {
        loop {
            match self.socket.recv_from(buf) {
                Ok((size, addr)) => return Ok(Some((size, addr))),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                // ICMP port unreachable surfaces here on some platforms.
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

type Mailboxes = HashMap<SocketAddr, VecDeque<(Vec<u8>, SocketAddr)>>;

/// In-process datagram hub. Every endpoint bound on it shares one set of
/// mailboxes; datagrams to unbound addresses vanish like they would on UDP.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    mailboxes: Rc<RefCell<Mailboxes>>,
    next_port: Rc<RefCell<u16>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            mailboxes: Rc::default(),
            next_port: Rc::new(RefCell::new(40000)),
        }
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<MemoryTransport, TransportError> {
        let mut mailboxes = self.mailboxes.borrow_mut();
        if mailboxes.contains_key(&addr) {
            return Err(TransportError::AddrInUse(addr));
        }
        mailboxes.insert(addr, VecDeque::new());

        Ok(MemoryTransport {
            network: self.clone(),
            local_addr: addr,
        })
    }

    /// Binds the next free loopback port.
    pub fn endpoint(&self) -> MemoryTransport {
        loop {
            let port = {
                let mut next = self.next_port.borrow_mut();
                let port = *next;
                *next = next.wrapping_add(1).max(1024);
                port
            };
            let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
            if let Ok(transport) = self.bind(addr) {
                return transport;
            }
        }
    }

    pub fn in_flight(&self, addr: SocketAddr) -> usize {
        self.mailboxes
            .borrow()
            .get(&addr)
            .map_or(0, |mailbox| mailbox.len())
    }

    fn unbind(&self, addr: SocketAddr) {
        self.mailboxes.borrow_mut().remove(&addr);
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    local_addr: SocketAddr,
}

impl Transport for MemoryTransport {
    fn send_to(&mut self, bytes: &[u8], addr: SocketAddr) -> Result<usize, TransportError> {
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(TransportError::Oversized { len: bytes.len() });
        }
        if let Some(mailbox) = self.network.mailboxes.borrow_mut().get_mut(&addr) {
            mailbox.push_back((bytes.to_vec(), self.local_addr));
        }
        Ok(bytes.len())
    }

    fn poll_recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, TransportError> {
        let mut mailboxes = self.network.mailboxes.borrow_mut();
        let Some((data, from)) = mailboxes
            .get_mut(&self.local_addr)
            .and_then(|mailbox| mailbox.pop_front())
        else {
            return Ok(None);
        };

        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(Some((len, from)))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.unbind(self.local_addr);
    }
}
