//! Kernel TAP devices as dataplane ports.
//!
//! Each dataplane queue gets its own file descriptor on a multi-queue TAP
//! interface, opened non-blocking so the poll loops never sleep in the
//! kernel. Frames are raw Ethernet (`IFF_NO_PI`).

use arc_swap::ArcSwap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use ringwall_common::MAX_QUEUE_NUM;

use crate::error::{Error, Result};
use crate::mbuf::{Mbuf, PacketPool};
use crate::port::Port;

const TUN_DEVICE: &str = "/dev/net/tun";

/// TAP flags from linux/if_tun.h
const IFF_TAP: libc::c_short = 0x0002;
const IFF_MULTI_QUEUE: libc::c_short = 0x0100;
const IFF_NO_PI: libc::c_short = 0x1000;

/// ioctl request code for TUNSETIFF
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// ifreq with the flags member of the union.
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

impl IfReq {
    fn new(name: &str, flags: libc::c_short) -> io::Result<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("interface name {:?} must be 1-{} bytes", name, libc::IFNAMSIZ - 1),
            ));
        }
        let mut ifr = Self {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: flags,
            _pad: [0; 22],
        };
        for (dst, &b) in ifr.ifr_name.iter_mut().zip(bytes) {
            *dst = b as libc::c_char;
        }
        Ok(ifr)
    }
}

/// RAII guard for an ioctl socket.
struct SockGuard(RawFd);

impl Drop for SockGuard {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

/// Attach one more queue to TAP interface `name`, creating it if needed.
fn open_queue(name: &str) -> io::Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(TUN_DEVICE)?;
    let ifr = IfReq::new(name, IFF_TAP | IFF_NO_PI | IFF_MULTI_QUEUE)?;
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &ifr) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(file)
}

/// Set `set` and clear `clear` in the link flags of `name`.
fn update_link_flags(name: &str, set: libc::c_short, clear: libc::c_short) -> io::Result<()> {
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return Err(io::Error::last_os_error());
    }
    let sock = SockGuard(sock);

    let mut ifr = IfReq::new(name, 0)?;
    if unsafe { libc::ioctl(sock.0, libc::SIOCGIFFLAGS as _, &mut ifr) } < 0 {
        return Err(io::Error::last_os_error());
    }
    ifr.ifr_flags = (ifr.ifr_flags | set) & !clear;
    if unsafe { libc::ioctl(sock.0, libc::SIOCSIFFLAGS as _, &ifr) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A port backed by a multi-queue TAP interface. Received frames are copied
/// into buffers from `pool`.
pub struct TapPort {
    id: u16,
    ifname: String,
    pool: Arc<PacketPool>,
    queues: ArcSwap<Vec<File>>,
}

impl TapPort {
    /// Validate the interface name. No device is touched until `configure`.
    pub fn new(id: u16, ifname: &str, pool: Arc<PacketPool>) -> Result<Self> {
        IfReq::new(ifname, 0).map_err(|e| Error::port(id, e.to_string()))?;
        Ok(Self {
            id,
            ifname: ifname.to_string(),
            pool,
            queues: ArcSwap::from_pointee(Vec::new()),
        })
    }

    fn io_error(&self, what: &str, e: io::Error) -> Error {
        Error::port(self.id, format!("{} {}: {}", what, self.ifname, e))
    }
}

impl Port for TapPort {
    fn id(&self) -> u16 {
        self.id
    }

    fn max_queues(&self) -> u16 {
        MAX_QUEUE_NUM as u16
    }

    fn configure(&self, n_rx: u16, n_tx: u16) -> Result<()> {
        let n = n_rx.max(n_tx);
        if n > self.max_queues() {
            return Err(Error::port(
                self.id,
                format!("{} queues requested, device supports {}", n, self.max_queues()),
            ));
        }
        let files = (0..n)
            .map(|_| open_queue(&self.ifname))
            .collect::<io::Result<Vec<_>>>()
            .map_err(|e| self.io_error("open tap", e))?;
        update_link_flags(&self.ifname, libc::IFF_UP as libc::c_short, 0)
            .map_err(|e| self.io_error("bring up", e))?;
        self.queues.store(Arc::new(files));
        tracing::info!(port = self.id, ifname = %self.ifname, queues = n, "tap port up");
        Ok(())
    }

    fn receive_burst(&self, queue: u16, out: &mut Vec<Mbuf>, max: usize) -> usize {
        let queues = self.queues.load();
        let Some(mut file) = queues.get(queue as usize) else {
            return 0;
        };
        let mut n = 0;
        while n < max {
            let Some(mut mbuf) = self.pool.alloc() else {
                tracing::trace!(port = self.id, queue, "pool exhausted, receive stopped");
                break;
            };
            match mbuf.fill(|buf| file.read(buf)) {
                Ok(0) => break,
                Ok(_) => {
                    out.push(mbuf);
                    n += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::debug!(port = self.id, queue, "tap read failed: {}", e);
                    break;
                }
            }
        }
        n
    }

    fn transmit_burst(&self, queue: u16, pkts: &mut Vec<Mbuf>) -> usize {
        let queues = self.queues.load();
        let Some(mut file) = queues.get(queue as usize) else {
            return 0;
        };
        let mut sent = 0;
        for pkt in pkts.iter() {
            match file.write(pkt.data()) {
                Ok(_) => sent += 1,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::debug!(port = self.id, queue, "tap write failed: {}", e);
                    break;
                }
            }
        }
        pkts.drain(..sent);
        sent
    }

    fn set_promiscuous(&self, on: bool) -> Result<()> {
        let promisc = libc::IFF_PROMISC as libc::c_short;
        let (set, clear) = if on { (promisc, 0) } else { (0, promisc) };
        update_link_flags(&self.ifname, set, clear).map_err(|e| self.io_error("promiscuous", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifreq_name_limits() {
        let ifr = IfReq::new("rw0", IFF_TAP).unwrap();
        let name: Vec<u8> = ifr.ifr_name[..4].iter().map(|&c| c as u8).collect();
        assert_eq!(name, b"rw0\0");
        assert_eq!(ifr.ifr_flags, IFF_TAP);

        assert!(IfReq::new("", 0).is_err());
        assert!(IfReq::new("sixteen-chars-xx", 0).is_err());
        assert!(IfReq::new("fifteen-chars-x", 0).is_ok());
    }

    #[test]
    fn test_unconfigured_queues_are_idle() {
        let pool = PacketPool::new("test", 4, 64).unwrap();
        let port = TapPort::new(1, "rw1", pool.clone()).unwrap();

        let mut out = Vec::new();
        assert_eq!(port.receive_burst(0, &mut out, 32), 0);
        assert!(out.is_empty());

        let mut pkts = vec![pool.alloc().unwrap()];
        assert_eq!(port.transmit_burst(0, &mut pkts), 0);
        assert_eq!(pkts.len(), 1);
    }

    #[test]
    fn test_too_many_queues_rejected() {
        let pool = PacketPool::new("test", 1, 64).unwrap();
        let port = TapPort::new(2, "rw2", pool).unwrap();
        let n = MAX_QUEUE_NUM as u16 + 1;
        assert!(matches!(port.configure(n, 1), Err(Error::Port { port: 2, .. })));
    }
}
