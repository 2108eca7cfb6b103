//! Frame links between two soft queue pairs.

use super::wire::{self, Frame};
use crate::transport::{TransportError, TransportResult};
use crossbeam_channel::{Receiver, Sender, select, unbounded};
use std::net::{Shutdown, TcpStream};
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicBool, Ordering};

/// Bidirectional, ordered frame pipe.
pub(crate) trait Link: Send + Sync {
    /// Queue a frame for the peer
    fn send(&self, frame: Frame) -> TransportResult<()>;

    /// Block for the next frame; `Ok(None)` once the link is closed
    fn recv(&self) -> TransportResult<Option<Frame>>;

    /// Close both directions; wakes a blocked `recv` on either side
    fn close(&self);
}

/// One half of an in-process link.
pub(crate) struct MemoryLink {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    close_self: Sender<()>,
    close_peer: Sender<()>,
    closed_rx: Receiver<()>,
    closing: AtomicBool,
    drained: AtomicBool,
}

impl MemoryLink {
    /// Create both halves
    pub(crate) fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = unbounded();
        let (b_tx, a_rx) = unbounded();
        let (a_close_tx, a_close_rx) = unbounded();
        let (b_close_tx, b_close_rx) = unbounded();

        let a = Self {
            tx: a_tx,
            rx: a_rx,
            close_self: a_close_tx.clone(),
            close_peer: b_close_tx.clone(),
            closed_rx: a_close_rx,
            closing: AtomicBool::new(false),
            drained: AtomicBool::new(false),
        };
        let b = Self {
            tx: b_tx,
            rx: b_rx,
            close_self: b_close_tx,
            close_peer: a_close_tx,
            closed_rx: b_close_rx,
            closing: AtomicBool::new(false),
            drained: AtomicBool::new(false),
        };
        (a, b)
    }
}

impl Link for MemoryLink {
    fn send(&self, frame: Frame) -> TransportResult<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    fn recv(&self) -> TransportResult<Option<Frame>> {
        // Frames sent before the close are still delivered
        if self.drained.load(Ordering::Acquire) {
            return Ok(self.rx.try_recv().ok());
        }
        select! {
            recv(self.rx) -> frame => Ok(frame.ok()),
            recv(self.closed_rx) -> _ => {
                self.drained.store(true, Ordering::Release);
                Ok(self.rx.try_recv().ok())
            }
        }
    }

    fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.close_self.send(());
        let _ = self.close_peer.send(());
    }
}

/// A link over a TCP stream.
pub(crate) struct TcpLink {
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    control: TcpStream,
}

impl TcpLink {
    pub(crate) fn new(stream: TcpStream) -> TransportResult<Self> {
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(stream),
            control,
        })
    }
}

impl Link for TcpLink {
    fn send(&self, frame: Frame) -> TransportResult<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        wire::write_frame(&mut *writer, &frame)
    }

    fn recv(&self) -> TransportResult<Option<Frame>> {
        let mut reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        wire::read_frame(&mut *reader)
    }

    fn close(&self) {
        // Already-closed sockets report NotConnected; nothing left to do then
        let _ = self.control.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_link_delivers_in_order() {
        let (a, b) = MemoryLink::pair();
        a.send(Frame::Connect { qpn: 1 }).unwrap();
        a.send(Frame::Disconnect).unwrap();

        assert_eq!(b.recv().unwrap(), Some(Frame::Connect { qpn: 1 }));
        assert_eq!(b.recv().unwrap(), Some(Frame::Disconnect));
    }

    #[test]
    fn test_memory_link_close_wakes_both_sides() {
        let (a, b) = MemoryLink::pair();
        a.send(Frame::Disconnect).unwrap();
        a.close();

        // The frame sent before the close still arrives
        assert_eq!(b.recv().unwrap(), Some(Frame::Disconnect));
        assert_eq!(b.recv().unwrap(), None);
        assert_eq!(a.recv().unwrap(), None);
        assert!(matches!(
            a.send(Frame::Disconnect),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_memory_link_dropped_peer() {
        let (a, b) = MemoryLink::pair();
        drop(a);
        assert_eq!(b.recv().unwrap(), None);
    }

    #[test]
    fn test_tcp_link_round_trip() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let a = TcpLink::new(client).unwrap();
        let b = TcpLink::new(server).unwrap();

        a.send(Frame::Accept { qpn: 9 }).unwrap();
        assert_eq!(b.recv().unwrap(), Some(Frame::Accept { qpn: 9 }));

        a.close();
        assert_eq!(b.recv().unwrap(), None);
    }
}
