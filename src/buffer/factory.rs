use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use lazy_static::lazy_static;
use util::sync::Mutex;

use crate::buffer::bucket::MAX_PKT_SIZE;
use crate::buffer::buffer::Buffer;
use crate::error::{Error, Result};

lazy_static! {
    /// Process-wide pool of packet scratch buffers, saves a heap allocation
    /// per retransmitted packet.
    pub(crate) static ref PACKET_POOL: PacketPool = PacketPool::new();
}

pub(crate) struct PacketPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl PacketPool {
    fn new() -> Self {
        PacketPool {
            free: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn get(&self) -> Vec<u8> {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; MAX_PKT_SIZE])
    }

    pub(crate) fn put(&self, mut buf: Vec<u8>) {
        if buf.len() < MAX_PKT_SIZE {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < 64 {
            buf.iter_mut().for_each(|b| *b = 0);
            free.push(buf);
        }
    }
}

pub type OnRtcpPacketHdlrFn = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Byte stream of RTCP arriving from a publisher for one SSRC; the router
/// installs the handler that picks out sender reports.
pub struct RtcpReader {
    ssrc: u32,
    closed: AtomicBool,
    on_packet_handler: Mutex<Option<OnRtcpPacketHdlrFn>>,
}

impl RtcpReader {
    fn new(ssrc: u32) -> Self {
        RtcpReader {
            ssrc,
            closed: AtomicBool::new(false),
            on_packet_handler: Mutex::new(None),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn on_packet(&self, f: OnRtcpPacketHdlrFn) {
        *self.on_packet_handler.lock() = Some(f);
    }

    pub fn write(&self, pkt: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ErrIoEof);
        }
        if let Some(f) = &*self.on_packet_handler.lock() {
            f(pkt);
        }
        Ok(pkt.len())
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Allocates the per-SSRC ingest pair the transport writes into. Entries
/// drop out of the maps when their buffer closes.
pub struct Factory {
    inner: Mutex<FactoryInternal>,
}

#[derive(Default)]
struct FactoryInternal {
    buffers: HashMap<u32, Arc<Buffer>>,
    rtcp_readers: HashMap<u32, Arc<RtcpReader>>,
}

impl Factory {
    pub fn new() -> Arc<Self> {
        Arc::new(Factory {
            inner: Mutex::new(FactoryInternal::default()),
        })
    }

    pub fn get_or_new(self: &Arc<Self>, ssrc: u32) -> (Arc<Buffer>, Arc<RtcpReader>) {
        let mut inner = self.inner.lock();
        if let (Some(b), Some(r)) = (inner.buffers.get(&ssrc), inner.rtcp_readers.get(&ssrc)) {
            return (Arc::clone(b), Arc::clone(r));
        }
        let buffer = Arc::new(Buffer::new(ssrc));
        let reader = Arc::new(RtcpReader::new(ssrc));
        let factory = Arc::downgrade(self);
        buffer.on_close(Box::new(move || {
            if let Some(f) = Weak::upgrade(&factory) {
                f.remove(ssrc);
            }
        }));
        inner.buffers.insert(ssrc, Arc::clone(&buffer));
        inner.rtcp_readers.insert(ssrc, Arc::clone(&reader));
        (buffer, reader)
    }

    pub fn get_buffer(&self, ssrc: u32) -> Option<Arc<Buffer>> {
        self.inner.lock().buffers.get(&ssrc).cloned()
    }

    fn remove(&self, ssrc: u32) {
        let mut inner = self.inner.lock();
        inner.buffers.remove(&ssrc);
        if let Some(r) = inner.rtcp_readers.remove(&ssrc) {
            r.close();
        }
    }
}
