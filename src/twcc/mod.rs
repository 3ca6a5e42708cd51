
use rtcp::transport_feedbacks::transport_layer_cc::{
    PacketStatusChunk, RecvDelta, RunLengthChunk, StatusChunkTypeTcc, StatusVectorChunk,
    SymbolSizeTypeTcc, SymbolTypeTcc, TransportLayerCc,
};
use util::sync::Mutex;

pub type OnTwccFeedbackHdlrFn =
    Box<dyn Fn(Box<dyn rtcp::packet::Packet + Send + Sync>) + Send + Sync>;

/// Report as soon as this many arrivals are pending and a time condition
/// holds.
const MIN_PACKETS: usize = 20;
/// Report regardless of timing above this backlog.
const MAX_PACKETS: usize = 100;
const REPORT_INTERVAL_NS: i64 = 100_000_000;
const MARKER_INTERVAL_NS: i64 = 50_000_000;

#[derive(Debug, Clone, Copy)]
struct PktInfo {
    ext_sn: u32,
    arrival_us: i64,
}

/// Assembles transport-wide congestion control feedback from per-packet
/// arrival timestamps, as specified in
/// <https://datatracker.ietf.org/doc/html/draft-holmer-rmcat-transport-wide-cc-extensions-01>
pub struct Responder {
    internal: Mutex<ResponderInternal>,
    on_feedback_handler: Mutex<Option<OnTwccFeedbackHdlrFn>>,
}

struct ResponderInternal {
    sender_ssrc: u32,
    media_ssrc: u32,

    received: Vec<PktInfo>,
    cycles: u32,
    last_sn: u16,
    started: bool,

    /// Highest extended sequence number already covered by a report.
    last_ext_sn: u32,
    last_report_ns: i64,
    fb_pkt_count: u8,
}

impl Responder {
    pub fn new(media_ssrc: u32) -> Self {
        Responder {
            internal: Mutex::new(ResponderInternal {
                sender_ssrc: rand::random::<u32>(),
                media_ssrc,
                received: Vec::with_capacity(MAX_PACKETS),
                cycles: 0,
                last_sn: 0,
                started: false,
                last_ext_sn: 0,
                last_report_ns: 0,
                fb_pkt_count: 0,
            }),
            on_feedback_handler: Mutex::new(None),
        }
    }

    pub fn on_feedback(&self, f: OnTwccFeedbackHdlrFn) {
        *self.on_feedback_handler.lock() = Some(f);
    }

    /// Records one arrival. Emits a feedback packet through the handler when
    /// enough arrivals are pending: at least MIN_PACKETS and either 100 ms
    /// since the last report, a backlog above MAX_PACKETS, or a marker
    /// packet 50 ms in.
    pub fn push(&self, sn: u16, time_ns: i64, marker: bool) {
        let fb = {
            let mut t = self.internal.lock();
            t.record(sn, time_ns);
            if t.last_report_ns == 0 {
                t.last_report_ns = time_ns;
            }
            let elapsed = time_ns - t.last_report_ns;
            let due = t.received.len() >= MIN_PACKETS
                && (elapsed >= REPORT_INTERVAL_NS
                    || t.received.len() > MAX_PACKETS
                    || (marker && elapsed >= MARKER_INTERVAL_NS));
            if due {
                t.last_report_ns = time_ns;
                t.build_feedback()
            } else {
                None
            }
        };
        if let Some(fb) = fb {
            self.emit(fb);
        }
    }

    /// Builds a report for whatever is pending, used at teardown so trailing
    /// arrivals are not lost.
    pub fn flush(&self) {
        let fb = self.internal.lock().build_feedback();
        if let Some(fb) = fb {
            self.emit(fb);
        }
    }

    fn emit(&self, fb: TransportLayerCc) {
        if let Some(f) = &*self.on_feedback_handler.lock() {
            f(Box::new(fb));
        }
    }
}

impl ResponderInternal {
    fn record(&mut self, sn: u16, time_ns: i64) {
        if self.started && sn < 0x0fff && self.last_sn > 0xf000 {
            self.cycles += 1 << 16;
        }
        self.started = true;
        self.last_sn = sn;
        self.received.push(PktInfo {
            ext_sn: self.cycles | sn as u32,
            arrival_us: time_ns / 1000,
        });
    }

    fn build_feedback(&mut self) -> Option<TransportLayerCc> {
        let mut pending = std::mem::take(&mut self.received);
        pending.sort_by_key(|p| p.ext_sn);
        pending.retain(|p| p.ext_sn > self.last_ext_sn || self.last_ext_sn == 0);
        pending.dedup_by_key(|p| p.ext_sn);
        let last = *pending.last()?;
        // A stray ancient sequence number would blow the status list up to
        // tens of thousands of synthetic losses, drop anything that far out.
        pending.retain(|p| last.ext_sn - p.ext_sn < 0x8000);
        let first = *pending.first()?;

        let ref_timestamp_64ms = first.arrival_us / 64000;
        let mut last_ts_us = ref_timestamp_64ms * 64000;

        let mut encoder = ChunkEncoder::default();
        let mut deltas: Vec<RecvDelta> = Vec::with_capacity(pending.len());
        let mut next = pending.iter().peekable();
        let mut status_count = 0u16;
        let mut ext_sn = first.ext_sn;
        while ext_sn <= last.ext_sn {
            match next.peek() {
                Some(p) if p.ext_sn == ext_sn => {
                    let delta_us = p.arrival_us - last_ts_us;
                    let delta250 = delta_us / 250;
                    let symbol = if (0..=255).contains(&delta250) {
                        SymbolTypeTcc::PacketReceivedSmallDelta
                    } else {
                        SymbolTypeTcc::PacketReceivedLargeDelta
                    };
                    // Out-of-range deltas are clamped rather than split into
                    // a fresh report.
                    let clamped = delta250.clamp(i16::MIN as i64, i16::MAX as i64) * 250;
                    deltas.push(RecvDelta {
                        type_tcc_packet: symbol,
                        delta: clamped,
                    });
                    encoder.add(symbol as u16);
                    last_ts_us += clamped;
                    next.next();
                }
                _ => {
                    encoder.add(SymbolTypeTcc::PacketNotReceived as u16);
                }
            }
            status_count = status_count.wrapping_add(1);
            ext_sn += 1;
        }

        self.last_ext_sn = last.ext_sn;
        let fb_pkt_count = self.fb_pkt_count;
        self.fb_pkt_count = self.fb_pkt_count.wrapping_add(1);

        Some(TransportLayerCc {
            sender_ssrc: self.sender_ssrc,
            media_ssrc: self.media_ssrc,
            base_sequence_number: (first.ext_sn & 0xffff) as u16,
            packet_status_count: status_count,
            // 24 bit field, wraps roughly every 18 minutes of absolute time.
            reference_time: (ref_timestamp_64ms as u32) & 0x00ff_ffff,
            fb_pkt_count,
            packet_chunks: encoder.finish(),
            recv_deltas: deltas,
        })
    }
}

const MAX_RUN_LENGTH_CAP: usize = 0x1fff; // 13 bit counter
const MAX_ONE_BIT_CAP: usize = 14;
const MAX_TWO_BIT_CAP: usize = 7;

/// Packs a status symbol sequence into run-length and status-vector chunks,
/// preferring run-length whenever a run stays uniform.
#[derive(Default)]
struct ChunkEncoder {
    chunks: Vec<PacketStatusChunk>,
    deltas: Vec<u16>,
    has_large_delta: bool,
    has_different_types: bool,
}

impl ChunkEncoder {
    fn add(&mut self, symbol: u16) {
        if !self.can_add(symbol) {
            self.encode_pending();
        }
        self.deltas.push(symbol);
        self.has_large_delta =
            self.has_large_delta || symbol == SymbolTypeTcc::PacketReceivedLargeDelta as u16;
        self.has_different_types = self.has_different_types || symbol != self.deltas[0];
    }

    fn finish(mut self) -> Vec<PacketStatusChunk> {
        while !self.deltas.is_empty() {
            self.encode_pending();
        }
        self.chunks
    }

    fn can_add(&self, symbol: u16) -> bool {
        if self.deltas.len() < MAX_TWO_BIT_CAP {
            return true;
        }
        if self.deltas.len() < MAX_ONE_BIT_CAP
            && !self.has_large_delta
            && symbol != SymbolTypeTcc::PacketReceivedLargeDelta as u16
        {
            return true;
        }
        if self.deltas.len() < MAX_RUN_LENGTH_CAP
            && !self.has_different_types
            && symbol == self.deltas[0]
        {
            return true;
        }
        false
    }

    fn encode_pending(&mut self) {
        if self.deltas.is_empty() {
            return;
        }
        if !self.has_different_types {
            self.chunks.push(PacketStatusChunk::RunLengthChunk(RunLengthChunk {
                type_tcc: StatusChunkTypeTcc::RunLengthChunk,
                packet_status_symbol: self.deltas[0].into(),
                run_length: self.deltas.len() as u16,
            }));
            self.reset();
            return;
        }
        if self.deltas.len() == MAX_ONE_BIT_CAP {
            self.chunks
                .push(PacketStatusChunk::StatusVectorChunk(StatusVectorChunk {
                    type_tcc: StatusChunkTypeTcc::StatusVectorChunk,
                    symbol_size: SymbolSizeTypeTcc::OneBit,
                    symbol_list: self.deltas.iter().map(|x| SymbolTypeTcc::from(*x)).collect(),
                }));
            self.reset();
            return;
        }

        let min_cap = std::cmp::min(MAX_TWO_BIT_CAP, self.deltas.len());
        self.chunks
            .push(PacketStatusChunk::StatusVectorChunk(StatusVectorChunk {
                type_tcc: StatusChunkTypeTcc::StatusVectorChunk,
                symbol_size: SymbolSizeTypeTcc::TwoBit,
                symbol_list: self.deltas[..min_cap]
                    .iter()
                    .map(|x| SymbolTypeTcc::from(*x))
                    .collect(),
            }));
        self.deltas.drain(..min_cap);

        self.has_different_types = false;
        self.has_large_delta = false;
        for d in &self.deltas {
            if *d != self.deltas[0] {
                self.has_different_types = true;
            }
            if *d == SymbolTypeTcc::PacketReceivedLargeDelta as u16 {
                self.has_large_delta = true;
            }
        }
    }

    fn reset(&mut self) {
        self.deltas.clear();
        self.has_large_delta = false;
        self.has_different_types = false;
    }
}
