use util::sync::Mutex;

const MAX_META_HISTORY: usize = 500;

/// Everything needed to retransmit one forwarded packet when the subscriber
/// nacks its rewritten sequence number.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PacketMeta {
    /// Sequence number of the packet in the origin stream.
    pub source_seq: u16,
    /// Sequence number the subscriber saw.
    pub target_seq: u16,
    /// Rewritten timestamp.
    pub timestamp: u32,
    /// Spatial layer the packet was forwarded from.
    pub layer: u8,
    /// VP8 values that were written into the forwarded payload; the
    /// retransmit path must apply the same rewrite.
    pub temporal_supported: bool,
    pub picture_id: u16,
    pub tl0_pic_idx: u8,
}

/// Ring of forwarded-packet metadata indexed by rewritten sequence number.
/// Written by the forwarding path, read when subscriber NACKs come back.
pub struct Sequencer {
    internal: Mutex<SequencerInternal>,
}

struct SequencerInternal {
    meta: Vec<Option<PacketMeta>>,
    head_sn: u16,
    started: bool,
}

impl Default for Sequencer {
    fn default() -> Self {
        Sequencer::new()
    }
}

impl Sequencer {
    pub fn new() -> Self {
        Sequencer {
            internal: Mutex::new(SequencerInternal {
                meta: vec![None; MAX_META_HISTORY],
                head_sn: 0,
                started: false,
            }),
        }
    }

    pub fn push(&self, meta: PacketMeta) {
        let mut s = self.internal.lock();
        let idx = meta.target_seq as usize % s.meta.len();
        if !s.started || seq_newer(meta.target_seq, s.head_sn) {
            s.head_sn = meta.target_seq;
            s.started = true;
        }
        s.meta[idx] = Some(meta);
    }

    /// Looks up the metadata for a batch of nacked target sequence numbers,
    /// silently skipping anything that aged out of the ring.
    pub fn get_meta(&self, seqs: &[u16]) -> Vec<PacketMeta> {
        let s = self.internal.lock();
        let mut out = Vec::with_capacity(seqs.len());
        for &sn in seqs {
            let dist = s.head_sn.wrapping_sub(sn);
            if dist as usize >= s.meta.len() {
                continue;
            }
            if let Some(meta) = s.meta[sn as usize % s.meta.len()] {
                if meta.target_seq == sn {
                    out.push(meta);
                }
            }
        }
        out
    }
}

fn seq_newer(sn: u16, head: u16) -> bool {
    sn.wrapping_sub(head) < 1 << 15 && sn != head
}

#[cfg(test)]
mod test {
    use super::*;

    fn meta(source: u16, target: u16) -> PacketMeta {
        PacketMeta {
            source_seq: source,
            target_seq: target,
            timestamp: target as u32 * 3000,
            layer: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_lookup_maps_back_to_source() {
        let s = Sequencer::new();
        for i in 0..10u16 {
            s.push(meta(5000 + i, 100 + i));
        }
        let found = s.get_meta(&[100, 105, 109]);
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].source_seq, 5000);
        assert_eq!(found[1].source_seq, 5005);
        assert_eq!(found[2].source_seq, 5009);
    }

    #[test]
    fn test_unknown_and_aged_entries_skipped() {
        let s = Sequencer::new();
        s.push(meta(5000, 100));
        // Never forwarded.
        assert!(s.get_meta(&[101]).is_empty());
        // Push the head far ahead so 100 leaves the valid window.
        s.push(meta(9000, 100 + MAX_META_HISTORY as u16));
        assert!(s.get_meta(&[100]).is_empty());
    }

    #[test]
    fn test_wraparound_targets() {
        let s = Sequencer::new();
        for i in 0..4u16 {
            let target = 65534u16.wrapping_add(i);
            s.push(meta(100 + i, target));
        }
        let found = s.get_meta(&[65534, 65535, 0, 1]);
        assert_eq!(found.len(), 4);
        assert_eq!(found[3].source_seq, 103);
    }

    #[test]
    fn test_stale_slot_not_served_for_new_seq() {
        let s = Sequencer::new();
        s.push(meta(5000, 100));
        // Same ring slot, different sequence number: the slot now answers
        // only for the new one.
        let clash = 100 + MAX_META_HISTORY as u16;
        s.push(meta(7000, clash));
        assert!(s.get_meta(&[100]).is_empty());
        assert_eq!(s.get_meta(&[clash])[0].source_seq, 7000);
    }
}
