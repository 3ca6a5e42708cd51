use rtcp::transport_feedbacks::transport_layer_nack::NackPair;

const MAX_NACK_TIMES: u8 = 3;
const MAX_NACK_CACHE: usize = 100;

#[derive(Debug, Clone, Copy)]
struct Nack {
    sn: u32,
    nacked: u8,
}

/// Missing-sequence tracker for one RTP stream. Sequence numbers are
/// extended (cycle count in the high bits) so ordering survives the 16-bit
/// wrap. Entries that have been nacked three times without showing up are
/// escalated to a keyframe request instead of retried forever.
#[derive(Default)]
pub struct NackQueue {
    nacks: Vec<Nack>,
    kf_sn: u32,
}

impl NackQueue {
    pub fn new() -> Self {
        NackQueue {
            nacks: Vec::with_capacity(MAX_NACK_CACHE),
            kf_sn: 0,
        }
    }

    /// Records ext_sn as missing. Re-pushing a tracked sequence number is a
    /// no-op.
    pub fn push(&mut self, ext_sn: u32) {
        let i = match self.nacks.binary_search_by_key(&ext_sn, |n| n.sn) {
            Ok(_) => return,
            Err(i) => i,
        };
        self.nacks.insert(i, Nack { sn: ext_sn, nacked: 0 });
        if self.nacks.len() > MAX_NACK_CACHE {
            self.nacks.remove(0);
        }
    }

    /// Drops ext_sn from the queue, called when the packet finally arrives.
    pub fn remove(&mut self, ext_sn: u32) {
        if let Ok(i) = self.nacks.binary_search_by_key(&ext_sn, |n| n.sn) {
            self.nacks.remove(i);
        }
    }

    /// Builds the NACK pairs to send this round. Entries newer than
    /// head_sn - 2 are left alone, they may still arrive on their own.
    /// Returns the pairs and whether a keyframe should be requested instead
    /// for sequence numbers that exhausted their retries.
    pub fn pairs(&mut self, head_sn: u32) -> (Vec<NackPair>, bool) {
        if self.nacks.is_empty() {
            return (Vec::new(), false);
        }

        let mut ask_keyframe = false;
        let mut pairs: Vec<NackPair> = Vec::new();
        let mut current: Option<NackPair> = None;
        let mut kept = Vec::with_capacity(self.nacks.len());

        for nack in self.nacks.iter() {
            if nack.nacked >= MAX_NACK_TIMES {
                // One keyframe request per missing run, not one per retry.
                if nack.sn > self.kf_sn {
                    self.kf_sn = nack.sn;
                    ask_keyframe = true;
                }
                continue;
            }
            if nack.sn >= head_sn.saturating_sub(2) {
                kept.push(*nack);
                continue;
            }

            kept.push(Nack {
                sn: nack.sn,
                nacked: nack.nacked + 1,
            });

            let sn = nack.sn as u16;
            match current.as_mut() {
                Some(p) if sn.wrapping_sub(p.packet_id) <= 16 => {
                    p.lost_packets |= 1 << (sn.wrapping_sub(p.packet_id) - 1);
                }
                _ => {
                    if let Some(p) = current.take() {
                        pairs.push(p);
                    }
                    current = Some(NackPair::new(sn));
                }
            }
        }
        if let Some(p) = current.take() {
            pairs.push(p);
        }

        self.nacks = kept;
        (pairs, ask_keyframe)
    }
}
