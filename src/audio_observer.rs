use util::sync::Mutex;

/// Vote accumulator for active-speaker detection. Levels are RFC 6464
/// negated dBov, zero loudest and 127 silence; a stream counts as active in
/// an interval once it was audible for at least filter percent of it.
pub struct AudioObserver {
    threshold: u8,
    /// Observations an always-audible stream would produce per interval,
    /// assuming 20 ms audio packets.
    expected: i64,
    streams: Mutex<Vec<AudioStream>>,
}

struct AudioStream {
    id: String,
    sum: i64,
    total: i64,
}

impl AudioObserver {
    /// interval in milliseconds, filter in percent.
    pub fn new(threshold: u8, interval: u64, filter: u8) -> Self {
        AudioObserver {
            threshold,
            expected: (interval as i64 * filter as i64) / (20 * 100),
            streams: Mutex::new(Vec::new()),
        }
    }

    pub fn add_stream(&self, stream_id: String) {
        let mut streams = self.streams.lock();
        if streams.iter().any(|s| s.id == stream_id) {
            return;
        }
        streams.push(AudioStream {
            id: stream_id,
            sum: 0,
            total: 0,
        });
    }

    pub fn remove_stream(&self, stream_id: &str) {
        self.streams.lock().retain(|s| s.id != stream_id);
    }

    /// Feeds one level observation for a stream.
    pub fn observe(&self, stream_id: &str, d_bov: u8) {
        if d_bov > self.threshold {
            return;
        }
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.iter_mut().find(|s| s.id == stream_id) {
            stream.sum += d_bov as i64;
            stream.total += 1;
        }
    }

    /// Ends the interval: returns the active streams loudest first and
    /// resets the votes.
    pub fn calc(&self) -> Vec<String> {
        let mut streams = self.streams.lock();
        let mut active: Vec<(String, i64)> = streams
            .iter()
            .filter(|s| s.total >= self.expected && s.total > 0)
            .map(|s| (s.id.clone(), s.sum / s.total))
            .collect();
        for s in streams.iter_mut() {
            s.sum = 0;
            s.total = 0;
        }
        active.sort_by_key(|(_, avg)| *avg);
        active.into_iter().map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_loudest_first() {
        // 1000 ms interval, 20 % filter: 10 expected observations.
        let o = AudioObserver::new(40, 1000, 20);
        o.add_stream("quiet".to_owned());
        o.add_stream("loud".to_owned());
        o.add_stream("silent".to_owned());
        for _ in 0..10 {
            o.observe("quiet", 35);
            o.observe("loud", 5);
            // Above the threshold: never counted.
            o.observe("silent", 90);
        }
        assert_eq!(o.calc(), vec!["loud".to_owned(), "quiet".to_owned()]);
        // Votes reset after every interval.
        assert!(o.calc().is_empty());
    }

    #[test]
    fn test_filter_suppresses_short_bursts() {
        let o = AudioObserver::new(40, 1000, 20);
        o.add_stream("burst".to_owned());
        for _ in 0..3 {
            o.observe("burst", 10);
        }
        assert!(o.calc().is_empty());
    }

    #[test]
    fn test_add_remove_stream() {
        let o = AudioObserver::new(40, 1000, 20);
        o.add_stream("a".to_owned());
        o.add_stream("a".to_owned());
        for _ in 0..10 {
            o.observe("a", 10);
        }
        o.remove_stream("a");
        assert!(o.calc().is_empty());
    }
}
