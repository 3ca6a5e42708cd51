use serde::Deserialize;

/// How VP8 picture id continuity is restored when a simulcast layer changes
/// its upstream SSRC (the upstream may continue its picture id sequence or
/// restart it, and the two cases need different offset handling).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vp8PictureIdPolicy {
    /// Re-anchor rewrite offsets from the first packet of the new layer.
    ReanchorOnSwitch,
    /// Trust the upstream to continue counting and keep the per-SSRC delta.
    AssumeContinuous,
}

impl Default for Vp8PictureIdPolicy {
    fn default() -> Self {
        Vp8PictureIdPolicy::ReanchorOnSwitch
    }
}

/// Simulcast layer selection policy.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct SimulcastConfig {
    /// Initially forward the highest available spatial layer to a new
    /// subscriber instead of the lowest.
    pub best_quality_first: bool,
    /// Apply the VP8 temporal filter on down tracks.
    pub enable_temporal_layer: bool,
    pub picture_id_policy: Vp8PictureIdPolicy,
}

/// Audio level observer parameters, RFC 6464 levels in negated dBov
/// (0 is loudest, 127 silence).
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct AudioLevelConfig {
    /// Streams quieter than this are ignored.
    pub threshold: u8,
    /// Observation interval in milliseconds.
    pub interval: u64,
    /// Percent of the interval a stream must be audible to count as active.
    pub filter: u8,
}

impl Default for AudioLevelConfig {
    fn default() -> Self {
        AudioLevelConfig {
            threshold: 40,
            interval: 1000,
            filter: 20,
        }
    }
}

/// Per-publisher router configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Ingest rate cap per video track in kbps; 0 disables the cap.
    pub max_bandwidth: u64,
    /// Bucket slots per video SSRC.
    pub max_packet_track: usize,
    /// Maintain per-stream stats and A/V drift.
    pub with_stats: bool,
    pub simulcast: SimulcastConfig,
    pub audio_level: AudioLevelConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            max_bandwidth: 0,
            max_packet_track: 500,
            with_stats: false,
            simulcast: SimulcastConfig::default(),
            audio_level: AudioLevelConfig::default(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = RouterConfig::default();
        assert_eq!(c.max_packet_track, 500);
        assert_eq!(c.audio_level.interval, 1000);
        assert_eq!(
            c.simulcast.picture_id_policy,
            Vp8PictureIdPolicy::ReanchorOnSwitch
        );
    }
}
