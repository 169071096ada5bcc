//! Centralized configuration for the streaming picker.
//!
//! All tunable parameters are defined here to avoid hard-coded values
//! scattered throughout the picker, monitor and transporter.

use std::time::Duration;

use serde::Deserialize;

/// Errors raised when options or stream descriptors are rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Deadline thresholds used by the request monitor in one playback mode.
///
/// All values are seconds. A request younger than `min_delay` is never
/// inspected; `max_delay` bounds how long a request may stay in flight;
/// `offset` shifts the comparison between time left and time needed.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct DelayThresholds {
    pub min_delay: f64,
    pub max_delay: f64,
    pub offset: f64,
}

impl DelayThresholds {
    /// Thresholds applied while the player is consuming data.
    pub const PLAYING: Self = Self {
        min_delay: 5.0,
        max_delay: 20.0,
        offset: -0.5,
    };

    /// Thresholds applied while prebuffering or paused.
    pub const BUFFERING: Self = Self {
        min_delay: 7.5,
        max_delay: 30.0,
        offset: 10.0,
    };

    /// Minimum request age before inspection.
    pub fn min(&self) -> Duration {
        Duration::from_secs_f64(self.min_delay)
    }

    fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        if !self.min_delay.is_finite() || self.min_delay < 0.0 {
            return Err(ConfigError::invalid(field, "min_delay must be >= 0"));
        }
        if !self.max_delay.is_finite() || self.max_delay < self.min_delay {
            return Err(ConfigError::invalid(field, "max_delay must be >= min_delay"));
        }
        if !self.offset.is_finite() {
            return Err(ConfigError::invalid(field, "offset must be finite"));
        }
        Ok(())
    }
}

/// Options recognised by the picker, monitor and transporter.
///
/// Every option has a default; loading from any serde format fills in the
/// fields that are missing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PickerConfig {
    /// Number of locally held pieces below which partials are completed first
    pub rarest_first_cutoff: u32,
    /// Lowest interest level that still counts as "common"; shrinks by one per seed
    pub rarest_first_priority_cutoff: u32,
    /// Coarsening constant between priority classes
    pub priority_step: u32,
    /// Seconds of video gathered before playback starts
    pub prebuffer_seconds: f64,
    /// Seconds of video the high range covers at minimum
    pub buffer_seconds: f64,
    /// Refill loop period in milliseconds
    pub refill_interval_ms: u64,
    /// Request monitor thresholds while playing
    pub playing_delays: DelayThresholds,
    /// Request monitor thresholds while buffering
    pub buffering_delays: DelayThresholds,
    /// Measured playback rate must exceed this before it replaces the bitrate
    pub min_playback_rate_bps: u64,
    /// Multiplier of the high range length bounding the mid range
    pub mid_range_factor: u32,
    /// Upper bound on the high range in pieces
    pub high_range_max_pieces: u32,
    /// Lower bound on the high range in pieces
    pub high_range_min_pieces: u32,
    /// Upper bound on the high range in seconds
    pub high_range_max_seconds: f64,
    /// Seconds added to the high range per widening step
    pub high_range_step_seconds: f64,
    /// Pieces added to the high range per widening step
    pub high_range_step_pieces: u32,
    /// Averaging window of per-peer rate estimators, in seconds
    pub short_term_rate_period: f64,
    /// History kept by the bitrate predictor, in seconds
    pub bitrate_history: f64,
    /// Margin subtracted from piece deadlines, in milliseconds
    pub deadline_skew_ms: u64,
    /// Seed for the picker RNG; drawn from the OS when absent
    pub rng_seed: Option<u64>,
}

impl Default for PickerConfig {
    fn default() -> Self {
        Self {
            rarest_first_cutoff: 1,
            rarest_first_priority_cutoff: 3,
            priority_step: 20,
            prebuffer_seconds: 10.0,
            buffer_seconds: 5.0,
            refill_interval_ms: 100,
            playing_delays: DelayThresholds::PLAYING,
            buffering_delays: DelayThresholds::BUFFERING,
            min_playback_rate_bps: 32_768, // 256 Kbit/s
            mid_range_factor: 4,
            high_range_max_pieces: 1800,
            high_range_min_pieces: 5,
            high_range_max_seconds: 180.0,
            high_range_step_seconds: 10.0,
            high_range_step_pieces: 5,
            short_term_rate_period: 5.0,
            bitrate_history: 600.0, // 10 minutes
            deadline_skew_ms: 100,
            rng_seed: None,
        }
    }
}

impl PickerConfig {
    /// Parses options from a JSON document and validates them.
    ///
    /// # Errors
    /// - `ConfigError::Parse` - Document is not valid JSON for these options
    /// - `ConfigError::InvalidValue` - A parsed option is out of range
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Creates a reproducible configuration for tests.
    pub fn for_testing() -> Self {
        Self {
            rng_seed: Some(0x5eed),
            ..Self::default()
        }
    }

    /// Checks every option against its admissible range.
    ///
    /// # Errors
    /// - `ConfigError::InvalidValue` - First option found out of range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.priority_step == 0 {
            return Err(ConfigError::invalid("priority_step", "must be positive"));
        }
        if !self.prebuffer_seconds.is_finite() || self.prebuffer_seconds <= 0.0 {
            return Err(ConfigError::invalid("prebuffer_seconds", "must be positive"));
        }
        if !self.buffer_seconds.is_finite() || self.buffer_seconds <= 0.0 {
            return Err(ConfigError::invalid("buffer_seconds", "must be positive"));
        }
        if self.refill_interval_ms == 0 {
            return Err(ConfigError::invalid("refill_interval_ms", "must be positive"));
        }
        self.playing_delays.validate("playing_delays")?;
        self.buffering_delays.validate("buffering_delays")?;
        if self.mid_range_factor < 1 {
            return Err(ConfigError::invalid("mid_range_factor", "must be at least 1"));
        }
        if self.high_range_min_pieces == 0 || self.high_range_min_pieces > self.high_range_max_pieces
        {
            return Err(ConfigError::invalid(
                "high_range_min_pieces",
                format!(
                    "must be in 1..={} (high_range_max_pieces)",
                    self.high_range_max_pieces
                ),
            ));
        }
        if !self.high_range_max_seconds.is_finite()
            || self.high_range_max_seconds < self.buffer_seconds
        {
            return Err(ConfigError::invalid(
                "high_range_max_seconds",
                "must be at least buffer_seconds",
            ));
        }
        if !self.high_range_step_seconds.is_finite() || self.high_range_step_seconds < 0.0 {
            return Err(ConfigError::invalid("high_range_step_seconds", "must be >= 0"));
        }
        if !self.short_term_rate_period.is_finite() || self.short_term_rate_period <= 0.0 {
            return Err(ConfigError::invalid("short_term_rate_period", "must be positive"));
        }
        if !self.bitrate_history.is_finite() || self.bitrate_history <= 0.0 {
            return Err(ConfigError::invalid("bitrate_history", "must be positive"));
        }
        Ok(())
    }

    /// Refill loop period.
    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }

    /// Margin subtracted from piece deadlines.
    pub fn deadline_skew(&self) -> Duration {
        Duration::from_millis(self.deadline_skew_ms)
    }

    /// Averaging window of per-peer rate estimators.
    pub fn short_term_rate_window(&self) -> Duration {
        Duration::from_secs_f64(self.short_term_rate_period)
    }

    /// History kept by the bitrate predictor.
    pub fn bitrate_history_window(&self) -> Duration {
        Duration::from_secs_f64(self.bitrate_history)
    }
}

/// How the selected content is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Plain download, no playback position
    Bulk,
    /// Video on demand with a moving playback position
    Vod,
    /// Live stream over a wrap-around window of pieces
    Live,
}

/// Description of the content object being streamed.
///
/// Layered streams store each quality layer as a contiguous block of
/// `piece_count / layers` pieces; the selected file addresses the base layer.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    pub piece_length: u32,
    pub piece_count: u32,
    /// Total content size in bytes; the last piece may be short
    pub content_length: u64,
    /// Byte offset of the selected file inside the base layer
    pub file_offset: u64,
    /// Byte length of the selected file
    pub file_length: u64,
    pub mode: StreamMode,
    /// Nominal bitrate in bytes per second, when known from metadata
    pub bitrate: Option<u64>,
    /// Half width of the live valid window in pieces
    pub live_delta: Option<u32>,
    /// Whether a live stream recycles piece indices
    pub wraparound: bool,
    /// Whether the player may be paused on underrun
    pub pausable: bool,
    pub filename: Option<String>,
    pub mimetype: String,
    /// Number of quality layers
    pub layers: u32,
}

impl StreamDescriptor {
    fn with_mode(mode: StreamMode, piece_length: u32, piece_count: u32) -> Self {
        let content_length = u64::from(piece_length) * u64::from(piece_count);
        Self {
            piece_length,
            piece_count,
            content_length,
            file_offset: 0,
            file_length: content_length,
            mode,
            bitrate: None,
            live_delta: None,
            wraparound: mode == StreamMode::Live,
            pausable: true,
            filename: None,
            mimetype: "video/mp4".to_string(),
            layers: 1,
        }
    }

    /// Whole-content bulk download.
    pub fn bulk(piece_length: u32, piece_count: u32) -> Self {
        Self::with_mode(StreamMode::Bulk, piece_length, piece_count)
    }

    /// Video-on-demand playback of the whole content.
    pub fn vod(piece_length: u32, piece_count: u32) -> Self {
        Self::with_mode(StreamMode::Vod, piece_length, piece_count)
    }

    /// Live stream wrapping over all pieces.
    pub fn live(piece_length: u32, piece_count: u32) -> Self {
        let mut descriptor = Self::with_mode(StreamMode::Live, piece_length, piece_count);
        descriptor.mimetype = "video/mp2t".to_string();
        descriptor
    }

    /// Sets the real content length when the last piece is short.
    pub fn with_content_length(mut self, content_length: u64) -> Self {
        let trimmed_file = self.file_offset == 0 && self.file_length == self.content_length;
        self.content_length = content_length;
        if trimmed_file {
            self.file_length = content_length;
        }
        self
    }

    /// Live stream that never reuses a piece index, such as a recording in
    /// progress.
    pub fn without_wraparound(mut self) -> Self {
        self.wraparound = false;
        self
    }

    /// Selects a file inside the content.
    pub fn with_file(mut self, offset: u64, length: u64) -> Self {
        self.file_offset = offset;
        self.file_length = length;
        self
    }

    /// Sets the nominal bitrate known from metadata.
    pub fn with_bitrate(mut self, bytes_per_second: u64) -> Self {
        self.bitrate = Some(bytes_per_second);
        self
    }

    /// Overrides the live window half width.
    pub fn with_live_delta(mut self, delta: u32) -> Self {
        self.live_delta = Some(delta);
        self
    }

    /// Declares the number of quality layers.
    pub fn with_layers(mut self, layers: u32) -> Self {
        let whole_file = self.file_offset == 0 && self.file_length == self.content_length;
        self.layers = layers;
        if whole_file && layers > 1 {
            self.file_length = u64::from(self.piece_length) * u64::from(self.pieces_per_layer());
        }
        self
    }

    /// Sets player-facing file name and MIME type.
    pub fn with_name(mut self, filename: impl Into<String>, mimetype: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self.mimetype = mimetype.into();
        self
    }

    /// Marks the player as unable to pause.
    pub fn unpausable(mut self) -> Self {
        self.pausable = false;
        self
    }

    /// Pieces per quality layer.
    pub fn pieces_per_layer(&self) -> u32 {
        self.piece_count / self.layers.max(1)
    }

    /// Checks that the descriptor is internally consistent.
    ///
    /// # Errors
    /// - `ConfigError::InvalidValue` - Zero sizes, file outside the content,
    ///   layers not dividing the piece count, or a live window wider than the stream
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.piece_length == 0 {
            return Err(ConfigError::invalid("piece_length", "must be positive"));
        }
        if self.piece_count == 0 {
            return Err(ConfigError::invalid("piece_count", "must be positive"));
        }
        if self.layers == 0 || self.piece_count % self.layers != 0 {
            return Err(ConfigError::invalid(
                "layers",
                format!("must divide piece count {}", self.piece_count),
            ));
        }

        let piece_length = u64::from(self.piece_length);
        let max_length = piece_length * u64::from(self.piece_count);
        let min_length = max_length - piece_length;
        if self.content_length <= min_length || self.content_length > max_length {
            return Err(ConfigError::invalid(
                "content_length",
                format!("must be in ({min_length}, {max_length}]"),
            ));
        }

        let layer_bytes = if self.layers == 1 {
            self.content_length
        } else {
            piece_length * u64::from(self.pieces_per_layer())
        };
        if self.file_length == 0 {
            return Err(ConfigError::invalid("file_length", "must be positive"));
        }
        if self.file_offset + self.file_length > layer_bytes {
            return Err(ConfigError::invalid(
                "file_length",
                format!("file ends past the base layer ({layer_bytes} bytes)"),
            ));
        }

        if let Some(bitrate) = self.bitrate
            && bitrate == 0
        {
            return Err(ConfigError::invalid("bitrate", "must be positive"));
        }

        if self.mode == StreamMode::Live {
            let span = self.pieces_per_layer();
            if let Some(delta) = self.live_delta
                && (delta == 0 || 2 * u64::from(delta) + 1 > u64::from(span))
            {
                return Err(ConfigError::invalid(
                    "live_delta",
                    format!("window of {delta} does not fit {span} pieces"),
                ));
            }
            if span < 3 {
                return Err(ConfigError::invalid("piece_count", "live needs 3 pieces"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PickerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rarest_first_cutoff, 1);
        assert_eq!(config.rarest_first_priority_cutoff, 3);
        assert_eq!(config.priority_step, 20);
        assert_eq!(config.refill_interval(), Duration::from_millis(100));
        assert_eq!(config.playing_delays, DelayThresholds::PLAYING);
        assert_eq!(config.min_playback_rate_bps, 32_768);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config =
            PickerConfig::from_json(r#"{"priority_step": 10, "prebuffer_seconds": 4.5}"#).unwrap();
        assert_eq!(config.priority_step, 10);
        assert_eq!(config.prebuffer_seconds, 4.5);
        assert_eq!(config.buffer_seconds, 5.0);
        assert_eq!(config.buffering_delays, DelayThresholds::BUFFERING);
    }

    #[test]
    fn test_invalid_json_values_rejected() {
        let err = PickerConfig::from_json(r#"{"priority_step": 0}"#).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "priority_step",
                ..
            }
        ));

        let err = PickerConfig::from_json(r#"{"priority_step": "many"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_delay_thresholds_must_be_ordered() {
        let config = PickerConfig {
            playing_delays: DelayThresholds {
                min_delay: 10.0,
                max_delay: 5.0,
                offset: 0.0,
            },
            ..PickerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(StreamDescriptor::vod(16384, 100).validate().is_ok());
        assert!(StreamDescriptor::vod(0, 100).validate().is_err());
        assert!(
            StreamDescriptor::vod(16384, 100)
                .with_file(16384 * 99, 16385)
                .validate()
                .is_err()
        );
        assert!(
            StreamDescriptor::vod(16384, 100)
                .with_content_length(16384 * 99 + 1)
                .validate()
                .is_ok()
        );
        assert!(
            StreamDescriptor::vod(16384, 100)
                .with_content_length(16384 * 99)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_live_descriptor_window_must_fit() {
        assert!(StreamDescriptor::live(1024, 1000).validate().is_ok());
        assert!(
            StreamDescriptor::live(1024, 1000)
                .with_live_delta(500)
                .validate()
                .is_err()
        );
        assert!(
            StreamDescriptor::live(1024, 1000)
                .with_live_delta(499)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_layers_must_divide_piece_count() {
        assert!(StreamDescriptor::vod(1024, 90).with_layers(3).validate().is_ok());
        assert!(StreamDescriptor::vod(1024, 91).with_layers(3).validate().is_err());
    }
}
