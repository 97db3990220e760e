//! Acquisition configuration and its validation.
//!
//! A [`Configuration`] is only ever constructed in validated form, so the
//! collection thread can take a snapshot of it at the top of each cycle
//! without re-checking anything.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::ConfigError;

// ============================================================================
// Constants
// ============================================================================

/// Device ceiling on samples/s summed across all active channels.
pub const MAX_AGGREGATE_RATE: u32 = 50_000;

/// Sample rate used until the caller picks one.
pub const DEFAULT_SAMPLE_RATE: u32 = 5000;

/// Integration window used until the caller picks one, in seconds.
pub const DEFAULT_INTEGRATION_SECS: f64 = 2.0;

/// Longest accepted integration window, in seconds.
pub const MAX_INTEGRATION_SECS: f64 = 3600.0;

/// Fixed low rates offered before the 5 kHz-stepped range.
const BASE_RATE_CHOICES: [u32; 4] = [500, 1000, 2000, 5000];
const RATE_CHOICE_STEP: u32 = 5000;

// ============================================================================
// Channel identifiers
// ============================================================================

/// Index of an analog input. Displays as the device label (`AIN0`, `AIN1`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u8);

impl ChannelId {
    pub fn index(self) -> u8 {
        self.0
    }
}

impl From<u8> for ChannelId {
    fn from(value: u8) -> Self {
        ChannelId(value)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AIN{}", self.0)
    }
}

impl FromStr for ChannelId {
    type Err = String;

    /// Accepts `AIN<n>` (any case) or a bare index.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = match trimmed.get(..3) {
            Some(prefix) if prefix.eq_ignore_ascii_case("ain") => &trimmed[3..],
            _ => trimmed,
        };
        digits
            .parse::<u8>()
            .map(ChannelId)
            .map_err(|_| format!("invalid channel label {s:?}"))
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Channel set, per-channel sample rate and integration window.
///
/// Invariants (checked by every constructor):
/// - at least one channel, no duplicates, sorted ascending
/// - `rate > 0` and `rate × channels ≤ MAX_AGGREGATE_RATE`
/// - integration time finite, `> 0` and `≤ MAX_INTEGRATION_SECS`
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    channels: Vec<ChannelId>,
    rate: u32,
    integration_secs: f64,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            channels: vec![ChannelId(0)],
            rate: DEFAULT_SAMPLE_RATE,
            integration_secs: DEFAULT_INTEGRATION_SECS,
        }
    }
}

impl Configuration {
    pub fn new<I, C>(channels: I, rate: u32, integration_secs: f64) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = C>,
        C: Into<ChannelId>,
    {
        let mut channels: Vec<ChannelId> = channels.into_iter().map(Into::into).collect();
        channels.sort_unstable();
        if let Some(dup) = channels.windows(2).find(|w| w[0] == w[1]) {
            return Err(ConfigError::DuplicateChannel(dup[0]));
        }
        let config = Self {
            channels,
            rate,
            integration_secs,
        };
        config.validate()?;
        Ok(config)
    }

    /// Same rate and integration time, new channel set.
    pub fn with_channels<I, C>(&self, channels: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = C>,
        C: Into<ChannelId>,
    {
        Self::new(channels, self.rate, self.integration_secs)
    }

    /// Replace whichever of rate / integration time is given, keep the rest.
    pub fn with_sampling(
        &self,
        rate: Option<u32>,
        integration_secs: Option<f64>,
    ) -> Result<Self, ConfigError> {
        Self::new(
            self.channels.iter().copied(),
            rate.unwrap_or(self.rate),
            integration_secs.unwrap_or(self.integration_secs),
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels.is_empty() {
            return Err(ConfigError::EmptyChannels);
        }
        if self.rate == 0 {
            return Err(ConfigError::InvalidRate);
        }
        if !(self.integration_secs > 0.0 && self.integration_secs <= MAX_INTEGRATION_SECS) {
            return Err(ConfigError::InvalidIntegrationTime);
        }
        let aggregate = u64::from(self.rate) * self.channels.len() as u64;
        if aggregate > u64::from(MAX_AGGREGATE_RATE) {
            return Err(ConfigError::AggregateRateExceeded {
                rate: self.rate,
                channels: self.channels.len(),
                max: MAX_AGGREGATE_RATE,
            });
        }
        Ok(())
    }

    pub fn channels(&self) -> &[ChannelId] {
        &self.channels
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn integration_secs(&self) -> f64 {
        self.integration_secs
    }

    pub fn integration_time(&self) -> Duration {
        Duration::try_from_secs_f64(self.integration_secs).unwrap_or(Duration::ZERO)
    }

    /// Aggregate samples (all channels) that complete one window.
    pub fn integration_target(&self) -> u64 {
        (self.integration_secs * f64::from(self.rate) * self.channels.len() as f64).ceil() as u64
    }
}

/// Highest per-channel rate the device allows for `n_channels` active inputs.
pub fn max_rate_for(n_channels: usize) -> u32 {
    if n_channels == 0 {
        return MAX_AGGREGATE_RATE;
    }
    MAX_AGGREGATE_RATE / n_channels as u32
}

/// Selectable sample rates for `n_channels`, ascending.
pub fn rate_choices(n_channels: usize) -> Vec<u32> {
    let max = max_rate_for(n_channels);
    let stepped = (2..).map(|k| k * RATE_CHOICE_STEP).take_while(|&f| f <= max);
    BASE_RATE_CHOICES
        .iter()
        .copied()
        .filter(|&f| f <= max)
        .chain(stepped)
        .collect()
}
