//! Heart-rate sample as produced by a source adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Validation errors raised when constructing a [`Sample`].
#[derive(Debug, Clone, PartialEq)]
pub enum SampleError {
    NegativeBpm(f64),
    NonFiniteBpm,
    EndBeforeStart {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    BeforeEpoch(DateTime<Utc>),
    EmptySource,
}

impl Display for SampleError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NegativeBpm(value) => write!(f, "bpm must be >= 0, got {value}"),
            Self::NonFiniteBpm => write!(f, "bpm must be a finite number"),
            Self::EndBeforeStart { start, end } => {
                write!(f, "sample end {end} is earlier than start {start}")
            }
            Self::BeforeEpoch(end) => write!(f, "sample end {end} is before the unix epoch"),
            Self::EmptySource => write!(f, "sample source name cannot be empty"),
        }
    }
}

impl Error for SampleError {}

/// One discrete heart-rate reading.
///
/// `bpm` keeps the platform quantity as reported (it may be fractional);
/// rounding happens when the sample becomes a
/// [`CanonicalRecord`](crate::model::record::CanonicalRecord).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    bpm: f64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    source_name: String,
}

impl Sample {
    /// Creates a validated sample.
    ///
    /// # Errors
    /// - `bpm` is negative or not finite.
    /// - `end` is earlier than `start` or earlier than the unix epoch.
    /// - `source_name` is blank.
    pub fn new(
        bpm: f64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        source_name: impl Into<String>,
    ) -> Result<Self, SampleError> {
        if !bpm.is_finite() {
            return Err(SampleError::NonFiniteBpm);
        }
        if bpm < 0.0 {
            return Err(SampleError::NegativeBpm(bpm));
        }
        if end < start {
            return Err(SampleError::EndBeforeStart { start, end });
        }
        if end.timestamp_millis() < 0 {
            return Err(SampleError::BeforeEpoch(end));
        }
        let source_name = source_name.into().trim().to_string();
        if source_name.is_empty() {
            return Err(SampleError::EmptySource);
        }

        Ok(Self {
            bpm,
            start,
            end,
            source_name,
        })
    }

    /// Point reading where start and end coincide.
    pub fn instant(
        bpm: f64,
        at: DateTime<Utc>,
        source_name: impl Into<String>,
    ) -> Result<Self, SampleError> {
        Self::new(bpm, at, at, source_name)
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }
}

/// Unvalidated sample shape as read from external input (e.g. JSON lines).
#[derive(Debug, Clone, Deserialize)]
pub struct RawSample {
    pub bpm: f64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub source: String,
}

impl TryFrom<RawSample> for Sample {
    type Error = SampleError;

    fn try_from(value: RawSample) -> Result<Self, Self::Error> {
        Sample::new(value.bpm, value.start, value.end, value.source)
    }
}
