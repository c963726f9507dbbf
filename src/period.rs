use chrono::{DateTime, Duration, NaiveTime, Utc};

/// Length of the floating analysis window used by ingestion and reconciliation.
pub const ANALYSIS_WINDOW_DAYS: i64 = 30;

const MAX_PERIOD_DAYS: i64 = 365;

/// Half-open UTC window `[start, end)` over which ratings are aggregated.
///
/// The window every pipeline component works with comes from
/// [`Period::current_window`]; both the consumer and the reconciliation job
/// derive it from wall-clock time, so they agree on one key per UTC day by
/// construction instead of by convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidPeriodError {
    #[error("Period start {start} is not before end {end}")]
    StartNotBeforeEnd {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("Period spans {days} days, maximum is {MAX_PERIOD_DAYS}")]
    TooLong { days: i64 },
}

impl Period {
    /// Create a validated window. `start` must precede `end` and the span may
    /// not exceed 365 days.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, InvalidPeriodError> {
        if start >= end {
            return Err(InvalidPeriodError::StartNotBeforeEnd { start, end });
        }

        let days = (end - start).num_days();
        if days > MAX_PERIOD_DAYS {
            return Err(InvalidPeriodError::TooLong { days });
        }

        Ok(Self { start, end })
    }

    /// The trailing 30-day window ending at the next UTC midnight after `now`.
    ///
    /// Anchoring the end to a day boundary keeps the window stable for the
    /// whole processing day: every event consumed on one UTC day lands in the
    /// same aggregate key, and the reconciliation runs of that day re-rank
    /// exactly that key.
    pub fn current_window(now: DateTime<Utc>) -> Self {
        let day_start = now.date_naive().and_time(NaiveTime::MIN).and_utc();
        let end = day_start + Duration::days(1);
        let start = end - Duration::days(ANALYSIS_WINDOW_DAYS);

        Self { start, end }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }
}
