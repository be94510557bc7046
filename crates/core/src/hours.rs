use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc, Weekday};

use crate::config::ClinicConfig;

/// Static weekly operating schedule. All candidate times are normalized into
/// the clinic's fixed offset before comparison; both window bounds are
/// inclusive, so a candidate exactly at open or close is valid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClinicHours {
    weekdays: Vec<Weekday>,
    open: NaiveTime,
    close: NaiveTime,
    offset: FixedOffset,
}

impl ClinicHours {
    pub fn new(
        weekdays: Vec<Weekday>,
        open: NaiveTime,
        close: NaiveTime,
        offset: FixedOffset,
    ) -> Self {
        Self { weekdays, open, close, offset }
    }

    pub fn from_config(config: &ClinicConfig) -> Self {
        Self::new(config.weekdays(), config.open_time(), config.close_time(), config.offset())
    }

    pub fn is_open(&self, candidate: DateTime<Utc>) -> bool {
        let local = candidate.with_timezone(&self.offset);
        let time = local.time();
        self.weekdays.contains(&local.weekday()) && time >= self.open && time <= self.close
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Human-readable schedule for the operating-hours reply. A consecutive
    /// run of weekdays renders as a range; anything else is listed in full.
    pub fn describe(&self) -> String {
        let days = match self.weekdays.as_slice() {
            [] => "no days".to_string(),
            [only] => format!("{only:?}"),
            run if is_consecutive(run) => {
                format!("{:?}-{:?}", run[0], run[run.len() - 1])
            }
            list => {
                list.iter().map(|day| format!("{day:?}")).collect::<Vec<_>>().join(", ")
            }
        };
        format!(
            "{days}, {} to {}",
            self.open.format("%-I:%M%P"),
            self.close.format("%-I:%M%P")
        )
    }
}

fn is_consecutive(days: &[Weekday]) -> bool {
    days.windows(2).all(|pair| pair[1] == pair[0].succ())
}

impl Default for ClinicHours {
    fn default() -> Self {
        Self::from_config(&ClinicConfig::default())
    }
}
