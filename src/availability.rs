use chrono::{DateTime, Utc};
use serde::Serialize;
use crate::classes::ClassRecord;
use crate::schedules::ScheduleRecord;

/// Read-side projection of one session: the record itself plus the live
/// seat count, computed at query time and never cached.
#[derive(Serialize, Debug)]
pub struct ScheduleView {
    #[serde(flatten)]
    pub schedule: ScheduleRecord,
    pub class: ClassRecord,
    pub enrolled: i64,
    pub spots_available: i64,
    pub has_started: bool,
    pub is_bookable: bool,
}

/// Remaining seats, clamped to zero when a capacity edit shrank the class
/// below its current enrollment count.
pub fn spots_available(capacity: i64, enrolled: i64) -> i64 {
    (capacity - enrolled).max(0)
}

pub fn has_started(schedule: &ScheduleRecord, now: DateTime<Utc>) -> bool {
    now >= schedule.start_time.to_utc()
}

pub fn is_bookable(schedule: &ScheduleRecord, capacity: i64, enrolled: i64, now: DateTime<Utc>) -> bool {
    spots_available(capacity, enrolled) > 0 && !has_started(schedule, now)
}

pub fn view(schedule: ScheduleRecord, class: ClassRecord, enrolled: i64, now: DateTime<Utc>) -> ScheduleView {
    let spots = spots_available(class.capacity, enrolled);
    let started = has_started(&schedule, now);
    ScheduleView {
        is_bookable: is_bookable(&schedule, class.capacity, enrolled, now),
        has_started: started,
        spots_available: spots,
        enrolled,
        class,
        schedule,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spots_available_clamped() {
        assert_eq!(spots_available(10, 3), 7);
        assert_eq!(spots_available(10, 10), 0);
        // capacity edited below the enrolled count reads as full, never negative
        assert_eq!(spots_available(2, 5), 0);
        for capacity in 0..=12 {
            for enrolled in 0..=12 {
                let spots = spots_available(capacity, enrolled);
                assert!(spots >= 0 && spots <= capacity.max(0));
            }
        }
    }
}
