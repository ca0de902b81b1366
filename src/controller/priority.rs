use chrono::{DateTime, Duration, Utc};
use ordered_float::OrderedFloat;
use serde::Serialize;
use std::collections::BTreeSet;
use strum::Display;
use tracing::{debug, info};

use crate::domain::{BatteryId, BatteryUnit, FlowDirection};

/// Ordered, direction-dependent list of eligible batteries
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PriorityList {
    pub direction: FlowDirection,
    pub ids: Vec<BatteryId>,
}

impl PriorityList {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn top(&self, n: usize) -> &[BatteryId] {
        &self.ids[..n.min(self.ids.len())]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
enum RefreshReason {
    Initial,
    DirectionChanged,
    IntervalElapsed,
    EligibilityChanged,
}

/// Default spacing between two re-rankings not caused by a direction change
pub const MIN_REFRESH_SECONDS: u64 = 10;

/// Ranks batteries by SoC: emptiest first when charging, fullest first when
/// discharging. The order is re-evaluated only on a trigger; bound checks run
/// every tick.
///
/// Interval and eligibility triggers are rate limited to one re-ranking per
/// `min_refresh`. A unit that became eligible inside that window joins the
/// list at the next re-ranking.
#[derive(Debug, Clone)]
pub struct PriorityRanker {
    interval: Duration,
    min_refresh: Duration,
    order: Vec<BatteryId>,
    direction: FlowDirection,
    eligible: BTreeSet<BatteryId>,
    last_refresh: Option<DateTime<Utc>>,
}

impl PriorityRanker {
    pub fn new(interval_minutes: u64) -> Self {
        Self {
            interval: Duration::minutes(interval_minutes as i64),
            min_refresh: Duration::seconds(MIN_REFRESH_SECONDS as i64),
            order: Vec::new(),
            direction: FlowDirection::Idle,
            eligible: BTreeSet::new(),
            last_refresh: None,
        }
    }

    pub fn with_min_refresh(mut self, seconds: u64) -> Self {
        self.min_refresh = Duration::seconds(seconds as i64);
        self
    }

    pub fn refresh(
        &mut self,
        units: &[BatteryUnit],
        direction: FlowDirection,
        now: DateTime<Utc>,
    ) -> PriorityList {
        let eligible: BTreeSet<BatteryId> = units
            .iter()
            .filter(|u| u.eligible_for(direction))
            .map(|u| u.id)
            .collect();

        if let Some(reason) = self.refresh_reason(direction, &eligible, now) {
            self.order = Self::rank(units, direction);
            self.direction = direction;
            self.eligible = eligible.clone();
            self.last_refresh = Some(now);
            if reason == RefreshReason::IntervalElapsed {
                debug!(%reason, %direction, order = ?self.order, "battery priority recalculated");
            } else {
                info!(%reason, %direction, order = ?self.order, "battery priority recalculated");
            }
        }

        PriorityList {
            direction,
            ids: self
                .order
                .iter()
                .copied()
                .filter(|id| eligible.contains(id))
                .collect(),
        }
    }

    fn refresh_reason(
        &self,
        direction: FlowDirection,
        eligible: &BTreeSet<BatteryId>,
        now: DateTime<Utc>,
    ) -> Option<RefreshReason> {
        let Some(last) = self.last_refresh else {
            return Some(RefreshReason::Initial);
        };
        if direction != self.direction {
            return Some(RefreshReason::DirectionChanged);
        }
        let reason = if *eligible != self.eligible {
            RefreshReason::EligibilityChanged
        } else if now - last >= self.interval {
            RefreshReason::IntervalElapsed
        } else {
            return None;
        };
        if now - last < self.min_refresh {
            debug!(%reason, "battery priority refresh rate-limited");
            return None;
        }
        Some(reason)
    }

    fn rank(units: &[BatteryUnit], direction: FlowDirection) -> Vec<BatteryId> {
        let mut ranked: Vec<&BatteryUnit> =
            units.iter().filter(|u| u.eligible_for(direction)).collect();
        ranked.sort_by(|a, b| {
            let by_soc = OrderedFloat(a.soc_percent).cmp(&OrderedFloat(b.soc_percent));
            let by_soc = if direction == FlowDirection::Discharging {
                by_soc.reverse()
            } else {
                by_soc
            };
            by_soc.then(a.id.cmp(&b.id))
        });
        ranked.into_iter().map(|u| u.id).collect()
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.last_refresh
    }

    pub fn direction(&self) -> FlowDirection {
        self.direction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BatteryLimits;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn units(socs: &[f64]) -> Vec<BatteryUnit> {
        socs.iter()
            .enumerate()
            .map(|(i, soc)| BatteryUnit {
                soc_percent: *soc,
                available: true,
                ..BatteryUnit::new(BatteryId(i as u8 + 1), format!("b{}", i + 1), BatteryLimits::default())
            })
            .collect()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_charging_ranks_emptiest_first() {
        let mut r = PriorityRanker::new(15);
        let list = r.refresh(&units(&[60.0, 20.0, 40.0]), FlowDirection::Charging, t0());
        assert_eq!(list.ids, vec![BatteryId(2), BatteryId(3), BatteryId(1)]);
    }

    #[test]
    fn test_discharging_ranks_fullest_first() {
        let mut r = PriorityRanker::new(15);
        let list = r.refresh(&units(&[60.0, 20.0, 40.0]), FlowDirection::Discharging, t0());
        assert_eq!(list.ids, vec![BatteryId(1), BatteryId(3), BatteryId(2)]);
    }

    #[test]
    fn test_ties_break_by_slot() {
        let mut r = PriorityRanker::new(15);
        let list = r.refresh(&units(&[50.0, 50.0, 50.0]), FlowDirection::Discharging, t0());
        assert_eq!(list.ids, vec![BatteryId(1), BatteryId(2), BatteryId(3)]);
    }

    #[test]
    fn test_order_is_held_until_interval_elapses() {
        let mut r = PriorityRanker::new(15);
        r.refresh(&units(&[30.0, 40.0]), FlowDirection::Charging, t0());

        // b1 overtakes b2 but the order is cached
        let later = t0() + Duration::minutes(5);
        let list = r.refresh(&units(&[45.0, 40.0]), FlowDirection::Charging, later);
        assert_eq!(list.ids, vec![BatteryId(1), BatteryId(2)]);

        let due = t0() + Duration::minutes(15);
        let list = r.refresh(&units(&[45.0, 40.0]), FlowDirection::Charging, due);
        assert_eq!(list.ids, vec![BatteryId(2), BatteryId(1)]);
        assert_eq!(r.last_refresh(), Some(due));
    }

    #[test]
    fn test_direction_change_refreshes_immediately() {
        let mut r = PriorityRanker::new(15);
        r.refresh(&units(&[30.0, 40.0]), FlowDirection::Charging, t0());
        let list = r.refresh(
            &units(&[30.0, 40.0]),
            FlowDirection::Discharging,
            t0() + Duration::seconds(2),
        );
        assert_eq!(list.ids, vec![BatteryId(2), BatteryId(1)]);
        assert_eq!(r.direction(), FlowDirection::Discharging);
    }

    #[test]
    fn test_unit_crossing_bound_is_dropped_at_once() {
        let mut r = PriorityRanker::new(15);
        r.refresh(&units(&[30.0, 40.0]), FlowDirection::Charging, t0());
        let list = r.refresh(
            &units(&[95.0, 40.0]),
            FlowDirection::Charging,
            t0() + Duration::seconds(2),
        );
        assert_eq!(list.ids, vec![BatteryId(2)]);
    }

    #[test]
    fn test_eligibility_refresh_is_rate_limited() {
        let mut r = PriorityRanker::new(15);
        let mut us = units(&[30.0, 40.0]);
        us[1].available = false;
        let list = r.refresh(&us, FlowDirection::Charging, t0());
        assert_eq!(list.ids, vec![BatteryId(1)]);

        us[1].available = true;
        let list = r.refresh(&us, FlowDirection::Charging, t0() + Duration::seconds(4));
        assert_eq!(list.ids, vec![BatteryId(1)]);
        assert_eq!(r.last_refresh(), Some(t0()));

        let list = r.refresh(&us, FlowDirection::Charging, t0() + Duration::seconds(10));
        assert_eq!(list.ids, vec![BatteryId(1), BatteryId(2)]);
    }

    #[test]
    fn test_direction_change_bypasses_rate_limit() {
        let mut r = PriorityRanker::new(15).with_min_refresh(60);
        let us = units(&[30.0, 40.0]);
        r.refresh(&us, FlowDirection::Charging, t0());
        let list = r.refresh(&us, FlowDirection::Discharging, t0() + Duration::seconds(1));
        assert_eq!(list.ids, vec![BatteryId(2), BatteryId(1)]);
    }

    #[test]
    fn test_idle_direction_yields_empty_list() {
        let mut r = PriorityRanker::new(15);
        assert!(r.refresh(&units(&[30.0]), FlowDirection::Idle, t0()).is_empty());
    }

    proptest! {
        #[test]
        fn prop_ranking_sorted_and_bounded(
            socs in prop::collection::vec(0.0f64..100.0, 1..=3),
            charging in any::<bool>(),
        ) {
            let direction = if charging { FlowDirection::Charging } else { FlowDirection::Discharging };
            let us = units(&socs);
            let mut r = PriorityRanker::new(15);
            let first = r.refresh(&us, direction, t0());
            let again = r.refresh(&us, direction, t0() + Duration::seconds(1));
            prop_assert_eq!(&first, &again);

            let ranked: Vec<&BatteryUnit> = first
                .ids
                .iter()
                .map(|id| us.iter().find(|u| u.id == *id).unwrap())
                .collect();
            for u in &ranked {
                prop_assert!(u.eligible_for(direction));
            }
            prop_assert_eq!(ranked.len(), us.iter().filter(|u| u.eligible_for(direction)).count());
            for pair in ranked.windows(2) {
                if charging {
                    prop_assert!(pair[0].soc_percent <= pair[1].soc_percent);
                } else {
                    prop_assert!(pair[0].soc_percent >= pair[1].soc_percent);
                }
            }
        }
    }
}
