//! Temporal alignment of the reading stream against the state-change stream.
//!
//! Every reading inherits the attributes of the state change with the greatest
//! timestamp that is `<=` its own, or the caller's sentinel attributes when no
//! such change exists. Both inputs must already be sorted ascending; the
//! engine verifies this rather than re-sorting.
//!
//! The stitch works on segment boundaries: each state change is located in the
//! reading sequence with a left-biased binary search, a virtual marker at
//! index 0 carries the sentinel and a virtual marker at `len` closes the last
//! segment. Consecutive markers delimit a half-open index range of readings.

use crate::core::error::PreconditionError;
use crate::core::record::{first_unsorted, AnnotatedReading, Fields, Reading, StateChange, StreamKind};

/// A run of consecutive readings sharing one regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// First reading index (inclusive)
    pub start: usize,
    /// One past the last reading index
    pub end: usize,
    /// Index of the originating state change, `None` for the sentinel
    pub source: Option<usize>,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

fn check_sorted(readings: &[Reading], changes: &[StateChange]) -> Result<(), PreconditionError> {
    if let Some(index) = first_unsorted(readings.iter().map(|r| r.timestamp)) {
        return Err(PreconditionError::Unsorted {
            stream: StreamKind::Readings,
            index,
        });
    }
    if let Some(index) = first_unsorted(changes.iter().map(|c| c.timestamp)) {
        return Err(PreconditionError::Unsorted {
            stream: StreamKind::StateChanges,
            index,
        });
    }
    Ok(())
}

/// Compute the segment partition of `readings` induced by `changes`.
///
/// The returned segments are in order, contiguous, and their lengths sum to
/// `readings.len()`. A change whose insertion point collides with the next
/// change's, or that lies after the last reading, yields an empty segment.
pub fn segments(
    readings: &[Reading],
    changes: &[StateChange],
) -> Result<Vec<Segment>, PreconditionError> {
    check_sorted(readings, changes)?;

    // (index, source) markers, leading sentinel first.
    let mut markers: Vec<(usize, Option<usize>)> = Vec::with_capacity(changes.len() + 1);
    markers.push((0, None));
    for (k, change) in changes.iter().enumerate() {
        let idx = readings.partition_point(|r| r.timestamp < change.timestamp);
        markers.push((idx, Some(k)));
    }

    let mut out = Vec::with_capacity(markers.len());
    for (i, &(start, source)) in markers.iter().enumerate() {
        let end = markers.get(i + 1).map_or(readings.len(), |&(idx, _)| idx);
        out.push(Segment { start, end, source });
    }
    Ok(out)
}

/// Annotate every reading with the regime active at its timestamp.
///
/// Output has exactly one entry per reading, in input order. Fails with
/// [`PreconditionError::Unsorted`] if either input is not ascending.
pub fn align(
    readings: &[Reading],
    changes: &[StateChange],
    unset: &Fields,
) -> Result<Vec<AnnotatedReading>, PreconditionError> {
    if readings.is_empty() {
        check_sorted(readings, changes)?;
        return Ok(Vec::new());
    }

    let segments = segments(readings, changes)?;

    let mut out = Vec::with_capacity(readings.len());
    let mut superseded = 0usize;
    for segment in &segments {
        if segment.is_empty() {
            if segment.source.is_some() {
                superseded += 1;
            }
            continue;
        }
        let attrs = match segment.source {
            Some(k) => &changes[k].attributes,
            None => unset,
        };
        out.extend(
            readings[segment.start..segment.end]
                .iter()
                .map(|reading| AnnotatedReading {
                    reading: reading.clone(),
                    attributes: attrs.clone(),
                }),
        );
    }

    tracing::debug!(
        readings = readings.len(),
        state_changes = changes.len(),
        superseded,
        "aligned readings"
    );

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::{unset_attributes, Value, BATCH_ID};
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn readings(times: &[i64]) -> Vec<Reading> {
        times
            .iter()
            .map(|&t| Reading::new(ts(t)).with("machine_name", "m1"))
            .collect()
    }

    fn batch(t: i64, id: &str) -> StateChange {
        StateChange::new(ts(t)).with(BATCH_ID, id)
    }

    fn batches(aligned: &[AnnotatedReading]) -> Vec<String> {
        aligned
            .iter()
            .map(|a| a.attribute(BATCH_ID).map(Value::to_string).unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_forward_fill_between_changes() {
        let r = readings(&[10, 20, 30, 40]);
        let s = vec![batch(15, "A"), batch(35, "B")];

        let aligned = align(&r, &s, &unset_attributes()).unwrap();
        assert_eq!(batches(&aligned), ["unset", "A", "A", "B"]);
    }

    #[test]
    fn test_no_state_changes_yields_sentinel() {
        let r = readings(&[10, 20, 30]);
        let aligned = align(&r, &[], &unset_attributes()).unwrap();
        assert_eq!(batches(&aligned), ["unset", "unset", "unset"]);
    }

    #[test]
    fn test_change_before_all_readings() {
        let r = readings(&[10, 20, 30]);
        let aligned = align(&r, &[batch(5, "A")], &unset_attributes()).unwrap();
        assert_eq!(batches(&aligned), ["A", "A", "A"]);
    }

    #[test]
    fn test_colliding_changes_last_wins() {
        let r = readings(&[10, 20, 30]);
        let s = vec![batch(20, "A"), batch(20, "B")];

        let aligned = align(&r, &s, &unset_attributes()).unwrap();
        assert_eq!(batches(&aligned), ["unset", "B", "B"]);

        let segs = segments(&r, &s).unwrap();
        assert!(segs[1].is_empty());
        assert_eq!(segs[1].source, Some(0));
    }

    #[test]
    fn test_reading_at_changeover_sees_new_state() {
        let r = readings(&[10, 20]);
        let aligned = align(&r, &[batch(20, "A")], &unset_attributes()).unwrap();
        assert_eq!(batches(&aligned), ["unset", "A"]);
    }

    #[test]
    fn test_change_after_last_reading_dropped() {
        let r = readings(&[10, 20]);
        let s = vec![batch(15, "A"), batch(99, "Z")];

        let aligned = align(&r, &s, &unset_attributes()).unwrap();
        assert_eq!(batches(&aligned), ["unset", "A"]);

        let segs = segments(&r, &s).unwrap();
        assert_eq!(segs.last().unwrap().len(), 0);
    }

    #[test]
    fn test_empty_readings() {
        let aligned = align(&[], &[batch(1, "A")], &unset_attributes()).unwrap();
        assert!(aligned.is_empty());
    }

    #[test]
    fn test_unsorted_inputs_rejected() {
        let r = readings(&[10, 5]);
        let err = align(&r, &[], &unset_attributes()).unwrap_err();
        assert_eq!(
            err,
            PreconditionError::Unsorted {
                stream: StreamKind::Readings,
                index: 1
            }
        );

        let r = readings(&[10, 20]);
        let s = vec![batch(30, "B"), batch(15, "A")];
        let err = align(&r, &s, &unset_attributes()).unwrap_err();
        assert!(matches!(
            err,
            PreconditionError::Unsorted {
                stream: StreamKind::StateChanges,
                ..
            }
        ));
    }

    #[test]
    fn test_repeated_reading_timestamps_keep_order() {
        let mut r = readings(&[10, 10, 20]);
        r[0] = r[0].clone().with("count", 1i64);
        r[1] = r[1].clone().with("count", 2i64);

        let aligned = align(&r, &[batch(10, "A")], &unset_attributes()).unwrap();
        assert_eq!(batches(&aligned), ["A", "A", "A"]);
        assert_eq!(aligned[0].reading.get("count"), Some(&Value::Int(1)));
        assert_eq!(aligned[1].reading.get("count"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_segments_partition_and_match_greatest_preceding() {
        let times: Vec<i64> = (0..50).map(|i| i * 7 % 13 + i * 3).collect();
        let mut times_sorted = times.clone();
        times_sorted.sort();
        let r = readings(&times_sorted);
        let s: Vec<StateChange> = [0i64, 12, 12, 40, 77, 150, 500]
            .iter()
            .enumerate()
            .map(|(k, &t)| batch(t, &format!("b{k}")))
            .collect();

        let segs = segments(&r, &s).unwrap();
        assert_eq!(segs.iter().map(Segment::len).sum::<usize>(), r.len());
        assert!(segs.windows(2).all(|w| w[0].end == w[1].start));

        let aligned = align(&r, &s, &unset_attributes()).unwrap();
        assert_eq!(aligned.len(), r.len());

        let mut last_source = None;
        for a in &aligned {
            let expected = s
                .iter()
                .enumerate()
                .filter(|(_, c)| c.timestamp <= a.timestamp())
                .last();
            match expected {
                Some((k, c)) => {
                    assert_eq!(a.attributes, c.attributes);
                    assert!(last_source.map_or(true, |prev| prev <= k));
                    last_source = Some(k);
                }
                None => assert_eq!(a.attributes, unset_attributes()),
            }
        }

        let again = align(&r, &s, &unset_attributes()).unwrap();
        assert_eq!(aligned, again);
    }
}
