use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::bail;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// A sequence number the client knows it has not (yet) processed
#[derive(Debug, Clone, PartialEq)]
pub enum MissedSlot {
    /// content unknown, `attempts` retransmission requests were issued so far
    Pending { attempts: u32 },
    /// content was received but is held back until earlier slots are resolved
    Buffered(Vec<Value>),
}

/// Tracks the server-assigned sequence numbers of task frames, detecting gaps and keeping track
///  of missed frames until they are retransmitted or given up.
///
/// Sequence numbers are handed out by the server per session, so all state is reset when a new
///  session is established.
pub struct SequenceTracker {
    received_count: u64,
    slots: BTreeMap<u64, MissedSlot>,
    last_housekeeping: Instant,
}

impl SequenceTracker {
    pub fn new(now: Instant) -> SequenceTracker {
        SequenceTracker {
            received_count: 0,
            slots: Default::default(),
            last_housekeeping: now,
        }
    }

    /// Fresh baseline for a new session: the CONNECT frame itself counts as the first frame
    pub fn reset(&mut self, now: Instant) {
        self.received_count = 1;
        self.slots.clear();
        self.last_housekeeping = now;
    }

    pub fn received_count(&self) -> u64 {
        self.received_count
    }

    pub fn is_new(&self, sequence: u64) -> bool {
        sequence > self.received_count
    }

    /// Registers a newly received sequence number, returning the numbers that were skipped
    ///  and should be requested for retransmission. A jump by more than `max_gap` missing
    ///  frames is rejected, and nothing changes.
    pub fn on_sequence(&mut self, sequence: u64, max_gap: u64) -> anyhow::Result<Vec<u64>> {
        if !self.is_new(sequence) {
            return Ok(Vec::new());
        }

        let gap = sequence - self.received_count - 1;
        if gap > max_gap {
            bail!("sequence number {} skips {} frames after #{}", sequence, gap, self.received_count);
        }

        let missed = (self.received_count + 1..sequence).collect::<Vec<_>>();
        self.open_slots(&missed);
        self.received_count = sequence;
        Ok(missed)
    }

    /// Reconciles with the number of sequenced frames the server reports having sent: anything
    ///  beyond what was received so far is missing. Like [SequenceTracker::on_sequence], a
    ///  count more than `max_gap` ahead is rejected.
    pub fn on_server_count(&mut self, server_count: u64, max_gap: u64) -> anyhow::Result<Vec<u64>> {
        if server_count <= self.received_count {
            return Ok(Vec::new());
        }

        let gap = server_count - self.received_count;
        if gap > max_gap {
            bail!("server count {} is {} frames ahead of #{}", server_count, gap, self.received_count);
        }

        let missed = (self.received_count + 1..=server_count).collect::<Vec<_>>();
        self.open_slots(&missed);
        self.received_count = server_count;
        Ok(missed)
    }

    fn open_slots(&mut self, sequences: &[u64]) {
        if !sequences.is_empty() {
            debug!("sequence gap detected: missing {:?}", sequences);
        }
        for &sequence in sequences {
            self.slots.insert(sequence, MissedSlot::Pending { attempts: 1 });
        }
    }

    /// Returns true and restarts the interval if a housekeeping pass is due
    pub fn start_housekeeping(&mut self, now: Instant, interval: Duration) -> bool {
        if now.saturating_duration_since(self.last_housekeeping) < interval {
            return false;
        }
        self.last_housekeeping = now;
        true
    }

    /// One retry round over all slots still lacking content: slots that used up their budget
    ///  are given up, all others are returned for another retransmission request.
    pub fn retry_pass(&mut self, max_attempts: u32) -> Vec<u64> {
        let mut retry = Vec::new();
        self.slots.retain(|&sequence, slot| {
            match slot {
                MissedSlot::Buffered(_) => true,
                MissedSlot::Pending { attempts } if *attempts >= max_attempts => {
                    warn!("giving up on missed frame #{} after {} retransmission requests", sequence, attempts);
                    false
                }
                MissedSlot::Pending { attempts } => {
                    *attempts += 1;
                    retry.push(sequence);
                    true
                }
            }
        });
        retry
    }

    /// true if there is any unresolved slot before `sequence`, i.e. an ordered frame with this
    ///  sequence number must not be dispatched yet
    pub fn has_open_slot_below(&self, sequence: u64) -> bool {
        self.slots.range(..sequence).next().is_some()
    }

    pub fn buffer(&mut self, sequence: u64, fields: Vec<Value>) {
        trace!("buffering frame #{} until earlier frames are available", sequence);
        self.slots.insert(sequence, MissedSlot::Buffered(fields));
    }

    /// Takes the retransmitted frames that fill an open slot, plus all buffered frames at the
    ///  front of the slot list up to the first slot still lacking content. The result is in
    ///  ascending sequence order and is to be processed as replays.
    pub fn accept_retransmissions(&mut self, retransmitted: Vec<(u64, Vec<Value>)>) -> Vec<(u64, Vec<Value>)> {
        let mut result = retransmitted.into_iter()
            .filter(|(sequence, _)| {
                let accepted = self.slots.remove(sequence).is_some();
                if !accepted {
                    trace!("ignoring retransmission of frame #{} which is not missing", sequence);
                }
                accepted
            })
            .collect::<Vec<_>>();

        while let Some(entry) = self.slots.first_entry() {
            if matches!(entry.get(), MissedSlot::Pending { .. }) {
                break;
            }
            let (sequence, slot) = entry.remove_entry();
            if let MissedSlot::Buffered(fields) = slot {
                result.push((sequence, fields));
            }
        }

        result.sort_by_key(|(sequence, _)| *sequence);
        result
    }

    pub fn slot(&self, sequence: u64) -> Option<&MissedSlot> {
        self.slots.get(&sequence)
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;
    use tokio::time::advance;
    use super::*;

    fn tracker_at(received_count: u64) -> SequenceTracker {
        let mut tracker = SequenceTracker::new(Instant::now());
        tracker.received_count = received_count;
        tracker
    }

    const MAX_GAP: u64 = 10_000;

    #[rstest]
    #[case::next(1, 2, vec![], 2)]
    #[case::gap_of_one(2, 4, vec![3], 4)]
    #[case::gap_of_three(1, 5, vec![2, 3, 4], 5)]
    #[case::duplicate(5, 5, vec![], 5)]
    #[case::old(5, 3, vec![], 5)]
    #[case::largest_gap(1, MAX_GAP + 2, (2..MAX_GAP + 2).collect(), MAX_GAP + 2)]
    fn test_on_sequence(#[case] received: u64, #[case] sequence: u64, #[case] expected_missed: Vec<u64>, #[case] expected_received: u64) {
        let mut tracker = tracker_at(received);
        assert_eq!(tracker.on_sequence(sequence, MAX_GAP).unwrap(), expected_missed);
        assert_eq!(tracker.received_count(), expected_received);
        for missed in expected_missed {
            assert_eq!(tracker.slot(missed), Some(&MissedSlot::Pending { attempts: 1 }));
        }
    }

    #[rstest]
    #[case::caught_up(4, 4, vec![], 4)]
    #[case::behind(4, 6, vec![5, 6], 6)]
    #[case::server_lower(4, 2, vec![], 4)]
    #[case::largest_gap(4, MAX_GAP + 4, (5..=MAX_GAP + 4).collect(), MAX_GAP + 4)]
    fn test_on_server_count(#[case] received: u64, #[case] server_count: u64, #[case] expected_missed: Vec<u64>, #[case] expected_received: u64) {
        let mut tracker = tracker_at(received);
        assert_eq!(tracker.on_server_count(server_count, MAX_GAP).unwrap(), expected_missed);
        assert_eq!(tracker.received_count(), expected_received);
    }

    #[rstest]
    #[case::just_too_far(1, MAX_GAP + 3)]
    #[case::max(1, u64::MAX)]
    fn test_on_sequence_rejects_huge_jump(#[case] received: u64, #[case] sequence: u64) {
        let mut tracker = tracker_at(received);
        assert!(tracker.on_sequence(sequence, MAX_GAP).is_err());
        assert_eq!(tracker.received_count(), received);
        assert_eq!(tracker.num_slots(), 0);
    }

    #[rstest]
    #[case::just_too_far(4, MAX_GAP + 5)]
    #[case::max(1, u64::MAX)]
    fn test_on_server_count_rejects_huge_jump(#[case] received: u64, #[case] server_count: u64) {
        let mut tracker = tracker_at(received);
        assert!(tracker.on_server_count(server_count, MAX_GAP).is_err());
        assert_eq!(tracker.received_count(), received);
        assert_eq!(tracker.num_slots(), 0);
    }

    #[test]
    fn test_reset() {
        let mut tracker = tracker_at(7);
        tracker.on_sequence(10, MAX_GAP).unwrap();
        tracker.reset(Instant::now());
        assert_eq!(tracker.received_count(), 1);
        assert_eq!(tracker.num_slots(), 0);
    }

    #[test]
    fn test_retry_pass_budget() {
        let mut tracker = tracker_at(1);
        tracker.on_sequence(3, MAX_GAP).unwrap();
        tracker.buffer(3, vec![json!(32)]);

        assert_eq!(tracker.retry_pass(3), vec![2]);
        assert_eq!(tracker.slot(2), Some(&MissedSlot::Pending { attempts: 2 }));
        assert_eq!(tracker.retry_pass(3), vec![2]);
        assert_eq!(tracker.slot(2), Some(&MissedSlot::Pending { attempts: 3 }));
        assert!(tracker.retry_pass(3).is_empty());
        assert_eq!(tracker.slot(2), None);
        assert!(tracker.retry_pass(3).is_empty());

        // buffered content is not affected by the retry budget
        assert!(tracker.slot(3).is_some());
    }

    #[rstest]
    #[case::nothing_missing(vec![], 5, false)]
    #[case::earlier_missing(vec![2], 5, true)]
    #[case::only_later_missing(vec![7], 5, false)]
    #[case::self_missing(vec![5], 5, false)]
    fn test_has_open_slot_below(#[case] open: Vec<u64>, #[case] sequence: u64, #[case] expected: bool) {
        let mut tracker = tracker_at(10);
        for s in open {
            tracker.slots.insert(s, MissedSlot::Pending { attempts: 1 });
        }
        assert_eq!(tracker.has_open_slot_below(sequence), expected);
    }

    #[test]
    fn test_accept_retransmissions() {
        let mut tracker = tracker_at(1);
        tracker.on_sequence(4, MAX_GAP).unwrap(); // 2 and 3 missing
        tracker.buffer(4, vec![json!(42)]);
        tracker.on_sequence(6, MAX_GAP).unwrap(); // 5 missing
        tracker.buffer(6, vec![json!(62)]);

        let replays = tracker.accept_retransmissions(vec![
            (3, vec![json!(32)]),
            (9, vec![json!(92)]),
            (2, vec![json!(22)]),
        ]);
        assert_eq!(replays, vec![
            (2, vec![json!(22)]),
            (3, vec![json!(32)]),
            (4, vec![json!(42)]),
        ]);
        assert_eq!(tracker.slot(5), Some(&MissedSlot::Pending { attempts: 1 }));
        assert!(tracker.slot(6).is_some());

        let replays = tracker.accept_retransmissions(vec![(5, vec![json!(52)])]);
        assert_eq!(replays, vec![
            (5, vec![json!(52)]),
            (6, vec![json!(62)]),
        ]);
        assert_eq!(tracker.num_slots(), 0);
    }

    #[test]
    fn test_flush_after_given_up() {
        let mut tracker = tracker_at(1);
        tracker.on_sequence(3, MAX_GAP).unwrap();
        tracker.buffer(3, vec![json!(32)]);
        for _ in 0..3 {
            tracker.retry_pass(3);
        }
        assert_eq!(tracker.accept_retransmissions(vec![]), vec![(3, vec![json!(32)])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_housekeeping() {
        let mut tracker = SequenceTracker::new(Instant::now());
        let interval = Duration::from_secs(30);

        advance(Duration::from_secs(29)).await;
        assert!(!tracker.start_housekeeping(Instant::now(), interval));
        advance(Duration::from_secs(1)).await;
        assert!(tracker.start_housekeeping(Instant::now(), interval));
        assert!(!tracker.start_housekeeping(Instant::now(), interval));

        advance(Duration::from_secs(20)).await;
        tracker.reset(Instant::now());
        advance(Duration::from_secs(20)).await;
        assert!(!tracker.start_housekeeping(Instant::now(), interval));
    }
}
