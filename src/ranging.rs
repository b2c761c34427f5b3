//! Ranging deduplicator (§4.6) — a pure, stateless batch transform with no
//! engine dependency. Grounded in the teacher's preference for small free
//! functions over methods when there's no state to hang them off (see the
//! scoring helpers in `quality/scorer.rs`).

use uuid::Uuid;

/// Coarse proximity bucket a reader's RSSI/accuracy maps to (§3 Observed
/// beacon).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Proximity {
    Immediate,
    Near,
    Far,
    Unknown,
}

/// A single beacon observation (§3). `accuracy` is in meters; negative
/// values mean "unusable".
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct Observation {
    pub uuid: Uuid,
    pub major: u16,
    pub minor: u16,
    pub rssi: i32,
    pub accuracy: f64,
    pub proximity: Proximity,
}

impl Observation {
    /// The dedup key identifying a physical beacon (§3, GLOSSARY).
    fn key(&self) -> (Uuid, u16, u16) {
        (self.uuid, self.major, self.minor)
    }
}

/// For each dedup key, keep exactly one entry — preferring the lowest
/// non-negative accuracy; a negative-accuracy entry is kept only when no
/// non-negative entry exists for that key. Output sorted by accuracy
/// ascending (§4.6).
pub fn dedupe_by_accuracy(batch: &[Observation]) -> Vec<Observation> {
    use std::collections::HashMap;

    let mut best: HashMap<(Uuid, u16, u16), Observation> = HashMap::new();
    for &obs in batch {
        match best.get(&obs.key()) {
            None => {
                best.insert(obs.key(), obs);
            }
            Some(&current) => {
                if preferred(&obs, &current) {
                    best.insert(obs.key(), obs);
                }
            }
        }
    }

    let mut out: Vec<Observation> = best.into_values().collect();
    out.sort_by(|a, b| a.accuracy.partial_cmp(&b.accuracy).unwrap_or(std::cmp::Ordering::Equal));
    out
}

/// True if `candidate` should replace `current` for the same dedup key.
///
/// Both non-negative: lower wins. One non-negative: it wins outright. Both
/// negative: the less-negative (closer to usable) one wins — an explicit
/// tie-break the source leaves unstated.
fn preferred(candidate: &Observation, current: &Observation) -> bool {
    match (candidate.accuracy >= 0.0, current.accuracy >= 0.0) {
        (true, true) => candidate.accuracy < current.accuracy,
        (true, false) => true,
        (false, true) => false,
        (false, false) => candidate.accuracy > current.accuracy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(uuid: Uuid, major: u16, minor: u16, accuracy: f64) -> Observation {
        Observation {
            uuid,
            major,
            minor,
            rssi: -60,
            accuracy,
            proximity: Proximity::Near,
        }
    }

    #[test]
    fn dedupes_by_key_preferring_lower_nonnegative_accuracy() {
        let id = Uuid::new_v4();
        let batch = vec![obs(id, 1, 1, 3.2), obs(id, 1, 1, 1.1), obs(id, 1, 1, 5.0)];
        let result = dedupe_by_accuracy(&batch);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].accuracy, 1.1);
    }

    #[test]
    fn negative_accuracy_kept_only_when_no_nonnegative_entry_exists() {
        let id = Uuid::new_v4();
        let batch = vec![obs(id, 1, 1, -1.0), obs(id, 1, 1, 2.0)];
        let result = dedupe_by_accuracy(&batch);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].accuracy, 2.0);

        let only_negative = vec![obs(id, 2, 2, -5.0), obs(id, 2, 2, -1.0)];
        let result = dedupe_by_accuracy(&only_negative);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].accuracy, -1.0);
    }

    #[test]
    fn distinct_keys_all_survive_sorted_ascending() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let batch = vec![obs(a, 1, 1, 9.0), obs(b, 2, 2, 1.0), obs(a, 3, 3, 4.0)];
        let result = dedupe_by_accuracy(&batch);
        assert_eq!(result.len(), 3);
        let accuracies: Vec<f64> = result.iter().map(|o| o.accuracy).collect();
        assert_eq!(accuracies, vec![1.0, 4.0, 9.0]);
    }
}
