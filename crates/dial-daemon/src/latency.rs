//! Load-latency bookkeeping used to rank stations by responsiveness.
//!
//! Only the most recent request→ready duration per station is kept.  Keys are
//! `Station::identity_key()` (name + frequency) since catalog ids change on
//! every reload.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use dial_proto::protocol::Station;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
pub struct LoadTimeTracker {
    records: RwLock<HashMap<String, Duration>>,
}

impl LoadTimeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites any previous measurement for this station.
    pub async fn record(&self, station: &Station, elapsed: Duration) {
        let key = station.identity_key();
        debug!("latency: {} ready after {}ms", key, elapsed.as_millis());
        self.records.write().await.insert(key, elapsed);
    }

    pub async fn latency(&self, station: &Station) -> Option<Duration> {
        self.records
            .read()
            .await
            .get(&station.identity_key())
            .copied()
    }

    /// Known latencies ascending, unknown ones last; ties keep input order.
    pub async fn rank(&self, candidates: &[Station]) -> Vec<Station> {
        let records = self.records.read().await;
        let mut keyed: Vec<(Option<Duration>, &Station)> = candidates
            .iter()
            .map(|s| (records.get(&s.identity_key()).copied(), s))
            .collect();
        keyed.sort_by(|(a, _), (b, _)| compare_latency(*a, *b));
        keyed.into_iter().map(|(_, s)| s.clone()).collect()
    }

    /// Up to `n` stations: measured ones fastest first, then untested ones
    /// in catalog order.
    pub async fn fastest(&self, candidates: &[Station], n: usize) -> Vec<Station> {
        let mut ranked = self.rank(candidates).await;
        ranked.truncate(n);
        ranked
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

fn compare_latency(a: Option<Duration>, b: Option<Duration>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station(name: &str, frequency: f64) -> Station {
        Station {
            id: format!("id-{}", name),
            name: name.to_string(),
            frequency,
            url: format!("http://example.com/{}", name),
            genre: None,
            sub_genre: None,
        }
    }

    fn names(stations: &[Station]) -> Vec<&str> {
        stations.iter().map(|s| s.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_rank_known_first_unknown_last() {
        let tracker = LoadTimeTracker::new();
        let (a, b, c) = (station("A", 90.0), station("B", 95.0), station("C", 100.0));
        tracker.record(&b, Duration::from_secs(2)).await;
        tracker.record(&a, Duration::from_secs(1)).await;

        let candidates = vec![b.clone(), a.clone(), c.clone()];
        let first = tracker.rank(&candidates).await;
        assert_eq!(names(&first), vec!["A", "B", "C"]);
        assert_eq!(tracker.rank(&candidates).await, first);
    }

    #[tokio::test]
    async fn test_record_overwrites() {
        let tracker = LoadTimeTracker::new();
        let a = station("A", 90.0);
        tracker.record(&a, Duration::from_secs(5)).await;
        tracker.record(&a, Duration::from_millis(300)).await;
        assert_eq!(tracker.latency(&a).await, Some(Duration::from_millis(300)));
        assert_eq!(tracker.len().await, 1);
    }

    #[tokio::test]
    async fn test_ties_keep_catalog_order() {
        let tracker = LoadTimeTracker::new();
        let stations: Vec<Station> = ["X", "Y", "Z"]
            .iter()
            .enumerate()
            .map(|(i, n)| station(n, 90.0 + i as f64))
            .collect();
        for s in &stations {
            tracker.record(s, Duration::from_millis(500)).await;
        }
        assert_eq!(names(&tracker.rank(&stations).await), vec!["X", "Y", "Z"]);
    }

    #[tokio::test]
    async fn test_identity_survives_new_ids() {
        let tracker = LoadTimeTracker::new();
        let before = station("Jazz FM", 102.2);
        tracker.record(&before, Duration::from_millis(800)).await;

        let mut reloaded = before.clone();
        reloaded.id = "fresh-uuid".to_string();
        assert_eq!(tracker.latency(&reloaded).await, Some(Duration::from_millis(800)));
    }

    #[tokio::test]
    async fn test_fastest_pads_with_untested() {
        let tracker = LoadTimeTracker::new();
        let stations: Vec<Station> = (0..12)
            .map(|i| station(&format!("S{}", i), 88.0 + i as f64))
            .collect();
        tracker.record(&stations[10], Duration::from_millis(100)).await;
        tracker.record(&stations[4], Duration::from_millis(200)).await;

        let fastest = tracker.fastest(&stations, 9).await;
        assert_eq!(
            names(&fastest),
            vec!["S10", "S4", "S0", "S1", "S2", "S3", "S5", "S6", "S7"]
        );

        let few = tracker.fastest(&stations[..3], 9).await;
        assert_eq!(few.len(), 3);
    }
}
