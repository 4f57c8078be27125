//! Embedded wait-chain (WCT) document parsing.
//!
//! The capture helper embeds a JSON description of the wait graph as a
//! custom user stream when it suspects a hang. The engine uses it for two
//! things: picking candidate threads for the stackwalk (cycle threads
//! first, longest waiters otherwise) and classifying the capture
//! (hang vs. manual snapshot).

use serde::Deserialize;

/// Parsed `capture` object: why the helper decided to take this dump.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WctCapture {
    pub kind: String,
    #[serde(rename = "secondsSinceHeartbeat")]
    pub seconds_since_heartbeat: f64,
    #[serde(rename = "thresholdSec")]
    pub threshold_sec: u32,
    #[serde(rename = "isLoading")]
    pub is_loading: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct WctNodeThread {
    #[serde(rename = "waitTime")]
    wait_time: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct WctNode {
    thread: Option<WctNodeThread>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct WctThread {
    tid: u32,
    #[serde(rename = "isCycle")]
    is_cycle: bool,
    nodes: Vec<WctNode>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct WctDoc {
    threads: Vec<WctThread>,
    capture: Option<WctCapture>,
}

/// Summary used by the evidence builder.
#[derive(Debug, Clone, Default)]
pub struct WctInfo {
    pub threads: usize,
    pub cycles: usize,
    pub capture: Option<WctCapture>,
}

impl WctInfo {
    /// Cycle threads present, or heartbeat age at/over the hang threshold.
    pub fn suggests_hang(&self) -> bool {
        if self.cycles > 0 {
            return true;
        }
        self.capture.as_ref().is_some_and(|c| {
            c.threshold_sec > 0 && c.seconds_since_heartbeat >= f64::from(c.threshold_sec)
        })
    }

    pub fn is_manual_capture(&self) -> bool {
        self.capture.as_ref().is_some_and(|c| c.kind == "manual")
    }

    pub fn is_loading(&self) -> bool {
        self.capture.as_ref().is_some_and(|c| c.is_loading)
    }
}

/// Parses the WCT document. Any parse failure yields `None`; the signal is
/// simply absent.
pub fn summarize(json_utf8: &str) -> Option<WctInfo> {
    if json_utf8.is_empty() {
        return None;
    }
    let doc: WctDoc = serde_json::from_str(json_utf8).ok()?;
    if doc.threads.is_empty() && doc.capture.is_none() {
        return None;
    }
    Some(WctInfo {
        threads: doc.threads.len(),
        cycles: doc.threads.iter().filter(|t| t.is_cycle).count(),
        capture: doc.capture,
    })
}

/// Candidate thread ids for the stackwalk: cycle threads when any exist
/// (deadlock likely), otherwise the longest-waiting threads, capped at
/// `max_n`.
pub fn candidate_thread_ids(json_utf8: &str, max_n: usize) -> Vec<u32> {
    let Ok(doc) = serde_json::from_str::<WctDoc>(json_utf8) else {
        return Vec::new();
    };

    let mut cycle_tids = Vec::new();
    let mut non_cycle: Vec<(u32, u64)> = Vec::new();
    for t in &doc.threads {
        if t.tid == 0 {
            continue;
        }
        if t.is_cycle {
            cycle_tids.push(t.tid);
            continue;
        }
        let wait = t
            .nodes
            .iter()
            .filter_map(|n| n.thread.as_ref())
            .map(|th| th.wait_time)
            .max()
            .unwrap_or(0);
        non_cycle.push((t.tid, wait));
    }

    if !cycle_tids.is_empty() {
        return cycle_tids;
    }
    if max_n == 0 {
        return Vec::new();
    }
    non_cycle.sort_by(|a, b| b.1.cmp(&a.1));
    non_cycle.into_iter().map(|(tid, _)| tid).take(max_n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "threads": [
            {"tid": 10, "isCycle": false, "nodes": [{"thread": {"waitTime": 100}}]},
            {"tid": 20, "isCycle": false, "nodes": [{"thread": {"waitTime": 9000}}]},
            {"tid": 30, "isCycle": false, "nodes": []}
        ],
        "capture": {"kind": "hang", "secondsSinceHeartbeat": 12.5, "thresholdSec": 10, "isLoading": true}
    }"#;

    #[test]
    fn summarizes_threads_and_capture() {
        let info = summarize(SAMPLE).unwrap();
        assert_eq!(info.threads, 3);
        assert_eq!(info.cycles, 0);
        assert!(info.suggests_hang());
        assert!(info.is_loading());
        assert!(!info.is_manual_capture());
    }

    #[test]
    fn candidates_pick_longest_waiters_without_cycles() {
        let tids = candidate_thread_ids(SAMPLE, 2);
        assert_eq!(tids, vec![20, 10]);
    }

    #[test]
    fn candidates_prefer_cycle_threads() {
        let json = r#"{"threads": [
            {"tid": 1, "isCycle": false, "nodes": [{"thread": {"waitTime": 99999}}]},
            {"tid": 2, "isCycle": true, "nodes": []}
        ]}"#;
        assert_eq!(candidate_thread_ids(json, 8), vec![2]);
        assert!(summarize(json).unwrap().suggests_hang());
    }

    #[test]
    fn invalid_json_is_absent() {
        assert!(summarize("not json").is_none());
        assert!(candidate_thread_ids("not json", 8).is_empty());
    }

    #[test]
    fn fresh_heartbeat_does_not_suggest_hang() {
        let json = r#"{"threads": [], "capture": {"kind": "manual", "secondsSinceHeartbeat": 1.0, "thresholdSec": 10}}"#;
        let info = summarize(json).unwrap();
        assert!(!info.suggests_hang());
        assert!(info.is_manual_capture());
    }
}
