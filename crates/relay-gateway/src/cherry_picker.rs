//! Weighted-random selection of applications and nodes by recent quality.
//!
//! Candidates are sorted by average success latency and pushed into a draw
//! pool: healthy candidates are pushed several times (fewer the slower they
//! are), degraded ones once, and candidates that kept failing for a whole
//! window are flagged and left out. An empty pool falls back to the full
//! candidate list so a pick always succeeds when there are candidates.

use std::time::Duration;

use futures::future::join_all;
use rand::seq::IndexedRandom;
use tracing::{
    debug,
    warn,
};

use crate::{
    cache::TieredCache,
    models::{
        Application,
        Node,
        Session,
    },
    quality::{
        QualityLog,
        QualityLogEntry,
        SUCCESS_CODE,
    },
    session::SessionManager,
};

const INITIAL_WEIGHT: i64 = 10;
const LATENCY_WEIGHT_FACTOR: f64 = 15.0;
const WEIGHTED_SUCCESS_RATE: f64 = 0.95;
const MIN_ATTEMPTS_BEFORE_EXCLUSION: u64 = 50;

const BAD_TIMEOUT_THRESHOLD: i64 = 20;
const BAD_TIMEOUT_TTL: Duration = Duration::from_secs(2 * 60 * 60);
const BAD_TIMEOUT_VARIANCE: Duration = Duration::from_secs(2);

/// Quality view of one candidate used for ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateQuality {
    pub id: String,
    pub attempts: u64,
    pub success_rate: f64,
    pub average_success_latency: f64,
    pub failure: bool,
}

impl CandidateQuality {
    /// A candidate without history: fully successful, never tried.
    pub fn untested(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attempts: 0,
            success_rate: 1.0,
            average_success_latency: 0.0,
            failure: false,
        }
    }

    pub fn from_entry(id: impl Into<String>, entry: &QualityLogEntry) -> Self {
        Self {
            id: id.into(),
            attempts: entry.attempts(),
            success_rate: entry.success_rate(),
            average_success_latency: entry.average_success_latency,
            failure: entry.failure,
        }
    }
}

/// Outcome of ranking: how many pool slots each candidate got, and which
/// candidates were newly found to be failing.
#[derive(Debug, Default)]
pub struct RankedPool {
    pub weights: Vec<(String, usize)>,
    pub newly_failed: Vec<String>,
}

impl RankedPool {
    pub fn weight_of(&self, id: &str) -> usize {
        self.weights
            .iter()
            .find(|(candidate, _)| candidate == id)
            .map_or(0, |(_, weight)| *weight)
    }

    fn pool(&self) -> Vec<&str> {
        self.weights
            .iter()
            .flat_map(|(id, weight)| std::iter::repeat_n(id.as_str(), *weight))
            .collect()
    }
}

pub fn rank_candidates(mut candidates: Vec<CandidateQuality>) -> RankedPool {
    candidates.sort_by(|a, b| {
        a.average_success_latency
            .total_cmp(&b.average_success_latency)
    });

    let mut ranked = RankedPool::default();
    let mut weight = INITIAL_WEIGHT;
    let mut fastest: Option<f64> = None;

    for candidate in candidates {
        let fastest = *fastest.get_or_insert(candidate.average_success_latency);
        let latency_delta = candidate.average_success_latency - fastest;
        weight = (weight - (latency_delta * LATENCY_WEIGHT_FACTOR).round() as i64).max(1);

        if candidate.success_rate > WEIGHTED_SUCCESS_RATE && !candidate.failure {
            ranked.weights.push((candidate.id, weight as usize));
        } else if candidate.success_rate > 0.0 && !candidate.failure {
            ranked.weights.push((candidate.id, 1));
        } else if candidate.attempts < MIN_ATTEMPTS_BEFORE_EXCLUSION {
            ranked.weights.push((candidate.id, 1));
        } else {
            ranked.newly_failed.push(candidate.id);
        }
    }
    ranked
}

/// Context a failed relay needs to count towards evicting a node that keeps
/// timing out.
#[derive(Debug, Clone, Copy)]
pub struct BadTimeoutContext<'a> {
    pub session: &'a Session,
    pub request_timeout: Duration,
    pub archival: bool,
}

#[derive(Clone)]
pub struct CherryPicker {
    quality: QualityLog,
    sessions: SessionManager,
    cache: TieredCache,
}

impl CherryPicker {
    pub fn new(quality: QualityLog, sessions: SessionManager, cache: TieredCache) -> Self {
        Self {
            quality,
            sessions,
            cache,
        }
    }

    pub async fn cherry_pick_application(
        &self,
        candidates: &[String],
        chain: &str,
    ) -> Option<String> {
        let ids: Vec<&str> = candidates.iter().map(String::as_str).collect();
        let picked = self.pick(&ids, chain).await?;
        debug!(chain, application = picked, "cherry picked application");
        Some(picked.to_string())
    }

    pub async fn cherry_pick_node(
        &self,
        application: &Application,
        nodes: &[Node],
        chain: &str,
    ) -> Option<Node> {
        let ids: Vec<&str> = nodes.iter().map(|node| node.public_key.as_str()).collect();
        let picked = self.pick(&ids, chain).await?;
        debug!(
            chain,
            application = %application.id,
            node = picked,
            "cherry picked node"
        );
        nodes.iter().find(|node| node.public_key == picked).cloned()
    }

    async fn pick<'a>(&self, ids: &[&'a str], chain: &str) -> Option<&'a str> {
        if ids.is_empty() {
            return None;
        }

        let candidates = join_all(ids.iter().map(|id| self.candidate_quality(chain, id))).await;
        let ranked = rank_candidates(candidates);
        for failed in &ranked.newly_failed {
            warn!(chain, candidate = %failed, "candidate keeps failing, excluding it");
            self.quality.mark_failure(chain, failed).await;
        }

        let mut rng = rand::rng();
        let pool = ranked.pool();
        let picked = match pool.choose(&mut rng) {
            Some(picked) => *picked,
            None => {
                metrics::counter!("relay_gateway_cherry_pick_fallback_total").increment(1);
                *ids.choose(&mut rng)?
            }
        };
        ids.iter().copied().find(|id| *id == picked)
    }

    async fn candidate_quality(&self, chain: &str, id: &str) -> CandidateQuality {
        match self.quality.load(chain, id).await {
            Ok(Some(entry)) => CandidateQuality::from_entry(id, &entry),
            Ok(None) => CandidateQuality::untested(id),
            Err(err) => {
                warn!(%err, chain, candidate = id, "quality log unreadable, treating as untested");
                CandidateQuality::untested(id)
            }
        }
    }

    /// Folds a relay outcome into the candidate's quality log. Failures on
    /// archival chains that ran into the request timeout also count towards
    /// evicting the node from its session.
    pub async fn update_service_quality(
        &self,
        chain: &str,
        candidate: &str,
        elapsed: Duration,
        result_code: u16,
        bad_timeout: Option<BadTimeoutContext<'_>>,
    ) {
        if let Err(err) = self
            .quality
            .record(chain, candidate, result_code, elapsed.as_secs_f64())
            .await
        {
            warn!(%err, chain, candidate, "failed to update quality log");
        }

        if result_code == SUCCESS_CODE {
            return;
        }
        if let Some(context) = bad_timeout {
            self.count_bad_timeout(chain, candidate, elapsed, context)
                .await;
        }
    }

    async fn count_bad_timeout(
        &self,
        chain: &str,
        node: &str,
        elapsed: Duration,
        context: BadTimeoutContext<'_>,
    ) {
        if !context.archival || elapsed + BAD_TIMEOUT_VARIANCE < context.request_timeout {
            return;
        }

        let key = format!("{chain}-{node}-bad-timeout");
        let count = match self.cache.incr_with_ttl(&key, BAD_TIMEOUT_TTL).await {
            Ok(count) => count,
            Err(err) => {
                warn!(%err, chain, node, "failed to count timeout");
                return;
            }
        };

        if count >= BAD_TIMEOUT_THRESHOLD {
            warn!(chain, node, count, "node keeps timing out, evicting it");
            self.sessions.evict_node(chain, context.session, node).await;
            if let Err(err) = self.cache.del(&[key]).await {
                warn!(%err, chain, node, "failed to reset timeout counter");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        quality::{
            FAILURE_CODE,
            QualityConfig,
        },
        session::SessionConfig,
        test_utils::{
            ScriptedProtocolClient,
            application,
            node,
            session_with,
        },
    };
    use std::sync::Arc;

    fn candidate(id: &str, latency: f64, success_rate: f64, attempts: u64) -> CandidateQuality {
        CandidateQuality {
            id: id.to_string(),
            attempts,
            success_rate,
            average_success_latency: latency,
            failure: false,
        }
    }

    fn picker() -> (CherryPicker, SessionManager, TieredCache) {
        let cache = TieredCache::in_memory();
        let client = Arc::new(ScriptedProtocolClient::new(session_with(3)));
        let sessions = SessionManager::new(client, cache.clone(), SessionConfig::default());
        let quality = QualityLog::new(cache.clone(), QualityConfig::default());
        (
            CherryPicker::new(quality, sessions.clone(), cache.clone()),
            sessions,
            cache,
        )
    }

    #[test]
    fn faster_candidates_weigh_at_least_as_much() {
        let ranked = rank_candidates(vec![
            candidate("slow", 0.9, 1.0, 10),
            candidate("fast", 0.1, 1.0, 10),
            candidate("mid", 0.3, 1.0, 10),
        ]);
        assert_eq!(ranked.weight_of("fast"), 10);
        assert!(ranked.weight_of("fast") >= ranked.weight_of("mid"));
        assert!(ranked.weight_of("mid") >= ranked.weight_of("slow"));
        assert!(ranked.weight_of("slow") >= 1);
    }

    #[test]
    fn degraded_candidates_get_a_single_slot() {
        let ranked = rank_candidates(vec![
            candidate("healthy", 0.1, 1.0, 100),
            candidate("degraded", 0.1, 0.5, 100),
            candidate("dead-but-new", 0.1, 0.0, 10),
        ]);
        assert_eq!(ranked.weight_of("healthy"), 10);
        assert_eq!(ranked.weight_of("degraded"), 1);
        assert_eq!(ranked.weight_of("dead-but-new"), 1);
        assert!(ranked.newly_failed.is_empty());
    }

    #[test]
    fn flagged_candidates_with_enough_attempts_are_excluded() {
        let mut flagged = candidate("flagged", 0.1, 1.0, 50);
        flagged.failure = true;
        let ranked = rank_candidates(vec![
            flagged,
            candidate("dead", 0.2, 0.0, 80),
            candidate("ok", 0.2, 1.0, 80),
        ]);
        assert_eq!(ranked.weight_of("flagged"), 0);
        assert_eq!(ranked.weight_of("dead"), 0);
        assert_eq!(ranked.newly_failed, vec!["flagged", "dead"]);
        assert!(ranked.pool().iter().all(|id| *id == "ok"));
    }

    #[tokio::test]
    async fn empty_pool_falls_back_to_all_candidates() {
        let (picker, _, _) = picker();
        let quality = QualityLog::new(picker.cache.clone(), QualityConfig::default());
        for _ in 0..60 {
            quality.record("0021", "a", FAILURE_CODE, 1.0).await.unwrap();
            quality.record("0021", "b", FAILURE_CODE, 1.0).await.unwrap();
        }

        let candidates = vec!["a".to_string(), "b".to_string()];
        let picked = picker
            .cherry_pick_application(&candidates, "0021")
            .await
            .unwrap();
        assert!(candidates.contains(&picked));
        assert!(quality.load("0021", "a").await.unwrap().unwrap().failure);
    }

    #[tokio::test]
    async fn picks_only_from_the_given_nodes() {
        let (picker, _, _) = picker();
        let nodes = vec![node(1), node(2)];
        for _ in 0..20 {
            let picked = picker
                .cherry_pick_node(&application(), &nodes, "0021")
                .await
                .unwrap();
            assert!(nodes.contains(&picked));
        }
        assert!(picker
            .cherry_pick_node(&application(), &[], "0021")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn chronic_timeouts_evict_archival_nodes() {
        let (picker, sessions, _) = picker();
        let session = sessions.get_session("app", "0021").await.unwrap();
        let victim = session.nodes[0].public_key.clone();
        let context = BadTimeoutContext {
            session: &session,
            request_timeout: Duration::from_secs(10),
            archival: true,
        };

        for _ in 0..BAD_TIMEOUT_THRESHOLD {
            picker
                .update_service_quality(
                    "0021",
                    &victim,
                    Duration::from_secs(9),
                    FAILURE_CODE,
                    Some(context),
                )
                .await;
        }
        assert!(sessions.exhausted_nodes(&session).await.contains(&victim));
    }

    #[tokio::test]
    async fn fast_failures_do_not_count_as_timeouts() {
        let (picker, sessions, _) = picker();
        let session = sessions.get_session("app", "0021").await.unwrap();
        let victim = session.nodes[0].public_key.clone();
        let context = BadTimeoutContext {
            session: &session,
            request_timeout: Duration::from_secs(10),
            archival: true,
        };

        for _ in 0..(BAD_TIMEOUT_THRESHOLD * 2) {
            picker
                .update_service_quality(
                    "0021",
                    &victim,
                    Duration::from_millis(100),
                    FAILURE_CODE,
                    Some(context),
                )
                .await;
        }
        assert!(sessions.exhausted_nodes(&session).await.is_empty());
    }
}
