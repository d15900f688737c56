//! The four node health checks. Each one is a probe payload plus a selection
//! rule over the parsed probe responses.

use std::collections::HashSet;

use serde_json::Value;

use super::CheckKind;
use crate::models::{
    ArchivalCheckOptions,
    Blockchain,
    ChainIdCheckOptions,
    MergeCheckOptions,
    ProbeRequest,
    SyncCheckOptions,
};

/// Parsed probe answer of one node.
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub public_key: String,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheck {
    ChainId(ChainIdCheckOptions),
    Sync(SyncCheckOptions),
    Archival(ArchivalCheckOptions),
    Merge(MergeCheckOptions),
}

impl HealthCheck {
    /// Checks a chain declares, in the order they should filter nodes.
    pub fn for_blockchain(blockchain: &Blockchain) -> Vec<HealthCheck> {
        let mut checks = Vec::new();
        if let Some(options) = &blockchain.chain_id_check {
            checks.push(HealthCheck::ChainId(options.clone()));
        }
        if let Some(options) = &blockchain.sync_check {
            checks.push(HealthCheck::Sync(options.clone()));
        }
        if let Some(options) = &blockchain.archival_check {
            checks.push(HealthCheck::Archival(options.clone()));
        }
        if let Some(options) = &blockchain.merge_check {
            checks.push(HealthCheck::Merge(options.clone()));
        }
        checks
    }

    pub fn kind(&self) -> CheckKind {
        match self {
            HealthCheck::ChainId(_) => CheckKind::Chain,
            HealthCheck::Sync(_) => CheckKind::Sync,
            HealthCheck::Archival(_) => CheckKind::Archival,
            HealthCheck::Merge(_) => CheckKind::Merge,
        }
    }

    pub fn probe(&self) -> &ProbeRequest {
        match self {
            HealthCheck::ChainId(options) => &options.probe,
            HealthCheck::Sync(options) => &options.probe,
            HealthCheck::Archival(options) => &options.probe,
            HealthCheck::Merge(options) => &options.probe,
        }
    }

    /// Public keys of the nodes whose responses pass the check.
    pub fn select(&self, responses: &[ProbeResponse]) -> HashSet<String> {
        match self {
            HealthCheck::Sync(options) => select_synced(options, responses),
            _ => responses
                .iter()
                .filter(|response| self.accepts(&response.body))
                .map(|response| response.public_key.clone())
                .collect(),
        }
    }

    fn accepts(&self, body: &Value) -> bool {
        match self {
            HealthCheck::ChainId(options) => {
                let expected = parse_quantity_str(&options.expected_chain_id);
                let reported = body.get("result").and_then(parse_quantity);
                expected.is_some() && expected == reported
            }
            HealthCheck::Archival(options) => {
                if body.get("error").is_some_and(|error| !error.is_null()) {
                    return false;
                }
                match extract(body, &options.result_key) {
                    Some(value) => !value.is_null() && *value != options.comparator,
                    None => false,
                }
            }
            HealthCheck::Merge(options) => {
                let Some(block) = body.get("result") else {
                    return false;
                };
                let total_difficulty = block.get("totalDifficulty").and_then(parse_quantity);
                let difficulty = block.get("difficulty").and_then(parse_quantity);
                total_difficulty.is_some()
                    && total_difficulty == parse_quantity_str(&options.terminal_total_difficulty)
                    && difficulty == Some(0)
            }
            // Sync is relative to the whole batch.
            HealthCheck::Sync(_) => false,
        }
    }
}

/// Nodes that must report heights within the allowance of each other before
/// a height is trusted as the chain tip.
const SYNC_AGREEMENT: usize = 2;

/// Keeps nodes within the allowance below the highest height that at least
/// [`SYNC_AGREEMENT`] nodes agree on. Heights above it are uncorroborated and
/// fail along with lagging ones.
fn select_synced(options: &SyncCheckOptions, responses: &[ProbeResponse]) -> HashSet<String> {
    let heights: Vec<(&str, u128)> = responses
        .iter()
        .filter_map(|response| {
            let height = extract(&response.body, &options.result_key).and_then(parse_quantity)?;
            Some((response.public_key.as_str(), height))
        })
        .collect();

    let allowance = u128::from(options.allowance);
    let quorum = heights.len().min(SYNC_AGREEMENT);
    let mut candidates: Vec<u128> = heights.iter().map(|(_, height)| *height).collect();
    candidates.sort_unstable_by(|a, b| b.cmp(a));
    let Some(tip) = candidates.iter().copied().find(|candidate| {
        let floor = candidate.saturating_sub(allowance);
        heights
            .iter()
            .filter(|(_, height)| (floor..=*candidate).contains(height))
            .count()
            >= quorum
    }) else {
        return HashSet::new();
    };

    let floor = tip.saturating_sub(allowance);
    heights
        .into_iter()
        .filter(|(_, height)| (floor..=tip).contains(height))
        .map(|(public_key, _)| public_key.to_string())
        .collect()
}

/// Follows a dotted path (`result.number`) into a JSON value.
fn extract<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| current.get(segment))
}

/// Reads a JSON-RPC quantity: a `0x` hex string, a decimal string or a number.
fn parse_quantity(value: &Value) -> Option<u128> {
    match value {
        Value::String(raw) => parse_quantity_str(raw),
        Value::Number(number) => number.as_u64().map(u128::from),
        _ => None,
    }
}

fn parse_quantity_str(raw: &str) -> Option<u128> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) if !hex.is_empty() => u128::from_str_radix(hex, 16).ok(),
        Some(_) => None,
        None => raw.parse::<u128>().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn probe() -> ProbeRequest {
        ProbeRequest {
            body: "{}".into(),
            path: None,
        }
    }

    fn response(public_key: &str, body: Value) -> ProbeResponse {
        ProbeResponse {
            public_key: public_key.into(),
            body,
        }
    }

    fn passing(check: &HealthCheck, responses: &[ProbeResponse]) -> Vec<String> {
        let mut selected: Vec<String> = check.select(responses).into_iter().collect();
        selected.sort();
        selected
    }

    #[test]
    fn chain_id_compares_quantities() {
        let check = HealthCheck::ChainId(ChainIdCheckOptions {
            probe: probe(),
            expected_chain_id: "100".into(),
        });
        let responses = [
            response("a", json!({"result": "0x64"})),
            response("b", json!({"result": "0x1"})),
            response("c", json!({"error": {"code": -32000}})),
        ];
        assert_eq!(passing(&check, &responses), vec!["a"]);
    }

    #[test]
    fn sync_keeps_nodes_within_the_allowance() {
        let check = HealthCheck::Sync(SyncCheckOptions {
            probe: probe(),
            result_key: "result".into(),
            allowance: 2,
        });
        let responses = [
            response("a", json!({"result": "0x3e8"})),
            response("b", json!({"result": "0x3e8"})),
            response("c", json!({"result": "0x3e7"})),
            response("d", json!({"result": "0x3e8"})),
            response("e", json!({"result": "0x3de"})),
            response("f", json!({"result": null})),
        ];
        assert_eq!(passing(&check, &responses), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn sync_ignores_a_height_no_other_node_reports() {
        let check = HealthCheck::Sync(SyncCheckOptions {
            probe: probe(),
            result_key: "result".into(),
            allowance: 2,
        });
        let responses = [
            response("a", json!({"result": "0x3e8"})),
            response("b", json!({"result": "0x3e8"})),
            response("c", json!({"result": "0x3e8"})),
            response("d", json!({"result": "0x3e8"})),
            response("far-ahead", json!({"result": "0xffffffffffff"})),
        ];
        assert_eq!(passing(&check, &responses), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn sync_accepts_a_tip_two_nodes_agree_on() {
        let check = HealthCheck::Sync(SyncCheckOptions {
            probe: probe(),
            result_key: "result".into(),
            allowance: 1,
        });
        let responses = [
            response("a", json!({"result": "0x3ea"})),
            response("b", json!({"result": "0x3e9"})),
            response("c", json!({"result": "0x3e8"})),
        ];
        assert_eq!(passing(&check, &responses), vec!["a", "b"]);
        assert_eq!(passing(&check, &responses[2..]), vec!["c"]);
    }

    #[test]
    fn sync_without_heights_selects_nothing() {
        let check = HealthCheck::Sync(SyncCheckOptions {
            probe: probe(),
            result_key: "result".into(),
            allowance: 0,
        });
        assert!(check.select(&[response("a", json!({"oops": 1}))]).is_empty());
    }

    #[test]
    fn archival_rejects_pruned_answers() {
        let check = HealthCheck::Archival(ArchivalCheckOptions {
            probe: probe(),
            result_key: "result".into(),
            comparator: json!("0x0"),
        });
        let responses = [
            response("archive", json!({"result": "0x1bc16d674ec80000"})),
            response("pruned", json!({"result": "0x0"})),
            response("missing-trie", json!({"error": {"message": "missing trie node"}})),
        ];
        assert_eq!(passing(&check, &responses), vec!["archive"]);
    }

    #[test]
    fn merge_requires_terminal_difficulty() {
        let check = HealthCheck::Merge(MergeCheckOptions {
            probe: probe(),
            terminal_total_difficulty: "0xc70d815d562d3cfa955".into(),
        });
        let responses = [
            response(
                "merged",
                json!({
                    "result": {"totalDifficulty": "0xc70d815d562d3cfa955", "difficulty": "0x0"}
                }),
            ),
            response(
                "legacy",
                json!({
                    "result": {"totalDifficulty": "0xc70d815d562d3cfa954", "difficulty": "0x1"}
                }),
            ),
        ];
        assert_eq!(passing(&check, &responses), vec!["merged"]);
    }

    #[test]
    fn checks_follow_the_blockchain_declaration_order() {
        let blockchain = Blockchain {
            id: "0021".into(),
            aliases: vec!["eth-mainnet".into()],
            path: None,
            enforce_result: None,
            request_timeout_ms: None,
            log_limit_blocks: None,
            chain_id_check: None,
            sync_check: Some(SyncCheckOptions {
                probe: probe(),
                result_key: "result".into(),
                allowance: 1,
            }),
            archival_check: None,
            merge_check: Some(MergeCheckOptions {
                probe: probe(),
                terminal_total_difficulty: "0x1".into(),
            }),
        };
        let kinds: Vec<CheckKind> = HealthCheck::for_blockchain(&blockchain)
            .iter()
            .map(HealthCheck::kind)
            .collect();
        assert_eq!(kinds, vec![CheckKind::Sync, CheckKind::Merge]);
    }

    #[test]
    fn extracts_nested_values() {
        let body = json!({"result": {"number": "0x10"}});
        assert_eq!(
            extract(&body, "result.number").and_then(parse_quantity),
            Some(16)
        );
        assert!(extract(&body, "result.hash").is_none());
    }
}
