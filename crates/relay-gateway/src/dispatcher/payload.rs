//! Inspection of the JSON-RPC payload a client sent.

use serde_json::Value;

const GET_LOGS: &str = "eth_getLogs";

/// A relay payload, parsed once when it is JSON.
#[derive(Debug, Clone)]
pub struct RequestPayload {
    parsed: Option<Value>,
}

impl RequestPayload {
    pub fn parse(data: &str) -> Self {
        Self {
            parsed: serde_json::from_str(data).ok(),
        }
    }

    fn calls(&self) -> impl Iterator<Item = &Value> {
        let calls: &[Value] = match &self.parsed {
            Some(Value::Array(batch)) => batch,
            Some(call) => std::slice::from_ref(call),
            None => &[],
        };
        calls.iter()
    }

    /// Methods called by the payload, one per batch entry.
    pub fn methods(&self) -> Vec<&str> {
        self.calls()
            .filter_map(|call| call.get("method").and_then(Value::as_str))
            .collect()
    }

    /// Method label used in metrics rows.
    pub fn method_label(&self) -> String {
        self.methods().join(",")
    }

    /// JSON-RPC id of a single call. Batches have none.
    pub fn rpc_id(&self) -> Option<u64> {
        match &self.parsed {
            Some(Value::Object(call)) => match call.get("id")? {
                Value::Number(id) => id.as_u64(),
                Value::String(id) => id.parse().ok(),
                _ => None,
            },
            _ => None,
        }
    }

    /// Widest explicit `eth_getLogs` block range above `limit`, if any.
    ///
    /// Only hex block numbers are checked; tags and `blockHash` filters pass.
    pub fn log_range_exceeding(&self, limit: u64) -> Option<u64> {
        self.calls()
            .filter(|call| call.get("method").and_then(Value::as_str) == Some(GET_LOGS))
            .filter_map(|call| call.get("params")?.get(0))
            .filter_map(|filter| {
                if filter.get("blockHash").is_some() {
                    return None;
                }
                let from = hex_block(filter.get("fromBlock")?)?;
                let to = hex_block(filter.get("toBlock")?)?;
                Some(to.saturating_sub(from))
            })
            .filter(|span| *span > limit)
            .max()
    }
}

fn hex_block(value: &Value) -> Option<u64> {
    let hex = value.as_str()?.strip_prefix("0x")?;
    u64::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_methods_from_single_and_batch_calls() {
        let single = RequestPayload::parse(r#"{"jsonrpc":"2.0","id":1,"method":"eth_chainId"}"#);
        assert_eq!(single.methods(), vec!["eth_chainId"]);

        let batch = RequestPayload::parse(
            r#"[{"id":1,"method":"eth_chainId"},{"id":2,"method":"eth_blockNumber"}]"#,
        );
        assert_eq!(batch.method_label(), "eth_chainId,eth_blockNumber");
        assert_eq!(batch.rpc_id(), None);

        assert!(RequestPayload::parse("not json").methods().is_empty());
    }

    #[test]
    fn reads_numeric_and_string_ids() {
        assert_eq!(
            RequestPayload::parse(r#"{"id":41,"method":"eth_call"}"#).rpc_id(),
            Some(41)
        );
        assert_eq!(
            RequestPayload::parse(r#"{"id":"7","method":"eth_call"}"#).rpc_id(),
            Some(7)
        );
    }

    #[test]
    fn flags_only_explicit_oversized_log_ranges() {
        let wide = RequestPayload::parse(
            r#"{"method":"eth_getLogs","params":[{"fromBlock":"0x1","toBlock":"0x2712"}]}"#,
        );
        assert_eq!(wide.log_range_exceeding(10_000), Some(10_001));
        assert_eq!(wide.log_range_exceeding(20_000), None);

        let tagged = RequestPayload::parse(
            r#"{"method":"eth_getLogs","params":[{"fromBlock":"0x1","toBlock":"latest"}]}"#,
        );
        assert_eq!(tagged.log_range_exceeding(1), None);

        let by_hash = RequestPayload::parse(concat!(
            r#"{"method":"eth_getLogs","params":[{"blockHash":"0xab","#,
            r#""fromBlock":"0x1","toBlock":"0xffff"}]}"#,
        ));
        assert_eq!(by_hash.log_range_exceeding(1), None);
    }
}
