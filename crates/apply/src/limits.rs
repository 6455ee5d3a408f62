use serde_json::Value as Json;
use strata_core::StrataError;

fn max_payload_bytes() -> usize {
    std::env::var("STRATA_MAX_PAYLOAD_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_048_576) // 1 MiB default
}

fn max_payload_nodes() -> usize {
    std::env::var("STRATA_MAX_PAYLOAD_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

/// Size guards applied to every payload before it is turned into a field set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadLimits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for PayloadLimits {
    fn default() -> Self {
        Self { max_bytes: 1_048_576, max_nodes: 100_000 }
    }
}

impl PayloadLimits {
    pub fn from_env() -> Self {
        Self { max_bytes: max_payload_bytes(), max_nodes: max_payload_nodes() }
    }

    pub fn check_bytes(&self, len: usize) -> Result<(), StrataError> {
        if len > self.max_bytes {
            return Err(StrataError::Validation(format!("payload too large (>{} bytes)", self.max_bytes)));
        }
        Ok(())
    }

    pub fn check_value(&self, v: &Json) -> Result<(), StrataError> {
        if json_node_budget_exceeded(v, self.max_nodes) {
            return Err(StrataError::Validation(format!("payload too complex (>{} nodes)", self.max_nodes)));
        }
        Ok(())
    }

    /// Parse a JSON request body.
    pub fn parse_json(&self, body: &[u8]) -> Result<Json, StrataError> {
        self.check_bytes(body.len())?;
        let v: Json = serde_json::from_slice(body).map_err(|e| StrataError::Validation(format!("parsing JSON: {e}")))?;
        self.check_value(&v)?;
        Ok(v)
    }

    /// Parse a YAML (or JSON) document as written by operators.
    pub fn parse_document(&self, text: &str) -> Result<Json, StrataError> {
        self.check_bytes(text.len())?;
        let val: serde_yaml::Value =
            serde_yaml::from_str(text).map_err(|e| StrataError::Validation(format!("parsing YAML: {e}")))?;
        let v = serde_json::to_value(val).map_err(|e| StrataError::Validation(format!("converting YAML to JSON: {e}")))?;
        self.check_value(&v)?;
        Ok(v)
    }
}

pub(crate) fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    // Running counter, bail early once past max
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}
