// =============================================================================
// tokens.rs - THE CREDENTIAL QUARTERMASTER
// =============================================================================
//
// Every simulated device needs an identity and an access token before it can
// bother the broker. Three ways to get them:
//
// 1. A tokens.json written by the provisioner: an object mapping device name
//    to token, iterated in sorted order so shard slicing is deterministic.
// 2. A bare JSON list of tokens, in which case devices are christened
//    device_0 .. device_{N-1} in list order.
// 3. A --token-prefix, for brokers that accept anything as a username and
//    runs where nobody wants to provision 5,000 devices first.
//
// The store is read-only: this module never writes the file it loads.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

use crate::models::DeviceToken;

#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error("token file not found: {0}")]
    NotFound(String),
    #[error("could not read token file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("token file {path} is not valid JSON: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("token file must contain a JSON object (name -> token) or a JSON list of tokens")]
    InvalidShape,
    #[error("start-id {start_id} is outside the available token range (0..{available})")]
    StartOutOfRange { start_id: usize, available: usize },
    #[error("the number of devices must be greater than zero")]
    EmptySelection,
    #[error("not enough tokens to cover the requested range")]
    RangeTooLarge,
    #[error("--token-prefix requires --count or --device-count")]
    PrefixNeedsCount,
    #[error("provide an existing --tokens-file or a --token-prefix to synthesize tokens")]
    NoSource,
}

/// Load the provisioner's output. Objects are iterated in sorted key order
/// so every process slicing the same file sees the same fleet ordering.
pub fn load_tokens_from_file(path: &Path) -> Result<Vec<DeviceToken>, TokenStoreError> {
    if !path.exists() {
        return Err(TokenStoreError::NotFound(path.display().to_string()));
    }
    let text = std::fs::read_to_string(path).map_err(|source| TokenStoreError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let value: serde_json::Value =
        serde_json::from_str(&text).map_err(|source| TokenStoreError::Parse {
            path: path.display().to_string(),
            source,
        })?;
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<String, serde_json::Value> = map.into_iter().collect();
            Ok(sorted
                .into_iter()
                .map(|(device_id, token)| DeviceToken::new(device_id, stringify(token)))
                .collect())
        }
        serde_json::Value::Array(items) => Ok(items
            .into_iter()
            .enumerate()
            .map(|(index, token)| DeviceToken::new(format!("device_{index}"), stringify(token)))
            .collect()),
        _ => Err(TokenStoreError::InvalidShape),
    }
}

fn stringify(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Synthesize `<prefix><id>` identities whose token equals their name.
pub fn generate_tokens(prefix: &str, count: usize, start_id: usize) -> Vec<DeviceToken> {
    (start_id..start_id + count)
        .map(|index| DeviceToken::new(format!("{prefix}{index}"), format!("{prefix}{index}")))
        .collect()
}

/// Slice the fleet for one process: `start_id` is the offset into the token
/// list, `override_count` (the shard's `--count`) wins over the global
/// `--device-count`, and zero means "everything from start_id onward".
pub fn select_devices(
    tokens: &[DeviceToken],
    device_count: usize,
    start_id: usize,
    override_count: Option<usize>,
) -> Result<Vec<DeviceToken>, TokenStoreError> {
    if start_id >= tokens.len() {
        return Err(TokenStoreError::StartOutOfRange {
            start_id,
            available: tokens.len(),
        });
    }
    let to_take = override_count
        .filter(|&count| count > 0)
        .or_else(|| (device_count > 0).then_some(device_count))
        .unwrap_or(tokens.len() - start_id);
    if to_take == 0 {
        return Err(TokenStoreError::EmptySelection);
    }
    let end = start_id + to_take;
    if end > tokens.len() {
        return Err(TokenStoreError::RangeTooLarge);
    }
    Ok(tokens[start_id..end].to_vec())
}

/// Resolve the fleet this process will simulate, from file or prefix.
pub fn resolve_fleet(
    tokens_file: &Path,
    token_prefix: Option<&str>,
    device_count: usize,
    start_id: usize,
    count: Option<usize>,
) -> Result<Vec<DeviceToken>, TokenStoreError> {
    if tokens_file.exists() {
        let tokens = load_tokens_from_file(tokens_file)?;
        return select_devices(&tokens, device_count, start_id, count);
    }
    if let Some(prefix) = token_prefix {
        let synthetic_count = count
            .filter(|&c| c > 0)
            .or_else(|| (device_count > 0).then_some(device_count))
            .ok_or(TokenStoreError::PrefixNeedsCount)?;
        return Ok(generate_tokens(prefix, synthetic_count, start_id));
    }
    Err(TokenStoreError::NoSource)
}
