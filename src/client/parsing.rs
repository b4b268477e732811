//! Parsing of `INFO`-style text output.
//!
//! Both `INFO` and `CLUSTER INFO` reply with `key:value` lines, optionally
//! grouped under `# Section` headers and terminated with CRLF.

use regex::Regex;

use super::types::{InfoMap, ParseError};

/// Parse key-value pairs from INFO command output.
///
/// # Example
/// ```
/// use valkey_clu::client::parsing::parse_info_output;
///
/// let info = "# Cluster\r\ncluster_enabled:1\r\n";
/// let parsed = parse_info_output(info).unwrap();
/// assert_eq!(parsed.get("cluster_enabled"), Some(&"1".to_string()));
/// ```
pub fn parse_info_output(info: &str) -> Result<InfoMap, ParseError> {
    let kv_regex =
        Regex::new(r"^([\w-]+):(.+)$").map_err(|e| ParseError::RegexCompilation(e.to_string()))?;

    let mut result = InfoMap::new();

    for line in info.lines() {
        let line = line.trim();

        // Skip empty lines and section headers
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(caps) = kv_regex.captures(line)
            && let (Some(key), Some(value)) = (caps.get(1), caps.get(2))
        {
            result.insert(key.as_str().to_string(), value.as_str().to_string());
        }
    }

    Ok(result)
}
