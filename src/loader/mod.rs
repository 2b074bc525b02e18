// Reads and parses flow-suite documents. YAML is the canonical format;
// JSON parses through the same path since YAML is a superset.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::suite::FlowSuite;

pub fn load_suite<P: AsRef<Path>>(path: P) -> Result<FlowSuite> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read suite file '{}'", path.display()))?;
    let suite: FlowSuite = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse suite document '{}'", path.display()))?;
    Ok(suite)
}
