use std::{fs, path::{Path, PathBuf}};

use anyhow::Error;
use schemars::schema_for;
use tracing::info;

use crate::flow::Flow;

/// Write `flow.schema.json` into `out_dir` and return its path.
pub fn write_schema(out_dir: &Path) -> Result<PathBuf, Error> {
    fs::create_dir_all(out_dir)?;

    let flow_schema = schema_for!(Flow);
    let flow_json = serde_json::to_string_pretty(&flow_schema)?;
    let path = out_dir.join("flow.schema.json");
    fs::write(&path, flow_json)?;
    info!("wrote {}", path.display());
    Ok(path)
}
