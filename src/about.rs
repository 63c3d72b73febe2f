use crate::store::EnvironmentSnapshot;
use benchkeeper_protocol::Label;
use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};

pub const BENCHKEEPER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const BENCHKEEPER_BUILD_N: &str = env!("BENCHKEEPER_BUILD_N");

pub fn version_cli_text() -> String {
    format!(
        "benchkeeper {}\nBuild {}\nIncremental benchmark bookkeeping",
        BENCHKEEPER_VERSION, BENCHKEEPER_BUILD_N
    )
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// What a session records about the software that produced it.
pub fn environment_snapshot(
    method_versions: BTreeMap<Label, Option<String>>,
    tags: BTreeMap<String, String>,
) -> EnvironmentSnapshot {
    EnvironmentSnapshot {
        package: env!("CARGO_PKG_NAME").to_string(),
        version: BENCHKEEPER_VERSION.to_string(),
        build: BENCHKEEPER_BUILD_N.to_string(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        method_versions,
        tags,
        created_at_unix_ms: now_unix_ms(),
    }
}
