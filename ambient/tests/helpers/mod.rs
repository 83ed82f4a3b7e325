#![allow(dead_code)]

pub mod daemon_guard;
pub mod polling;

use std::path::Path;

/// Write a config.json whose agents are `sh -c <script>` stubs
pub fn write_stub_config(home: &Path, agents: &[(&str, &str)]) {
    std::fs::write(
        home.join("config.json"),
        serde_json::to_string_pretty(&stub_config(agents)).unwrap(),
    )
    .unwrap();
}

/// Settings JSON with `sh -c <script>` stub agents and `claude` as default
pub fn stub_config(agents: &[(&str, &str)]) -> serde_json::Value {
    let agents: serde_json::Map<String, serde_json::Value> = agents
        .iter()
        .map(|(name, script)| {
            (
                name.to_string(),
                serde_json::json!({
                    "name": name,
                    "command": "sh",
                    "args": ["-c", script, name],
                }),
            )
        })
        .collect();

    serde_json::json!({
        "defaultAgent": "claude",
        "agents": agents,
        "logLevel": "debug",
    })
}
