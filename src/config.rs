use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::launch::LaunchMode;

/// Whether graph search may route a channel in and out of a node through
/// different NICs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossNicPolicy {
    Forbid,
    Allow,
    Auto,
}

impl CrossNicPolicy {
    fn from_env_str(s: &str) -> Option<Self> {
        match s {
            "0" | "forbid" => Some(CrossNicPolicy::Forbid),
            "1" | "allow" => Some(CrossNicPolicy::Allow),
            "2" | "auto" => Some(CrossNicPolicy::Auto),
            _ => None,
        }
    }
}

/// Recognized options. Loadable from a TOML file, with `OCCL_*` environment
/// variables taking precedence over both the file and the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommConfig {
    pub launch_mode: LaunchMode,
    pub buffsize_ll: Option<usize>,
    pub buffsize_ll128: Option<usize>,
    pub buffsize_simple: Option<usize>,
    pub collnet_enable: bool,
    pub cross_nic: CrossNicPolicy,
    pub graph_dump_rank: usize,
    pub force_enable_clique_launch: bool,
}

impl Default for CommConfig {
    fn default() -> Self {
        CommConfig {
            launch_mode: LaunchMode::Group,
            buffsize_ll: None,
            buffsize_ll128: None,
            buffsize_simple: None,
            collnet_enable: false,
            cross_nic: CrossNicPolicy::Auto,
            graph_dump_rank: 0,
            force_enable_clique_launch: false,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) => {
            log::info!("{} set by environment to {}", name, v);
            Some(v)
        }
        Err(_) => None,
    }
}

impl CommConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_env() -> Self {
        CommConfig::default().with_env()
    }

    /// Apply environment overrides on top of the current values.
    pub fn with_env(mut self) -> Self {
        if let Some(v) = env_var("OCCL_LAUNCH_MODE") {
            match v.as_str() {
                "GROUP" => self.launch_mode = LaunchMode::Group,
                "PARALLEL" => self.launch_mode = LaunchMode::Parallel,
                _ => log::warn!("OCCL_LAUNCH_MODE: unrecognized value {:?}", v),
            }
        }
        if let Some(v) = env_var("OCCL_LL_BUFFSIZE") {
            self.buffsize_ll = v.parse().ok();
        }
        if let Some(v) = env_var("OCCL_LL128_BUFFSIZE") {
            self.buffsize_ll128 = v.parse().ok();
        }
        if let Some(v) = env_var("OCCL_BUFFSIZE") {
            self.buffsize_simple = v.parse().ok();
        }
        if let Some(v) = env_var("OCCL_COLLNET_ENABLE") {
            self.collnet_enable = v == "1";
        }
        if let Some(v) = env_var("OCCL_CROSS_NIC") {
            match CrossNicPolicy::from_env_str(&v) {
                Some(policy) => self.cross_nic = policy,
                None => log::warn!("OCCL_CROSS_NIC: unrecognized value {:?}", v),
            }
        }
        if let Some(v) = env_var("OCCL_GRAPH_DUMP_RANK") {
            if let Ok(rank) = v.parse() {
                self.graph_dump_rank = rank;
            }
        }
        if let Some(v) = env_var("OCCL_FORCE_ENABLE_CLIQUE") {
            self.force_enable_clique_launch = v == "1";
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CommConfig::default();
        assert_eq!(config.launch_mode, LaunchMode::Group);
        assert!(!config.collnet_enable);
        assert_eq!(config.cross_nic, CrossNicPolicy::Auto);
        assert_eq!(config.graph_dump_rank, 0);
        assert!(!config.force_enable_clique_launch);
    }

    #[test]
    fn toml_round_trip() {
        let text = r#"
            launch_mode = "parallel"
            collnet_enable = true
            cross_nic = "forbid"
            buffsize_simple = 1048576
        "#;
        let config: CommConfig = toml::from_str(text).unwrap();
        assert_eq!(config.launch_mode, LaunchMode::Parallel);
        assert!(config.collnet_enable);
        assert_eq!(config.cross_nic, CrossNicPolicy::Forbid);
        assert_eq!(config.buffsize_simple, Some(1 << 20));
        // Unset fields keep their defaults.
        assert_eq!(config.graph_dump_rank, 0);
    }
}
