//! NodeSession: a connected GPU worker advertising `system.run` (spec §3, §4.5).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_mem_gb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_gb: Option<f64>,
}

impl NodeResources {
    /// Drop non-finite / non-positive GPU memory, coerce integer fields —
    /// the normalisation `NodeRegistry::register` applies to a client's
    /// `connect` frame before trusting it.
    pub fn normalized(mut self) -> Self {
        if let Some(mem) = self.gpu_mem_gb {
            if !mem.is_finite() || mem <= 0.0 {
                self.gpu_mem_gb = None;
            }
        }
        if let Some(c) = self.gpu_count {
            if c == 0 {
                self.gpu_count = None;
            }
        }
        self
    }

    pub fn satisfies(&self, req: &crate::dag::ResourceRequest) -> bool {
        if let Some(need) = req.gpu_count {
            if self.gpu_count.unwrap_or(0) < need {
                return false;
            }
        }
        if let Some(ty) = &req.gpu_type {
            match &self.gpu_type {
                Some(have) if have.eq_ignore_ascii_case(ty) => {}
                _ => return false,
            }
        }
        if let Some(mem) = req.gpu_mem_gb {
            if self.gpu_mem_gb.unwrap_or(0.0) < mem {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSession {
    pub node_id: String,
    pub conn_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_env: Option<String>,
    #[serde(default)]
    pub resources: NodeResources,
    pub connected_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
}

impl NodeSession {
    pub fn advertises(&self, command: &str) -> bool {
        self.commands.iter().any(|c| c == command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::ResourceRequest;

    // ==== NodeResources::normalized ====

    #[test]
    fn normalize_drops_nonpositive_gpu_mem() {
        let r = NodeResources {
            gpu_mem_gb: Some(-1.0),
            ..Default::default()
        }
        .normalized();
        assert_eq!(r.gpu_mem_gb, None);
    }

    #[test]
    fn normalize_drops_nan_gpu_mem() {
        let r = NodeResources {
            gpu_mem_gb: Some(f64::NAN),
            ..Default::default()
        }
        .normalized();
        assert_eq!(r.gpu_mem_gb, None);
    }

    #[test]
    fn normalize_drops_zero_gpu_count() {
        let r = NodeResources {
            gpu_count: Some(0),
            ..Default::default()
        }
        .normalized();
        assert_eq!(r.gpu_count, None);
    }

    // ==== NodeResources::satisfies ====

    #[test]
    fn satisfies_checks_gpu_count_type_and_mem() {
        let res = NodeResources {
            gpu_count: Some(2),
            gpu_type: Some("A100".into()),
            gpu_mem_gb: Some(40.0),
            ..Default::default()
        };
        let req = ResourceRequest {
            gpu_count: Some(1),
            gpu_type: Some("a100".into()),
            gpu_mem_gb: Some(24.0),
            ..Default::default()
        };
        assert!(res.satisfies(&req));
    }

    #[test]
    fn satisfies_fails_on_insufficient_gpu_count() {
        let res = NodeResources {
            gpu_count: Some(1),
            ..Default::default()
        };
        let req = ResourceRequest {
            gpu_count: Some(2),
            ..Default::default()
        };
        assert!(!res.satisfies(&req));
    }

    #[test]
    fn satisfies_fails_on_gpu_type_mismatch() {
        let res = NodeResources {
            gpu_count: Some(1),
            gpu_type: Some("V100".into()),
            ..Default::default()
        };
        let req = ResourceRequest {
            gpu_count: Some(1),
            gpu_type: Some("A100".into()),
            ..Default::default()
        };
        assert!(!res.satisfies(&req));
    }

    // ==== advertises ====

    #[test]
    fn advertises_checks_command_list() {
        let s = NodeSession {
            node_id: "n1".into(),
            conn_id: "c1".into(),
            display_name: None,
            platform: None,
            version: None,
            caps: vec![],
            commands: vec!["system.run".into()],
            permissions: vec![],
            path_env: None,
            resources: NodeResources::default(),
            connected_at_ms: 0,
            remote_ip: None,
        };
        assert!(s.advertises("system.run"));
        assert!(!s.advertises("system.cancel"));
    }
}
