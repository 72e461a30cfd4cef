//! Deployment strategy and lifecycle hook definitions.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a new revision replaces the old one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Stand the new revision up on every host next to the old one, then
    /// shift traffic across in steps
    #[default]
    BlueGreen,

    /// Replace hosts in batches; traffic follows the replaced fraction
    Rolling,
}

/// The four lifecycle hooks a revision may provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookName {
    PreInstall,
    PostInstall,
    Start,
    Stop,
}

impl HookName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreInstall => "pre_install",
            Self::PostInstall => "post_install",
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An external executable run at a lifecycle point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSpec {
    /// Executable (or shell command line) to run
    pub path: String,

    /// Kill the hook after this many seconds
    #[serde(default = "default_hook_timeout")]
    pub timeout_seconds: u64,

    /// Identity to run the hook as
    pub run_as: Option<String>,
}

fn default_hook_timeout() -> u64 {
    60
}

impl HookSpec {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Lifecycle hooks for a deployment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentHooks {
    pub pre_install: Option<HookSpec>,
    pub post_install: Option<HookSpec>,
    pub start: Option<HookSpec>,
    pub stop: Option<HookSpec>,
}

impl DeploymentHooks {
    pub fn get(&self, name: HookName) -> Option<&HookSpec> {
        match name {
            HookName::PreInstall => self.pre_install.as_ref(),
            HookName::PostInstall => self.post_install.as_ref(),
            HookName::Start => self.start.as_ref(),
            HookName::Stop => self.stop.as_ref(),
        }
    }
}

/// Hooks run, in order, to install a revision on a host
pub const INSTALL_SEQUENCE: [HookName; 3] =
    [HookName::PreInstall, HookName::PostInstall, HookName::Start];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hooks_yaml() {
        let yaml = r#"
pre_install:
  path: scripts/install_dependencies.sh
  timeout_seconds: 300
  run_as: root
start:
  path: scripts/start_server.sh
"#;
        let hooks: DeploymentHooks = serde_yaml::from_str(yaml).unwrap();

        let pre = hooks.get(HookName::PreInstall).unwrap();
        assert_eq!(pre.timeout_seconds, 300);
        assert_eq!(pre.run_as.as_deref(), Some("root"));

        let start = hooks.get(HookName::Start).unwrap();
        assert_eq!(start.timeout(), Duration::from_secs(60));
        assert!(hooks.get(HookName::Stop).is_none());
    }
}
