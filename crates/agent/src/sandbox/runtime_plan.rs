//! Runtime plans for symbolic sandbox runtimes.
//!
//! Native runtimes (`node22`, `python3.13`, ...) pass straight through to
//! the platform. Synthetic runtimes (`ruby*`, `go*`) are created on a node
//! base image and bootstrapped with shell steps whose output streams back
//! as tool log events.

use std::collections::HashMap;

const SYNTHETIC_BASE_RUNTIME: &str = "node22";

pub const RUBY_INSTALL_SH: &str = "if ! command -v ruby >/dev/null 2>&1; then \
     dnf install -y ruby3.2 ruby3.2-rubygems ruby3.2-rubygem-json ruby3.2-devel \
     libyaml-devel sqlite sqlite-devel gcc gcc-c++ make git redhat-rpm-config; \
     fi; ruby --version; gem --version;";

pub const BUNDLER_INSTALL_SH: &str = "if command -v gem >/dev/null 2>&1; then \
     gem list -i bundler >/dev/null 2>&1 || gem install --no-document bundler; \
     fi; bundle --version || true";

pub const GO_INSTALL_SH: &str = "if ! command -v go >/dev/null 2>&1; then \
     dnf install -y golang git || exit 1; \
     fi; go version; git --version || true;";

const GEM_BIN_PATHS: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin:\
     /usr/share/gems/bin:/usr/share/ruby3.2-gems/bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticRuntime {
    Ruby,
    Go,
}

/// One bootstrap command to run after sandbox creation.
#[derive(Debug, Clone)]
pub struct BootstrapStep {
    pub script: String,
    pub sudo: bool,
}

/// Resolved runtime: what to ask the platform for, and what to bootstrap.
#[derive(Debug, Clone)]
pub struct RuntimePlan {
    pub requested: Option<String>,
    pub effective: Option<String>,
    pub synthetic: Option<SyntheticRuntime>,
}

impl RuntimePlan {
    pub fn resolve(runtime: Option<&str>) -> Self {
        let requested = runtime.map(str::to_string);
        let synthetic = runtime.and_then(|r| {
            let lower = r.to_lowercase();
            if lower.starts_with("ruby") {
                Some(SyntheticRuntime::Ruby)
            } else if lower.starts_with("go") {
                Some(SyntheticRuntime::Go)
            } else {
                None
            }
        });
        let effective = if synthetic.is_some() {
            Some(SYNTHETIC_BASE_RUNTIME.to_string())
        } else {
            requested.clone()
        };
        Self {
            requested,
            effective,
            synthetic,
        }
    }

    /// Runtime label recorded in the run context and tool output.
    pub fn label(&self) -> Option<String> {
        self.requested.clone().or_else(|| self.effective.clone())
    }

    pub fn banner(&self) -> Option<&'static str> {
        match self.synthetic? {
            SyntheticRuntime::Ruby => Some("Initializing Ruby runtime...\n"),
            SyntheticRuntime::Go => Some("Initializing Go runtime...\n"),
        }
    }

    pub fn ready_message(&self) -> Option<&'static str> {
        match self.synthetic? {
            SyntheticRuntime::Ruby => Some(
                "Synthetic Ruby runtime ready. Bundler configured; rackup and puma \
                 installed (binstubs in ./bin).\n",
            ),
            SyntheticRuntime::Go => Some("Synthetic Go runtime ready. golang and git installed.\n"),
        }
    }

    /// Shell steps to run inside the fresh sandbox, in order.
    pub fn bootstrap_steps(&self, cwd: &str) -> Vec<BootstrapStep> {
        match self.synthetic {
            Some(SyntheticRuntime::Ruby) => vec![
                BootstrapStep {
                    script: RUBY_INSTALL_SH.to_string(),
                    sudo: true,
                },
                BootstrapStep {
                    script: BUNDLER_INSTALL_SH.to_string(),
                    sudo: true,
                },
                BootstrapStep {
                    script: format!(
                        "cd {cwd} && mkdir -p vendor/bundle && \
                         bundle config set --local path vendor/bundle"
                    ),
                    sudo: false,
                },
                BootstrapStep {
                    script: format!(
                        "cd {cwd} && ( [ -f Gemfile ] || bundle init ) && \
                         bundle add rack puma || true && \
                         bundle install && \
                         bundle binstubs rack puma"
                    ),
                    sudo: false,
                },
            ],
            Some(SyntheticRuntime::Go) => vec![BootstrapStep {
                script: GO_INSTALL_SH.to_string(),
                sudo: true,
            }],
            None => Vec::new(),
        }
    }

    /// Environment defaults persisted for subsequent commands.
    pub fn env_defaults(&self, cwd: &str) -> HashMap<String, String> {
        let mut env = HashMap::new();
        match self.synthetic {
            Some(SyntheticRuntime::Ruby) => {
                env.insert("BUNDLE_PATH".to_string(), "vendor/bundle".to_string());
                env.insert("PATH".to_string(), format!("{GEM_BIN_PATHS}:{cwd}/bin"));
            }
            Some(SyntheticRuntime::Go) => {
                env.insert("GOPATH".to_string(), format!("{cwd}/go"));
                env.insert(
                    "PATH".to_string(),
                    format!("/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin:{cwd}/go/bin"),
                );
            }
            None => {}
        }
        env
    }
}
