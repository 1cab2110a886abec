//! Command heuristics for sandbox runs.
//!
//! Classifies a shell command by the toolchain it implies, supplies common
//! readiness banners when the caller gave none, and infers the preview
//! port. Each heuristic is individually togglable via the `auto_*` flags on
//! `sandbox_run`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

pub const PYTHON_ENSURE_SH: &str = "PYBIN=$(command -v python3 || command -v python || echo /opt/runtimes/python/bin/python3); \
     if [ -z \"$PYBIN\" ]; then echo 'python not found in sandbox'; exit 1; fi; \
     $PYBIN -m ensurepip --upgrade || true; \
     $PYBIN -m pip install --upgrade pip || true;";

static PORT_FLAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"--port\s+(\d+)|-p\s+(\d+)").expect("port flag regex compiles"));

/// What a command appears to use, derived from its lowercased text.
#[derive(Debug, Clone, Default)]
pub struct CommandTraits {
    pub uses_python: bool,
    pub uses_ruby: bool,
    pub uses_go: bool,
    pub is_go_run: bool,
    pub is_uvicorn: bool,
    pub is_rackup: bool,
    pub is_sinatra: bool,
    pub starts_with_ruby: bool,
    pub is_rails_server: bool,
    pub is_rails_new: bool,
    pub is_scaffold_or_install: bool,
}

impl CommandTraits {
    pub fn classify(command: &str) -> Self {
        let cl = command.trim().to_lowercase();
        let padded = format!(" {cl} ");

        let uses_python = padded.contains(" pip ")
            || cl.starts_with("pip ")
            || padded.contains(" pip3 ")
            || cl.starts_with("pip3 ")
            || cl.contains("-m pip")
            || cl.contains("python ")
            || cl.starts_with("python")
            || cl.contains("uvicorn");

        let uses_ruby = padded.contains(" gem ")
            || cl.starts_with("gem ")
            || padded.contains(" bundle ")
            || cl.starts_with("bundle ")
            || cl.contains("rackup")
            || cl.contains("ruby ")
            || cl.starts_with("ruby ")
            || cl.contains("sinatra")
            || cl.contains("rails ");

        let uses_go = padded.contains(" go ") || cl.starts_with("go ");
        let is_go_run = uses_go && (padded.contains(" go run") || cl.starts_with("go run"));

        let is_rails_new = cl.starts_with("rails new") || cl.contains(" rails new ");
        let is_rails_server = cl.contains("rails server") || cl.contains("rails s");
        let is_scaffold_or_install = is_rails_new
            || cl.starts_with("rails generate")
            || cl.starts_with("rails g ")
            || cl.contains(" rails generate ")
            || cl.contains(" rails g ")
            || cl.starts_with("bundle install")
            || cl.contains(" bundle install ");

        Self {
            uses_python,
            uses_ruby,
            uses_go,
            is_go_run,
            is_uvicorn: cl.contains("uvicorn"),
            is_rackup: cl.contains("rackup"),
            is_sinatra: cl.contains("sinatra"),
            starts_with_ruby: cl.starts_with("ruby "),
            is_rails_server,
            is_rails_new,
            is_scaffold_or_install,
        }
    }

    /// True when the Rails app-root cwd heuristic should engage: a
    /// Rails/Bundler command (other than `rails new`) with no explicit cwd.
    pub fn rails_cwd_candidate(&self, command: &str, requested_cwd: Option<&str>) -> bool {
        if !self.uses_ruby || self.is_rails_new {
            return false;
        }
        if requested_cwd.is_some_and(|c| !c.trim().is_empty()) {
            return false;
        }
        let cl = command.trim().to_lowercase();
        cl.contains("bundle install")
            || cl.starts_with("rails generate")
            || cl.contains(" rails generate")
            || cl.starts_with("rails db:")
            || cl.contains(" rails db:")
            || cl.contains("bin/rails")
    }
}

/// Common readiness banners for the detected server kind.
pub fn auto_ready_patterns(traits: &CommandTraits) -> Option<Vec<String>> {
    let patterns: &[&str] = if traits.is_go_run {
        &[
            "Listening on",
            "http://0.0.0.0:",
            "listening on :",
            "Server started",
            "Serving on",
        ]
    } else if traits.is_uvicorn {
        &["Application startup complete", "Uvicorn running on"]
    } else if traits.is_rails_server {
        &["Listening on", "Use Ctrl-C to stop", "Puma starting"]
    } else if traits.is_rackup || traits.is_sinatra || traits.starts_with_ruby {
        &[
            "Listening on",
            "WEBrick::HTTPServer#start",
            "Sinatra has taken the stage",
            "tcp://0.0.0.0:",
            "WEBrick::HTTPServer#start: pid=",
        ]
    } else {
        return None;
    };
    Some(patterns.iter().map(|p| p.to_string()).collect())
}

/// Port from an explicit `--port N` / `-p N` flag, else the conventional
/// default for the detected server kind.
pub fn infer_port(command: &str, traits: &CommandTraits) -> Option<u16> {
    let flag_port = PORT_FLAG.captures(command).and_then(|caps| {
        caps.get(1)
            .or_else(|| caps.get(2))
            .and_then(|m| m.as_str().parse::<u16>().ok())
    });
    if let Some(port) = flag_port {
        return Some(port);
    }
    if traits.is_uvicorn {
        Some(8000)
    } else if traits.is_rails_server || traits.is_go_run {
        Some(3000)
    } else if traits.is_rackup {
        Some(9292)
    } else if traits.is_sinatra || traits.starts_with_ruby {
        Some(4567)
    } else {
        None
    }
}

/// Wrap a direct `ruby`/`rackup`/`rails` invocation so it runs under
/// Bundler when a Gemfile is present. Commands already using Bundler are
/// left alone.
pub fn wrap_with_bundler(command: &str, traits: &CommandTraits) -> String {
    let cl = command.trim().to_lowercase();
    let direct_invocation =
        traits.starts_with_ruby || cl.starts_with("rackup") || cl.starts_with("rails ");
    let already_using_bundle = cl.starts_with("bundle ") || cl.contains(" bundle exec ");
    if traits.uses_ruby && direct_invocation && !already_using_bundle {
        format!("( [ -f Gemfile ] || [ -f ./Gemfile ] ) && bundle exec {command} || {command}")
    } else {
        command.to_string()
    }
}

/// Append `-b 0.0.0.0` to a `rails server` command lacking a binding flag
/// and prefix `ALLOWED_HOST=<host>` when one can be derived.
pub fn prepare_rails_server(command: &str, preview_host: Option<&str>) -> String {
    let mut command = command.to_string();
    if !command.contains(" -b ") && !command.contains(" --binding ") {
        command = format!("{command} -b 0.0.0.0");
    }
    if !command.to_lowercase().contains("allowed_host=") {
        if let Some(host) = preview_host.filter(|h| !h.is_empty()) {
            command = format!("ALLOWED_HOST={host} {command}");
        }
    }
    command
}

/// Parse `["KEY=VALUE", ...]` into a map. Entries without `=` or with an
/// empty key are skipped; the first occurrence of a key wins.
pub fn parse_env_list(env_list: &[String]) -> HashMap<String, String> {
    let mut result = HashMap::new();
    for entry in env_list {
        let Some((key, value)) = entry.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if !key.is_empty() && !result.contains_key(key) {
            result.insert(key.to_string(), value.to_string());
        }
    }
    result
}

/// Resolve the effective working directory for a command. Absolute paths
/// must equal or descend from the sandbox cwd (otherwise they are
/// ignored); relative paths are joined under it.
pub fn safe_cwd(base_cwd: &str, requested: Option<&str>) -> String {
    match requested.map(str::trim).filter(|c| !c.is_empty()) {
        None => base_cwd.to_string(),
        Some(req) if req.starts_with('/') => {
            if req == base_cwd || req.starts_with(&format!("{base_cwd}/")) {
                req.to_string()
            } else {
                base_cwd.to_string()
            }
        }
        Some(req) => format!("{base_cwd}/{req}").trim_end_matches('/').to_string(),
    }
}
