//! `mender health`: deployment sanity checks for a project root.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};

use crate::io::config::{MenderConfig, OracleKind, load_config};
use crate::io::init::MenderPaths;
use crate::io::state_store::{FileStateStore, StateStore};
use crate::state::PipelineState;

/// A run older than this is reported as stale.
pub const STALE_AFTER_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckLevel {
    Ok,
    /// Worth knowing; does not make the project unhealthy.
    Warn,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub name: String,
    pub level: CheckLevel,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub checks: Vec<HealthCheck>,
    /// The state record, when it could be read.
    pub state: Option<PipelineState>,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.checks.iter().all(|check| check.level != CheckLevel::Fail)
    }

    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        for check in &self.checks {
            let tag = match check.level {
                CheckLevel::Ok => "OK  ",
                CheckLevel::Warn => "WARN",
                CheckLevel::Fail => "FAIL",
            };
            let mut line = format!("[{tag}] {}", check.name);
            if !check.detail.is_empty() {
                line.push_str(&format!(": {}", check.detail));
            }
            lines.push(line);
        }
        if let Some(state) = &self.state {
            lines.push(format!("metrics: {}", state.headline()));
        }
        lines.push(if self.healthy() {
            "all checks passed".to_string()
        } else {
            "some checks failed".to_string()
        });
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }
}

/// Run every check against `root` as of `now`.
pub fn check_health(root: &Path, now: DateTime<Utc>) -> HealthReport {
    let paths = MenderPaths::new(root);
    let mut checks = Vec::new();

    let config = match load_config(&paths.config_path) {
        Ok(config) if !paths.config_path.exists() => {
            checks.push(warn("config", "not found, using defaults"));
            config
        }
        Ok(config) => {
            checks.push(ok("config", paths.config_path.display().to_string()));
            config
        }
        Err(err) => {
            checks.push(fail("config", format!("{err:#}")));
            MenderConfig::default()
        }
    };

    for (name, dir) in [
        ("state dir", paths.state_dir.clone()),
        ("backups dir", paths.backups_dir.clone()),
        ("source dir", root.join(&config.source_dir)),
        ("test dir", root.join(&config.test_dir)),
    ] {
        checks.push(if dir.is_dir() {
            ok(name, dir.display().to_string())
        } else {
            fail(name, format!("{} missing (run `mender init`)", dir.display()))
        });
    }

    checks.push(oracle_check(&config));

    let state = if paths.state_path.exists() {
        match FileStateStore::new(&paths.state_path).load() {
            Ok(state) => {
                checks.push(ok("state", "readable"));
                Some(state)
            }
            Err(err) => {
                checks.push(fail("state", format!("{err:#}")));
                None
            }
        }
    } else {
        checks.push(warn("state", "not found (pipeline not run yet)"));
        None
    };

    if let Some(state) = &state {
        checks.push(match state.last_run {
            Some(last) => {
                let age = now.signed_duration_since(last);
                let detail = format!("{:.1} hours ago", age.num_minutes() as f64 / 60.0);
                if age < Duration::hours(STALE_AFTER_HOURS) {
                    ok("last run", detail)
                } else {
                    warn("last run", detail)
                }
            }
            None => warn("last run", "no completed cycle"),
        });
    }

    HealthReport { checks, state }
}

fn oracle_check(config: &MenderConfig) -> HealthCheck {
    match config.oracle.kind {
        OracleKind::None => warn("oracle", "not configured, repair disabled"),
        OracleKind::Command => ok(
            "oracle",
            format!("command {}", config.oracle.command.join(" ")),
        ),
        OracleKind::Http => match &config.oracle.api_key_env {
            Some(var) if std::env::var(var).is_ok_and(|value| !value.trim().is_empty()) => {
                ok("oracle", format!("http, credential from {var}"))
            }
            Some(var) => fail("oracle", format!("credential {var} not set")),
            None => ok("oracle", "http without credential"),
        },
    }
}

fn ok(name: &str, detail: impl Into<String>) -> HealthCheck {
    check(name, CheckLevel::Ok, detail)
}

fn warn(name: &str, detail: impl Into<String>) -> HealthCheck {
    check(name, CheckLevel::Warn, detail)
}

fn fail(name: &str, detail: impl Into<String>) -> HealthCheck {
    check(name, CheckLevel::Fail, detail)
}

fn check(name: &str, level: CheckLevel, detail: impl Into<String>) -> HealthCheck {
    HealthCheck {
        name: name.to_string(),
        level,
        detail: detail.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::init::{InitOptions, init_project};
    use std::fs;

    fn level_of(report: &HealthReport, name: &str) -> Option<CheckLevel> {
        report
            .checks
            .iter()
            .find(|check| check.name == name)
            .map(|check| check.level)
    }

    #[test]
    fn uninitialized_root_is_unhealthy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let report = check_health(temp.path(), Utc::now());
        assert!(!report.healthy());
        assert_eq!(level_of(&report, "state dir"), Some(CheckLevel::Fail));
    }

    #[test]
    fn fresh_init_is_healthy_with_warnings() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_project(temp.path(), &InitOptions { force: false }).expect("init");
        let report = check_health(temp.path(), Utc::now());
        assert!(report.healthy(), "{}", report.render());
        assert_eq!(level_of(&report, "state"), Some(CheckLevel::Warn));
        assert_eq!(level_of(&report, "oracle"), Some(CheckLevel::Warn));
    }

    #[test]
    fn stale_runs_warn_and_corrupt_state_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &InitOptions { force: false }).expect("init");
        let now = Utc::now();
        let state = PipelineState {
            last_run: Some(now - Duration::hours(30)),
            ..PipelineState::default()
        };
        FileStateStore::new(&paths.state_path)
            .save(&state)
            .expect("save");
        let report = check_health(temp.path(), now);
        assert_eq!(level_of(&report, "last run"), Some(CheckLevel::Warn));
        assert!(report.render().contains("30.0 hours ago"));

        fs::write(&paths.state_path, "{ nope").expect("corrupt");
        let report = check_health(temp.path(), now);
        assert_eq!(level_of(&report, "state"), Some(CheckLevel::Fail));
        assert!(!report.healthy());
    }

    #[test]
    fn missing_http_credential_fails() {
        let mut config = MenderConfig::default();
        config.oracle.kind = OracleKind::Http;
        config.oracle.endpoint = Some("http://127.0.0.1:9/repair".to_string());
        config.oracle.api_key_env = Some("MENDER_HEALTH_TEST_UNSET_KEY".to_string());
        assert_eq!(oracle_check(&config).level, CheckLevel::Fail);
    }
}
