//! External script hooks
//!
//! Each hook is an optional executable. It receives the incoming path as its
//! only argument and context in `DSS_*` environment variables. A non-zero exit
//! status is a hook failure.

use crate::config::HookConfig;
use crate::error::{RegistrationError, Result};
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    PreRegistration,
    PostRegistration,
    PreDelivery,
    PostDelivery,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::PreRegistration => "pre-registration",
            HookKind::PostRegistration => "post-registration",
            HookKind::PreDelivery => "pre-delivery",
            HookKind::PostDelivery => "post-delivery",
        }
    }
}

impl std::fmt::Display for HookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptHooks {
    config: HookConfig,
}

impl ScriptHooks {
    pub fn new(config: HookConfig) -> Self {
        Self { config }
    }

    pub fn script(&self, kind: HookKind) -> Option<&Path> {
        match kind {
            HookKind::PreRegistration => self.config.pre_registration.as_deref(),
            HookKind::PostRegistration => self.config.post_registration.as_deref(),
            HookKind::PreDelivery => self.config.pre_delivery.as_deref(),
            HookKind::PostDelivery => self.config.post_delivery.as_deref(),
        }
    }

    /// Run the hook if one is configured
    pub async fn run(&self, kind: HookKind, incoming: &Path, env: &[(String, String)]) -> Result<()> {
        let Some(script) = self.script(kind) else {
            return Ok(());
        };

        debug!(hook = %kind, script = %script.display(), incoming = %incoming.display(), "Running hook");

        let output = Command::new(script)
            .arg(incoming)
            .env("DSS_HOOK", kind.as_str())
            .env("DSS_INCOMING_PATH", incoming)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RegistrationError::hook(kind.as_str(), format!("cannot start '{}': {}", script.display(), e)))?;

        if output.status.success() {
            info!(hook = %kind, script = %script.display(), "Hook finished");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let status = output
            .status
            .code()
            .map(|c| format!("exit status {}", c))
            .unwrap_or_else(|| "terminated by signal".to_string());
        Err(RegistrationError::hook(
            kind.as_str(),
            format!("'{}' failed with {}: {}", script.display(), status, stderr.trim()),
        ))
    }

    /// Every configured script must exist and be a file
    pub fn check(&self) -> Result<()> {
        for kind in [
            HookKind::PreRegistration,
            HookKind::PostRegistration,
            HookKind::PreDelivery,
            HookKind::PostDelivery,
        ] {
            if let Some(script) = self.script(kind) {
                if !script.is_file() {
                    return Err(RegistrationError::config(format!(
                        "{} script '{}' does not exist",
                        kind,
                        script.display()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_unconfigured_hook_is_a_no_op() {
        ScriptHooks::default()
            .run(HookKind::PreDelivery, Path::new("/nowhere"), &[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_hook_sees_argument_and_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let hook = script(
            dir.path(),
            "post.sh",
            &format!("echo \"$1 $DSS_HOOK $DSS_OUTCOME\" > {}", out.display()),
        );
        let hooks = ScriptHooks::new(HookConfig {
            post_delivery: Some(hook),
            ..Default::default()
        });

        hooks
            .run(
                HookKind::PostDelivery,
                Path::new("/in/NEMO.EXP1==S1"),
                &[("DSS_OUTCOME".to_string(), "success".to_string())],
            )
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(&out).unwrap().trim(),
            "/in/NEMO.EXP1==S1 post-delivery success"
        );
    }

    #[tokio::test]
    async fn test_failing_hook_is_secondary() {
        let dir = tempfile::tempdir().unwrap();
        let hook = script(dir.path(), "fail.sh", "echo nope >&2; exit 3");
        let hooks = ScriptHooks::new(HookConfig {
            post_registration: Some(hook),
            ..Default::default()
        });

        let err = hooks
            .run(HookKind::PostRegistration, Path::new("/in/x"), &[])
            .await
            .unwrap_err();
        assert_eq!(err.class(), dss_common::ErrorClass::Secondary);
        assert!(err.to_string().contains("exit status 3"));
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_check_reports_missing_script() {
        let hooks = ScriptHooks::new(HookConfig {
            pre_registration: Some(PathBuf::from("/definitely/not/here.sh")),
            ..Default::default()
        });
        assert!(hooks.check().is_err());
        assert!(ScriptHooks::default().check().is_ok());
    }
}
