// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Argument list for the download utility.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::jobs::{Credentials, Platform};

/// One invocation of the download utility.
///
/// Produces `+@sSteamCmdForcePlatformType <p> +force_install_dir <dir>
/// +login <user> [pass] [guard] +app_update <target> [validate] +quit`,
/// each token a separate argument.
#[derive(Debug, Clone)]
pub struct DownloadCommand {
    binary: PathBuf,
    install_dir: PathBuf,
    target: String,
    credentials: Credentials,
    platform: Option<Platform>,
    validate: bool,
}

impl DownloadCommand {
    pub fn new(
        binary: impl Into<PathBuf>,
        install_dir: impl Into<PathBuf>,
        target: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            binary: binary.into(),
            install_dir: install_dir.into(),
            target: target.into(),
            credentials,
            platform: None,
            validate: true,
        }
    }

    pub fn platform(mut self, platform: Option<Platform>) -> Self {
        self.platform = platform;
        self
    }

    pub fn validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn args(&self) -> Vec<String> {
        self.build_args(false)
    }

    /// Arguments with the password and guard code replaced, for logs.
    pub fn redacted_args(&self) -> Vec<String> {
        self.build_args(true)
    }

    fn build_args(&self, redact: bool) -> Vec<String> {
        let mut args = Vec::with_capacity(12);

        if let Some(platform) = self.platform {
            args.push("+@sSteamCmdForcePlatformType".to_string());
            args.push(platform.as_str().to_string());
        }

        args.push("+force_install_dir".to_string());
        args.push(self.install_dir.to_string_lossy().into_owned());

        args.push("+login".to_string());
        if self.credentials.is_anonymous() {
            args.push(Credentials::ANONYMOUS.to_string());
        } else {
            let secret = |value: &String| {
                if redact {
                    "[REDACTED]".to_string()
                } else {
                    value.clone()
                }
            };
            args.push(if redact {
                self.credentials.masked_username()
            } else {
                self.credentials.username.clone()
            });
            if let Some(password) = &self.credentials.password {
                args.push(secret(password));
                if let Some(guard) = &self.credentials.guard_code {
                    args.push(secret(guard));
                }
            }
        }

        args.push("+app_update".to_string());
        args.push(self.target.clone());
        if self.validate {
            args.push("validate".to_string());
        }
        args.push("+quit".to_string());
        args
    }

    /// Process builder: null stdin, piped output, killed if dropped.
    ///
    /// On unix the child leads its own process group so termination reaches
    /// any helpers it spawns.
    pub fn to_command(&self) -> Command {
        let mut std_command = std::process::Command::new(&self.binary);
        std_command
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_command.process_group(0);
        }

        let mut command = Command::from(std_command);
        command.kill_on_drop(true);
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_args() {
        let cmd = DownloadCommand::new("/opt/steamcmd.sh", "/data/downloads/j1", "740", Credentials::anonymous());
        assert_eq!(
            cmd.args(),
            vec![
                "+force_install_dir",
                "/data/downloads/j1",
                "+login",
                "anonymous",
                "+app_update",
                "740",
                "validate",
                "+quit"
            ]
        );
    }

    #[test]
    fn test_authenticated_args_with_platform() {
        let creds = Credentials::from_parts(Some("someone".into()), Some("pw".into()), Some("F00D".into()));
        let cmd = DownloadCommand::new("steamcmd", "/d", "10", creds)
            .platform(Some(Platform::Windows))
            .validate(false);
        assert_eq!(
            cmd.args(),
            vec![
                "+@sSteamCmdForcePlatformType",
                "windows",
                "+force_install_dir",
                "/d",
                "+login",
                "someone",
                "pw",
                "F00D",
                "+app_update",
                "10",
                "+quit"
            ]
        );
    }

    #[test]
    fn test_redacted_args_hide_secrets() {
        let creds = Credentials::from_parts(Some("someone".into()), Some("hunter2".into()), Some("F00D".into()));
        let cmd = DownloadCommand::new("steamcmd", "/d", "10", creds);
        let joined = cmd.redacted_args().join(" ");
        assert!(!joined.contains("hunter2"));
        assert!(!joined.contains("F00D"));
        assert!(!joined.contains("someone"));
        assert!(joined.contains("+login som... [REDACTED] [REDACTED]"));
    }
}
