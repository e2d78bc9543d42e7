//! `shell.*` syscalls: running host processes.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::syscall::{syscall_fn, SyscallSet};

use super::string_arg;

/// Namespace a plug must be granted to use [`shell_syscalls`].
pub const SHELL_NAMESPACE: &str = "shell";

/// `shell.run(cmd, args)` executing in `root`.
///
/// Resolves to `{stdout, stderr}`; a non-zero exit fails the syscall.
/// Register behind [`SHELL_NAMESPACE`].
pub fn shell_syscalls(root: impl Into<PathBuf>) -> SyscallSet {
    let root = Arc::new(root.into());
    SyscallSet::new().with(
        "shell.run",
        syscall_fn(move |ctx, args| {
            let root = root.clone();
            async move {
                let cmd = string_arg(&args, 0, "shell.run", "command")?;
                let cmd_args = command_args(args.get(1))?;
                tracing::debug!(plug = %ctx.plug, cmd = %cmd, args = ?cmd_args, "shell.run");

                let output = Command::new(&cmd)
                    .args(&cmd_args)
                    .current_dir(root.as_ref())
                    .kill_on_drop(true)
                    .output()
                    .await
                    .map_err(|e| Error::syscall(format!("shell.run: {}: {}", cmd, e)))?;

                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                if !output.status.success() {
                    return Err(Error::syscall(format!(
                        "shell.run: {} exited with {}: {}",
                        cmd,
                        output.status,
                        stderr.trim_end()
                    )));
                }
                Ok(json!({ "stdout": stdout, "stderr": stderr }))
            }
        }),
    )
}

fn command_args(value: Option<&Value>) -> Result<Vec<String>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(Error::syscall(format!(
                    "shell.run: arguments must be strings, got {}",
                    other
                ))),
            })
            .collect(),
        Some(other) => Err(Error::syscall(format!(
            "shell.run: expected an argument list, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::{SyscallContext, SyscallRegistry};
    use std::collections::HashSet;

    fn registry(root: &std::path::Path) -> SyscallRegistry {
        let registry = SyscallRegistry::new();
        registry
            .register(&[SHELL_NAMESPACE], shell_syscalls(root))
            .unwrap();
        registry
    }

    #[test]
    fn test_command_args() {
        assert!(command_args(None).unwrap().is_empty());
        assert_eq!(
            command_args(Some(&json!(["-l", "x"]))).unwrap(),
            vec!["-l".to_string(), "x".to_string()]
        );
        assert!(command_args(Some(&json!([1]))).is_err());
        assert!(command_args(Some(&json!("-l"))).is_err());
    }

    #[tokio::test]
    async fn test_shell_requires_grant() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let err = registry
            .dispatch(
                &SyscallContext::new("p"),
                &HashSet::new(),
                "shell.run",
                vec![json!("echo")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_run() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let registry = registry(dir.path());
        let granted: HashSet<String> = HashSet::from([SHELL_NAMESPACE.to_string()]);
        let ctx = SyscallContext::new("p");

        let out = registry
            .dispatch(&ctx, &granted, "shell.run", vec![json!("ls"), json!([])])
            .await
            .unwrap();
        assert!(out["stdout"].as_str().unwrap().contains("marker.txt"));

        let err = registry
            .dispatch(&ctx, &granted, "shell.run", vec![json!("false")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Syscall(_)));
    }
}
