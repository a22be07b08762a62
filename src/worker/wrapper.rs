use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use uuid::Uuid;

use crate::config::BackendConfig;
use crate::error::{LrmsError, Result};
use crate::scheduler::JobSpec;
use crate::transport::{bounded, sh_quote, sh_quote_path, Transport, TransportError};
use crate::worker::usage::{self, UsageReport};

pub const WRAPPER_DIR: &str = ".wrapper";
pub const PID_FILE: &str = "pid";
pub const LAUNCHER_FILE: &str = "launcher";
pub const USAGE_FILE: &str = "usage.report";

/// Paths of one job's execution directory on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperLayout {
    pub root: PathBuf,
    pub meta_dir: PathBuf,
    pub pid_file: PathBuf,
    pub launcher: PathBuf,
    pub usage_report: PathBuf,
}

impl WrapperLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let meta_dir = root.join(WRAPPER_DIR);
        Self {
            pid_file: meta_dir.join(PID_FILE),
            launcher: meta_dir.join(LAUNCHER_FILE),
            usage_report: meta_dir.join(USAGE_FILE),
            meta_dir,
            root,
        }
    }

    /// A fresh, uniquely named root under `spool_dir`.
    pub fn unique_in(spool_dir: &Path) -> Self {
        Self::new(spool_dir.join(format!("job-{}", Uuid::new_v4().simple())))
    }
}

/// Render the POSIX sh launcher.
///
/// The script records its pid, exports the requested environment, enters the
/// execution directory and replaces itself with the measurement utility. That
/// runs the command with the requested redirections and appends the usage
/// report on exit. Because of the `exec`, the recorded pid is the process to
/// watch. The command words follow `--`, so none of them is read as an option.
pub fn render_launcher(spec: &JobSpec, layout: &WrapperLayout, time_cmd: &Path) -> String {
    let mut command = vec![
        sh_quote_path(time_cmd),
        "-o".to_string(),
        sh_quote_path(&layout.usage_report),
        "-a".to_string(),
        "-f".to_string(),
        sh_quote(&usage::usage_format()),
        "--".to_string(),
    ];
    command.extend(spec.arguments.iter().map(|arg| sh_quote(arg)));

    let stdin = spec.stdin.as_deref().unwrap_or("/dev/null");
    let stdout = spec.stdout.as_deref().unwrap_or("/dev/null");
    command.push(format!("<{}", sh_quote(stdin)));
    command.push(format!(">{}", sh_quote(stdout)));
    if spec.join {
        command.push("2>&1".to_string());
    } else {
        let stderr = spec.stderr.as_deref().unwrap_or("/dev/null");
        command.push(format!("2>{}", sh_quote(stderr)));
    }

    let exports: String = spec
        .environment
        .iter()
        .map(|(name, value)| format!("export {}={}\n", name, sh_quote(value)))
        .collect();

    format!(
        "#!/bin/sh\necho $$ > {pid}\n{exports}cd {root} || exit 126\nexec {command}\n",
        pid = sh_quote_path(&layout.pid_file),
        exports = exports,
        root = sh_quote_path(&layout.root),
        command = command.join(" "),
    )
}

/// Whether `name` can be exported from a POSIX shell.
pub fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Create the execution directory, stage inputs and write the launcher.
///
/// On failure the directory is left in place for diagnosis; its path is in
/// the returned [`LrmsError::Submission`].
pub async fn prepare(
    transport: &dyn Transport,
    config: &BackendConfig,
    spec: &JobSpec,
) -> Result<WrapperLayout> {
    let layout = WrapperLayout::unique_in(&config.spool_dir);
    let timeout = config.transport_timeout();
    let fail = |reason: String| LrmsError::Submission {
        exec_dir: Some(layout.root.clone()),
        reason,
    };

    bounded(timeout, "mkdir", transport.makedirs(&layout.root))
        .await
        .map_err(|e| fail(format!("creating execution directory: {}", e)))?;

    for input in &spec.inputs {
        if !is_relative_inside(&input.target) {
            return Err(fail(format!(
                "input target {:?} escapes the execution directory",
                input.target
            )));
        }
        let target = layout.root.join(&input.target);
        if let Some(parent) = target.parent() {
            bounded(timeout, "mkdir", transport.makedirs(parent))
                .await
                .map_err(|e| fail(format!("staging {:?}: {}", input.target, e)))?;
        }
        bounded(timeout, "put", transport.put(&input.source, &target))
            .await
            .map_err(|e| fail(format!("staging {:?}: {}", input.source, e)))?;

        if is_executable(&input.source).await {
            bounded(timeout, "chmod", transport.chmod(&target, 0o755))
                .await
                .map_err(|e| fail(format!("staging {:?}: {}", input.target, e)))?;
        }
        tracing::debug!(source = %input.source.display(), target = %target.display(), "Staged input");
    }

    bounded(timeout, "mkdir", transport.makedirs(&layout.meta_dir))
        .await
        .map_err(|e| fail(format!("creating wrapper directory: {}", e)))?;

    let script = render_launcher(spec, &layout, &config.time_cmd);
    bounded(
        timeout,
        "write launcher",
        transport.write_file(&layout.launcher, script.as_bytes()),
    )
    .await
    .map_err(|e| fail(format!("writing launcher: {}", e)))?;
    bounded(timeout, "chmod", transport.chmod(&layout.launcher, 0o755))
        .await
        .map_err(|e| fail(format!("marking launcher executable: {}", e)))?;

    Ok(layout)
}

/// Start the launcher detached and wait for it to report its pid.
pub async fn launch(
    transport: &dyn Transport,
    config: &BackendConfig,
    layout: &WrapperLayout,
) -> Result<u32> {
    let timeout = config.transport_timeout();
    let fail = |reason: String| LrmsError::Submission {
        exec_dir: Some(layout.root.clone()),
        reason,
    };

    let out = bounded(
        timeout,
        "launch",
        transport.execute_command(&sh_quote_path(&layout.launcher), true),
    )
    .await
    .map_err(|e| fail(format!("starting launcher: {}", e)))?;
    if !out.success() {
        return Err(fail(format!(
            "starting launcher exited with {}: {}",
            out.exit_code,
            out.stderr.trim()
        )));
    }

    config
        .pid_file_retry
        .run("pid file", |_| read_pid(transport, timeout, &layout.pid_file))
        .await
        .map_err(|e| fail(format!("launcher never reported its pid: {}", e)))
}

async fn read_pid(
    transport: &dyn Transport,
    timeout: std::time::Duration,
    path: &Path,
) -> std::result::Result<u32, TransportError> {
    let bytes = bounded(timeout, "read pid", transport.read_file(path)).await?;
    String::from_utf8_lossy(&bytes)
        .trim()
        .parse()
        .map_err(|_| TransportError::NotFound(path.to_path_buf()))
}

/// Read and parse the usage report. `Ok(None)` when it was never written.
pub async fn read_usage(
    transport: &dyn Transport,
    timeout: std::time::Duration,
    layout: &WrapperLayout,
) -> std::result::Result<Option<UsageReport>, TransportError> {
    match bounded(
        timeout,
        "read usage",
        transport.read_file(&layout.usage_report),
    )
    .await
    {
        Ok(bytes) => Ok(Some(usage::parse(&String::from_utf8_lossy(&bytes)))),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

fn is_relative_inside(path: &Path) -> bool {
    path.components().next().is_some()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

async fn is_executable(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let layout = WrapperLayout::new("/spool/job-1");
        assert_eq!(layout.meta_dir, PathBuf::from("/spool/job-1/.wrapper"));
        assert_eq!(layout.pid_file, PathBuf::from("/spool/job-1/.wrapper/pid"));
        assert_eq!(
            layout.launcher,
            PathBuf::from("/spool/job-1/.wrapper/launcher")
        );
        assert_eq!(
            layout.usage_report,
            PathBuf::from("/spool/job-1/.wrapper/usage.report")
        );
    }

    #[test]
    fn unique_layouts_differ() {
        let a = WrapperLayout::unique_in(Path::new("/spool"));
        let b = WrapperLayout::unique_in(Path::new("/spool"));
        assert_ne!(a.root, b.root);
        assert!(a.root.starts_with("/spool"));
    }

    #[test]
    fn launcher_records_pid_then_execs_time() {
        let spec = JobSpec::new(["echo", "hello world"])
            .with_env("GREETING", "hi there")
            .with_stdout("out.txt")
            .with_stderr("err.txt");
        let layout = WrapperLayout::new("/spool/job-1");
        let script = render_launcher(&spec, &layout, Path::new("/usr/bin/time"));
        let lines: Vec<&str> = script.lines().collect();

        assert_eq!(lines[0], "#!/bin/sh");
        assert_eq!(lines[1], "echo $$ > /spool/job-1/.wrapper/pid");
        assert_eq!(lines[2], "export GREETING='hi there'");
        assert_eq!(lines[3], "cd /spool/job-1 || exit 126");
        assert!(lines[4].starts_with(
            "exec /usr/bin/time -o /spool/job-1/.wrapper/usage.report -a -f 'WallTime=%es\\n"
        ));
        assert!(lines[4].contains("' -- echo 'hello world' "));
        assert!(lines[4].ends_with("</dev/null >out.txt 2>err.txt"));
    }

    #[test]
    fn launcher_defaults_and_join() {
        let layout = WrapperLayout::new("/spool/job-2");
        let script = render_launcher(&JobSpec::new(["true"]), &layout, Path::new("/usr/bin/time"));
        assert!(script.contains(" -- true </dev/null >/dev/null 2>/dev/null"));
        assert!(!script.contains("export"));

        let joined = JobSpec::new(["true"]).with_stdout("all.log").joined();
        let script = render_launcher(&joined, &layout, Path::new("/usr/bin/time"));
        assert!(script.contains(" >all.log 2>&1"));
    }

    #[test]
    fn command_words_never_read_as_options() {
        let layout = WrapperLayout::new("/spool/job-3");
        let spec = JobSpec::new(["-v", "x=y"]).with_env("A", "1");
        let script = render_launcher(&spec, &layout, Path::new("/usr/bin/time"));
        assert!(script.contains("\nexport A=1\n"));
        assert!(script.contains(" -- -v x=y <"));
        assert!(!script.contains(" env "));
    }

    #[test]
    fn env_names() {
        assert!(is_env_name("PATH"));
        assert!(is_env_name("_x1"));
        assert!(!is_env_name(""));
        assert!(!is_env_name("1ABC"));
        assert!(!is_env_name("A-B"));
        assert!(!is_env_name("A=B"));
    }

    #[test]
    fn input_targets_must_stay_inside() {
        assert!(is_relative_inside(Path::new("data/in.txt")));
        assert!(is_relative_inside(Path::new("./in.txt")));
        assert!(!is_relative_inside(Path::new("/etc/passwd")));
        assert!(!is_relative_inside(Path::new("../escape")));
        assert!(!is_relative_inside(Path::new("")));
    }
}
