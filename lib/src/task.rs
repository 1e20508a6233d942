use std::{
    ffi::OsStr,
    io::Write,
    process::{Child, Command, Stdio},
};

use anyhow::{Context, Result};
use vinstall_utils::CommandDisplay;

/// A helper binary invocation (mount, isoinfo, curl, ...). Library code
/// never writes to stdout; descriptions go to the log.
pub(crate) struct Task {
    description: String,
    quiet: bool,
    pub(crate) cmd: Command,
}

impl Task {
    pub(crate) fn new(description: impl AsRef<str>, exe: impl AsRef<str>) -> Self {
        let description = description.as_ref().to_string();
        let mut cmd = Command::new(exe.as_ref());
        // Default to noninteractive
        cmd.stdin(Stdio::null());
        Self {
            description,
            quiet: false,
            cmd,
        }
    }

    pub(crate) fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub(crate) fn args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cmd.args(args);
        self
    }

    fn announce(&self) {
        if !self.quiet {
            tracing::info!("{}", self.description);
        }
        tracing::debug!("exec: {}", CommandDisplay::new(&self.cmd));
    }

    /// Run the command, returning an error if the command does not exit successfully.
    pub(crate) fn run(mut self) -> Result<()> {
        self.announce();
        let description = self.description;
        let st = self
            .cmd
            .status()
            .with_context(|| format!("Spawning {description} failed"))?;
        if !st.success() {
            anyhow::bail!("Task {description} failed: {st:?}");
        }
        Ok(())
    }

    /// Run the command and report only whether it exited successfully;
    /// used for existence probes where failure is an answer, not an error.
    pub(crate) fn succeeds(mut self) -> Result<bool> {
        self.announce();
        self.cmd.stdout(Stdio::null()).stderr(Stdio::null());
        let st = self
            .cmd
            .status()
            .with_context(|| format!("Spawning {} failed", self.description))?;
        Ok(st.success())
    }

    /// Start the command without waiting for it; used to build pipelines.
    pub(crate) fn spawn(mut self) -> Result<Child> {
        self.announce();
        self.cmd
            .spawn()
            .with_context(|| format!("Spawning {} failed", self.description))
    }

    /// Like [`run()`], but return stdout.
    pub(crate) fn read_bytes(self) -> Result<Vec<u8>> {
        self.announce();
        let description = self.description;
        let mut cmd = self.cmd;
        cmd.stdout(Stdio::piped());
        let child = cmd
            .spawn()
            .with_context(|| format!("Spawning {description} failed"))?;
        let o = child
            .wait_with_output()
            .with_context(|| format!("Executing {description} failed"))?;
        let st = o.status;
        if !st.success() {
            anyhow::bail!("Task {description} failed: {st:?}");
        }
        Ok(o.stdout)
    }

    /// Like [`run()`], but stream stdout into `w`, returning the byte count.
    pub(crate) fn copy_stdout_to(mut self, w: &mut dyn Write) -> Result<u64> {
        self.announce();
        let description = self.description;
        self.cmd.stdout(Stdio::piped());
        let mut child = self
            .cmd
            .spawn()
            .with_context(|| format!("Spawning {description} failed"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("{description}: no stdout"))?;
        let copied = std::io::copy(&mut stdout, w);
        // A writer error closes the pipe so the child can exit
        drop(stdout);
        let st = child
            .wait()
            .with_context(|| format!("Executing {description} failed"))?;
        let n = copied.with_context(|| format!("Reading output of {description}"))?;
        if !st.success() {
            anyhow::bail!("Task {description} failed: {st:?}");
        }
        Ok(n)
    }

    /// Like [`read_bytes()`], but the output must be UTF-8.
    pub(crate) fn read(self) -> Result<String> {
        let description = self.description.clone();
        let buf = self.read_bytes()?;
        String::from_utf8(buf).with_context(|| format!("Parsing output of {description}"))
    }

    pub(crate) fn new_and_run<'a>(
        description: impl AsRef<str>,
        exe: impl AsRef<str>,
        args: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        Self::new(description, exe).args(args).run()
    }
}

#[test]
fn test_copy_stdout_to() -> Result<()> {
    let mut buf = Vec::new();
    let n = Task::new("Greeting", "echo")
        .quiet()
        .args(["hello"])
        .copy_stdout_to(&mut buf)?;
    assert_eq!(n, 6);
    assert_eq!(buf, b"hello\n");
    assert!(Task::new("Failing", "false")
        .quiet()
        .copy_stdout_to(&mut Vec::new())
        .is_err());
    Ok(())
}
