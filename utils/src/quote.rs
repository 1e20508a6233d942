use std::ffi::OsStr;
use std::fmt::Display;
use std::os::unix::ffi::OsStrExt;
use std::process::Command;

/// Render a [`Command`] as a line that a default POSIX shell would parse
/// back into the same argument vector.
#[derive(Debug)]
pub struct CommandDisplay<'a> {
    cmd: &'a Command,
}

impl<'a> CommandDisplay<'a> {
    /// Wrap a command for display; nothing is copied.
    pub fn new(cmd: &'a Command) -> Self {
        Self { cmd }
    }
}

fn is_shell_safe(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"/.-_=:,+@".contains(&b)
}

fn write_word(f: &mut std::fmt::Formatter<'_>, word: &OsStr) -> std::fmt::Result {
    let bytes = word.as_bytes();
    if !bytes.is_empty() && bytes.iter().copied().all(is_shell_safe) {
        // All bytes are ASCII here
        return f.write_str(&String::from_utf8_lossy(bytes));
    }
    let quoted = shlex::bytes::try_quote(bytes).map_err(|_| std::fmt::Error)?;
    f.write_str(&String::from_utf8_lossy(&quoted))
}

impl Display for CommandDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write_word(f, self.cmd.get_program())?;
        for arg in self.cmd.get_args() {
            f.write_str(" ")?;
            write_word(f, arg)?;
        }
        Ok(())
    }
}
