//! Hook command execution between slices, with template substitution.

use crate::error::Error;
use crate::error::Result;
use std::path::Path;
use std::process::Command;

/// Moment at which a hook fires.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HookContext {
    /// Before the operation touches its first slice.
    Init,
    /// A slice was completed or is about to be needed.
    Operation,
    /// The last slice of the archive was completed.
    LastSlice,
}

impl HookContext {
    fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Operation => "operation",
            Self::LastSlice => "last_slice",
        }
    }
}

/// Everything a hook template may refer to.
#[derive(Clone, Debug)]
pub struct HookCall {
    pub context: HookContext,
    /// Directory holding the slices.
    pub parent: std::path::PathBuf,
    /// Slice base name.
    pub basename: String,
    /// Slice number.
    pub number: usize,
    /// Slice number, zero padded as on disk.
    pub padded_number: String,
    /// Slice extension.
    pub extension: String,
    /// Remote location, when any.
    pub url: String,
}

/// Callback run when a slice is completed or needed.
pub trait SliceHook {
    fn execute(&self, call: &HookCall) -> Result<()>;
}

/// Expands the substitution variables of a hook template:
/// `%p` parent path, `%b` basename, `%n` number, `%N` padded number,
/// `%e` extension, `%c` context, `%u` url, `%%` a literal percent.
pub fn substitute(template: &str, call: &HookCall) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('p') => out.push_str(&call.parent.to_string_lossy()),
            Some('b') => out.push_str(&call.basename),
            Some('n') => out.push_str(&call.number.to_string()),
            Some('N') => out.push_str(&call.padded_number),
            Some('e') => out.push_str(&call.extension),
            Some('c') => out.push_str(call.context.as_str()),
            Some('u') => out.push_str(&call.url),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// Hook running a shell command built from a template.
pub struct CommandHook {
    template: String,
}

impl CommandHook {
    pub fn new(template: &str) -> Self {
        Self {
            template: template.to_string(),
        }
    }
}

impl SliceHook for CommandHook {
    fn execute(&self, call: &HookCall) -> Result<()> {
        let line = substitute(&self.template, call);
        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg(&line)
            .current_dir(hook_dir(&call.parent))
            .status()
            .map_err(|e| Error::Script(format!("{line}: {e}")))?;
        if !status.success() {
            return Err(Error::Script(format!(
                "{line}: exited with status {}",
                status.code().unwrap_or(-1)
            )));
        }
        Ok(())
    }
}

fn hook_dir(parent: &Path) -> &Path {
    if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn substitution() {
        let call = HookCall {
            context: HookContext::LastSlice,
            parent: PathBuf::from("/backups"),
            basename: "arc".to_string(),
            number: 3,
            padded_number: "003".to_string(),
            extension: "dar".to_string(),
            url: String::new(),
        };
        assert_eq!(
            substitute("mv %p/%b.%N.%e /vault # %c %%", &call),
            "mv /backups/arc.003.dar /vault # last_slice %"
        );
        assert_eq!(substitute("%n%", &call), "3%");
    }
}
