//! Command line and environment marshaling.
//!
//! Turns structured launch inputs into what the OS process-creation ABI
//! expects: an argv vector on POSIX, a single quoted command line string on
//! Windows, and `KEY=VALUE` environment entries for either.
//!
//! The functions here are pure so the quoting rules can be tested on every
//! host, whichever platform actually consumes them.

use super::env::EnvMap;
use crate::config::ShellConfig;
use crate::error::{PopenError, Result};
use std::path::{Path, PathBuf};

/// Program and argv for an `exec`-family call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PosixCommand {
    pub program: PathBuf,
    pub argv: Vec<String>,
}

/// Application name and command line for `CreateProcessW`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowsCommand {
    pub application: Option<PathBuf>,
    pub command_line: String,
}

fn needs_quotes(arg: &str) -> bool {
    arg.is_empty() || arg.contains([' ', '\t', '\n', '\x0b'])
}

/// Append `arg` to `out`, quoted so the MSVC runtime parser recovers it exactly.
///
/// Backslashes are literal unless they precede a double quote; in that case
/// they are doubled and the quote itself is escaped. Trailing backslashes are
/// doubled when the argument is wrapped in quotes.
pub fn quote_arg(arg: &str, out: &mut String) {
    let quote = needs_quotes(arg);
    if quote {
        out.push('"');
    }

    let mut backslashes = 0usize;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                out.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
            }
            _ => {
                out.extend(std::iter::repeat('\\').take(backslashes));
                backslashes = 0;
                out.push(c);
            }
        }
    }

    if quote {
        out.extend(std::iter::repeat('\\').take(backslashes * 2));
        out.push('"');
    } else {
        out.extend(std::iter::repeat('\\').take(backslashes));
    }
}

/// Join arguments into one Windows command line.
pub fn list2cmdline<S: AsRef<str>>(args: &[S]) -> String {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        quote_arg(arg.as_ref(), &mut out);
    }
    out
}

fn reject_nul(what: &str, value: &str) -> Result<()> {
    if value.contains('\0') {
        return Err(PopenError::invalid_argument(format!(
            "{} contains an embedded NUL byte",
            what
        )));
    }
    Ok(())
}

fn check_args(executable: Option<&Path>, args: &[String]) -> Result<()> {
    if let Some(exe) = executable {
        reject_nul("executable", &exe.to_string_lossy())?;
    }
    for arg in args {
        reject_nul("argument", arg)?;
    }
    Ok(())
}

/// Quote `arg` for a POSIX shell word: bare when it only holds safe
/// characters, otherwise single-quoted with `'` written as `'\''`.
pub fn sh_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"@%+=:,./_-".contains(&b));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// Build the POSIX argv.
///
/// With `shell` set, `args[0]` is the shell command text, taken as is, and
/// each later argument is appended as one quoted word. The result is the
/// single `-c` operand of that interpreter.
pub fn posix_command(
    executable: Option<&Path>,
    args: &[String],
    shell: Option<&Path>,
) -> Result<PosixCommand> {
    check_args(executable, args)?;

    if let Some(interpreter) = shell {
        if args.is_empty() {
            return Err(PopenError::invalid_argument("shell mode needs a command"));
        }
        let interpreter_str = interpreter.to_string_lossy().into_owned();
        return Ok(PosixCommand {
            program: interpreter.to_path_buf(),
            argv: vec![
                interpreter_str,
                ShellConfig::POSIX_SHELL_FLAG.to_string(),
                shell_command_text(args),
            ],
        });
    }

    let program = match (executable, args.first()) {
        (Some(exe), _) => exe.to_path_buf(),
        (None, Some(first)) => PathBuf::from(first),
        (None, None) => return Err(PopenError::invalid_argument("no program to run")),
    };
    let argv = if args.is_empty() {
        vec![program.to_string_lossy().into_owned()]
    } else {
        args.to_vec()
    };
    Ok(PosixCommand { program, argv })
}

fn shell_command_text(args: &[String]) -> String {
    let mut text = args[0].clone();
    for arg in &args[1..] {
        text.push(' ');
        text.push_str(&sh_quote(arg));
    }
    text
}

/// Build the Windows application name and command line.
///
/// With `shell` set, the marshaled command line is wrapped as
/// `<interpreter> /c "<command line>"`.
pub fn windows_command(
    executable: Option<&Path>,
    args: &[String],
    shell: Option<&Path>,
) -> Result<WindowsCommand> {
    check_args(executable, args)?;

    let inner = if args.is_empty() {
        match executable {
            Some(exe) => list2cmdline(&[exe.to_string_lossy()]),
            None => return Err(PopenError::invalid_argument("no program to run")),
        }
    } else {
        list2cmdline(args)
    };

    match shell {
        Some(interpreter) => Ok(WindowsCommand {
            application: Some(interpreter.to_path_buf()),
            command_line: format!(
                "{} {} \"{}\"",
                interpreter.display(),
                ShellConfig::WINDOWS_SHELL_FLAG,
                inner
            ),
        }),
        None => Ok(WindowsCommand {
            application: executable.map(Path::to_path_buf),
            command_line: inner,
        }),
    }
}

/// Validated `KEY=VALUE` entries in mapping order.
///
/// Returns `None` for an empty mapping: the child then inherits the
/// parent's environment unchanged.
pub fn env_entries(env: &EnvMap) -> Result<Option<Vec<String>>> {
    if env.is_empty() {
        return Ok(None);
    }
    let mut entries = Vec::with_capacity(env.len());
    for (key, value) in env.iter() {
        // A leading '=' is legal on Windows (per-drive cwd variables).
        let rest = key.strip_prefix('=').unwrap_or(key);
        if rest.is_empty() || rest.contains('=') {
            return Err(PopenError::invalid_argument(format!(
                "illegal environment variable name: {:?}",
                key
            )));
        }
        reject_nul("environment variable", key)?;
        reject_nul("environment value", value)?;
        entries.push(format!("{}={}", key, value));
    }
    Ok(Some(entries))
}

/// UTF-16 environment block: NUL-separated entries, terminated by an extra NUL.
pub fn env_block_wide(env: &EnvMap) -> Result<Option<Vec<u16>>> {
    let Some(entries) = env_entries(env)? else {
        return Ok(None);
    };
    let mut block = Vec::new();
    for entry in entries {
        block.extend(entry.encode_utf16());
        block.push(0);
    }
    block.push(0);
    Ok(Some(block))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_list2cmdline_plain() {
        assert_eq!(list2cmdline(&["echo", "hello"]), "echo hello");
    }

    #[test]
    fn test_list2cmdline_quotes_whitespace_and_empty() {
        assert_eq!(list2cmdline(&["a b", "", "c\td"]), "\"a b\" \"\" \"c\td\"");
    }

    #[test]
    fn test_list2cmdline_escapes_quotes() {
        assert_eq!(list2cmdline(&["c\"d"]), "c\\\"d");
        assert_eq!(list2cmdline(&["a\\\"b"]), "a\\\\\\\"b");
    }

    #[test]
    fn test_list2cmdline_backslashes() {
        // Literal when not followed by a quote.
        assert_eq!(list2cmdline(&["C:\\dir\\file"]), "C:\\dir\\file");
        // Doubled before the closing quote.
        assert_eq!(list2cmdline(&["a b\\"]), "\"a b\\\\\"");
        assert_eq!(list2cmdline(&["ab\\"]), "ab\\");
    }

    #[test]
    fn test_posix_command_uses_first_arg() {
        let cmd = posix_command(None, &strings(&["echo", "hi"]), None).unwrap();
        assert_eq!(cmd.program, PathBuf::from("echo"));
        assert_eq!(cmd.argv, strings(&["echo", "hi"]));
    }

    #[test]
    fn test_posix_command_executable_override() {
        let cmd = posix_command(Some(Path::new("/bin/busybox")), &strings(&["ls", "-l"]), None)
            .unwrap();
        assert_eq!(cmd.program, PathBuf::from("/bin/busybox"));
        assert_eq!(cmd.argv, strings(&["ls", "-l"]));

        let cmd = posix_command(Some(Path::new("/bin/true")), &[], None).unwrap();
        assert_eq!(cmd.argv, strings(&["/bin/true"]));
    }

    #[test]
    fn test_posix_command_shell_wraps() {
        let cmd = posix_command(
            None,
            &strings(&["echo $HOME", "a  b", "it's", "plain"]),
            Some(Path::new("/bin/sh")),
        )
        .unwrap();
        assert_eq!(cmd.program, PathBuf::from("/bin/sh"));
        assert_eq!(
            cmd.argv,
            strings(&["/bin/sh", "-c", "echo $HOME 'a  b' 'it'\\''s' plain"])
        );
    }

    #[test]
    fn test_sh_quote() {
        assert_eq!(sh_quote("file.txt"), "file.txt");
        assert_eq!(sh_quote(""), "''");
        assert_eq!(sh_quote("$x"), "'$x'");
        assert_eq!(sh_quote("a'b"), "'a'\\''b'");
    }

    #[test]
    fn test_posix_command_rejects_empty_and_nul() {
        assert!(posix_command(None, &[], None).is_err());
        let err = posix_command(None, &strings(&["a\0b"]), None).unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_windows_command_shell_wraps() {
        let cmd = windows_command(
            None,
            &strings(&["dir", "C:\\Program Files"]),
            Some(Path::new("C:\\Windows\\System32\\cmd.exe")),
        )
        .unwrap();
        assert_eq!(
            cmd.application,
            Some(PathBuf::from("C:\\Windows\\System32\\cmd.exe"))
        );
        assert_eq!(
            cmd.command_line,
            "C:\\Windows\\System32\\cmd.exe /c \"dir \"C:\\Program Files\"\""
        );
    }

    #[test]
    fn test_windows_command_plain() {
        let cmd = windows_command(None, &strings(&["prog", "a b", "c\"d", ""]), None).unwrap();
        assert_eq!(cmd.application, None);
        assert_eq!(cmd.command_line, "prog \"a b\" c\\\"d \"\"");
    }

    #[test]
    fn test_env_entries_order_and_inherit() {
        assert_eq!(env_entries(&EnvMap::new()).unwrap(), None);

        let env: EnvMap = [("B", "2"), ("A", "1")].into_iter().collect();
        assert_eq!(
            env_entries(&env).unwrap(),
            Some(strings(&["B=2", "A=1"]))
        );
    }

    #[test]
    fn test_env_entries_reject_bad_names() {
        let env: EnvMap = [("A=B", "1")].into_iter().collect();
        assert!(env_entries(&env).is_err());
        let env: EnvMap = [("", "1")].into_iter().collect();
        assert!(env_entries(&env).is_err());
        let env: EnvMap = [("=C:", "C:\\")].into_iter().collect();
        assert!(env_entries(&env).is_ok());
    }

    #[test]
    fn test_env_block_wide_layout() {
        let env: EnvMap = [("A", "1"), ("BB", "x")].into_iter().collect();
        let block = env_block_wide(&env).unwrap().unwrap();
        let expected: Vec<u16> = "A=1\0BB=x\0\0".encode_utf16().collect();
        assert_eq!(block, expected);
    }
}
