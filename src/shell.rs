/// Quote a single argument for a POSIX shell.
///
/// Plain words are passed through untouched; everything else is wrapped in
/// single quotes with embedded single quotes written as `'\''`.
pub fn quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// Join a command and its arguments into one command line
pub fn command_line(command: &str, args: &[String]) -> String {
    let mut line = command.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&quote(arg));
    }
    line
}

/// Wrap a whole script body for `bash -c`
pub fn bash_c(script: &str) -> String {
    format!("bash -c '{}'", script.replace('\'', "'\\''"))
}
