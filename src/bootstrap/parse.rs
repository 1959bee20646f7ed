use crate::error::{AppError, AppResult};
use crate::ssh::Secret;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

static RESULT_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_.]*)==(.*)==$").unwrap());

const KNOWN_KEYS: &[&str] = &[
    "exitCode",
    "listeningOn",
    "connectionToken",
    "logFile",
    "platform",
    "arch",
    "serverPath",
];

/// Where the remote server accepts connections
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ListeningOn {
    Port(u16),
    SocketPath(String),
}

impl ListeningOn {
    /// Purely numeric values are ports; anything else stays a path
    pub fn parse(value: &str) -> Self {
        if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(port) = value.parse() {
                return ListeningOn::Port(port);
            }
        }
        ListeningOn::SocketPath(value.to_string())
    }
}

impl fmt::Display for ListeningOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListeningOn::Port(port) => write!(f, "{}", port),
            ListeningOn::SocketPath(path) => f.write_str(path),
        }
    }
}

/// Outcome of a successful install
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallResult {
    pub exit_code: i32,
    pub listening_on: ListeningOn,
    pub connection_token: Secret,
    pub log_file: String,
    pub platform: String,
    pub arch: String,
    pub server_path: String,
    /// Values of the propagated environment variables
    pub environment: BTreeMap<String, String>,
}

/// The delimited block plus everything printed around it
#[derive(Debug, Default)]
struct ResultBlock {
    values: BTreeMap<String, String>,
    outside: Vec<String>,
}

fn extract_block(stdout: &str, marker: &str) -> AppResult<ResultBlock> {
    let start = format!("{}: start", marker);
    let end = format!("{}: end", marker);

    let mut block = ResultBlock::default();
    let mut inside = false;
    let mut found = false;
    for line in stdout.lines() {
        let line = line.trim_end_matches('\r');
        if !inside && line.trim() == start {
            inside = true;
        } else if inside && line.trim() == end {
            inside = false;
            found = true;
        } else if inside {
            if let Some(caps) = RESULT_LINE.captures(line) {
                block.values.insert(caps[1].to_string(), caps[2].to_string());
            }
        } else {
            block.outside.push(line.to_string());
        }
    }

    if !found {
        return Err(AppError::ProtocolParse(if inside {
            "result block was not terminated (output truncated?)".to_string()
        } else {
            "no result block found in install output".to_string()
        }));
    }
    Ok(block)
}

/// Parse install script output into an `InstallResult`.
///
/// A missing or malformed block is a `ProtocolParse` error; a well-formed
/// block with a nonzero exit code is a `RemoteProcess` error carrying the
/// script's diagnostics.
pub fn parse_install_output(stdout: &str, stderr: &str, marker: &str) -> AppResult<InstallResult> {
    let mut block = extract_block(stdout, marker)?;

    let exit_code = block
        .values
        .get("exitCode")
        .ok_or_else(|| AppError::ProtocolParse("result block has no exitCode".to_string()))?;
    let exit_code: i32 = exit_code.trim().parse().map_err(|_| {
        AppError::ProtocolParse(format!("exitCode is not a number: {:?}", exit_code))
    })?;

    if exit_code != 0 {
        let mut output = block.outside.join("\n").trim().to_string();
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(stderr);
        }
        return Err(AppError::RemoteProcess {
            code: exit_code,
            output,
        });
    }

    let mut take = |key: &str| -> AppResult<String> {
        block
            .values
            .remove(key)
            .ok_or_else(|| AppError::ProtocolParse(format!("result block has no {}", key)))
    };

    let listening_on = take("listeningOn")?;
    if listening_on.is_empty() {
        return Err(AppError::ProtocolParse(
            "result block has an empty listeningOn".to_string(),
        ));
    }
    let connection_token = Secret::new(take("connectionToken")?);
    let log_file = take("logFile")?;
    let platform = take("platform")?;
    let arch = take("arch")?;
    let server_path = take("serverPath")?;

    let environment = block
        .values
        .into_iter()
        .filter(|(key, _)| !KNOWN_KEYS.contains(&key.as_str()))
        .collect();

    Ok(InstallResult {
        exit_code,
        listening_on: ListeningOn::parse(&listening_on),
        connection_token,
        log_file,
        platform,
        arch,
        server_path,
        environment,
    })
}
