//! Service descriptor patching
//!
//! `cloudflared service install` writes a service definition that starts the
//! bare binary. To serve a locally managed tunnel it has to run
//! `<binary> tunnel run`. Both descriptor formats are edited structurally:
//! the program argument list is extracted, fixed up and written back, and
//! patching an already patched descriptor changes nothing.

use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Arguments appended after the binary
pub const RUN_ARGS: [&str; 2] = ["tunnel", "run"];

const PROGRAM_ARGUMENTS_KEY: &str = "<key>ProgramArguments</key>";
const EXEC_START: &str = "ExecStart=";
const CONFIG_FLAG: &str = "config";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("plist has no ProgramArguments array")]
    MissingProgramArguments,
    #[error("ProgramArguments array is not terminated")]
    UnterminatedArray,
    #[error("unit file has no ExecStart line")]
    MissingExecStart,
}

/// The program and its arguments as the service manager runs them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramArguments(pub Vec<String>);

impl ProgramArguments {
    /// Runs `binary` and ends with `tunnel run`
    pub fn runs_tunnel(&self, binary: &Path) -> bool {
        let binary = binary.to_string_lossy();
        self.0.first().map(String::as_str) == Some(&*binary)
            && self.0.len() > RUN_ARGS.len()
            && self.0.ends_with(&RUN_ARGS.map(String::from))
    }

    /// Value of a `--config` flag, in either `--config <path>` or
    /// `--config=<path>` form (single dash accepted too)
    pub fn config_path(&self) -> Option<PathBuf> {
        let mut args = self.0.iter().skip(1);
        while let Some(arg) = args.next() {
            let Some(flag) = arg.strip_prefix("--").or_else(|| arg.strip_prefix('-')) else {
                continue;
            };
            if flag == CONFIG_FLAG {
                return args.next().map(PathBuf::from);
            }
            if let Some(value) = flag
                .strip_prefix(CONFIG_FLAG)
                .and_then(|rest| rest.strip_prefix('='))
            {
                return Some(PathBuf::from(value));
            }
        }
        None
    }

    /// Make the list run `binary` and end with `tunnel run`
    ///
    /// Returns whether anything changed.
    pub fn ensure_runs_tunnel(&mut self, binary: &Path) -> bool {
        if self.runs_tunnel(binary) {
            return false;
        }

        let binary = binary.to_string_lossy().into_owned();
        match self.0.first_mut() {
            Some(first) => *first = binary,
            None => self.0.push(binary),
        }
        if self.0.len() == 1 || !self.0[1..].ends_with(&RUN_ARGS.map(String::from)) {
            self.0.extend(RUN_ARGS.iter().map(|s| s.to_string()));
        }
        true
    }
}

// ============ launchd plist ============

/// Location of the `ProgramArguments` array body in a plist
struct ArrayBody {
    /// Between `<array>` and `</array>`
    range: Range<usize>,
    /// Leading whitespace of the line holding `</array>`
    closing_indent: String,
}

fn find_array_body(plist: &str) -> Result<ArrayBody, DescriptorError> {
    let key = plist
        .find(PROGRAM_ARGUMENTS_KEY)
        .ok_or(DescriptorError::MissingProgramArguments)?;
    let after_key = key + PROGRAM_ARGUMENTS_KEY.len();

    let rest = &plist[after_key..];
    let open_offset = rest
        .find("<array>")
        .filter(|offset| rest[..*offset].trim().is_empty())
        .ok_or(DescriptorError::MissingProgramArguments)?;
    let start = after_key + open_offset + "<array>".len();

    let end = start
        + plist[start..]
            .find("</array>")
            .ok_or(DescriptorError::UnterminatedArray)?;

    let line_start = plist[..end].rfind('\n').map_or(0, |i| i + 1);
    let closing_indent = plist[line_start..end]
        .chars()
        .take_while(|c| c.is_whitespace())
        .collect();

    Ok(ArrayBody {
        range: start..end,
        closing_indent,
    })
}

fn strings_in(body: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut rest = body;
    while let Some(open) = rest.find("<string>") {
        let value_start = open + "<string>".len();
        let Some(close) = rest[value_start..].find("</string>") else {
            break;
        };
        values.push(unescape_xml(&rest[value_start..value_start + close]));
        rest = &rest[value_start + close + "</string>".len()..];
    }
    values
}

fn item_indent(body: &str, closing_indent: &str) -> String {
    body.lines()
        .find(|line| line.trim_start().starts_with("<string>"))
        .map(|line| line.chars().take_while(|c| c.is_whitespace()).collect())
        .unwrap_or_else(|| format!("{}\t", closing_indent))
}

/// Arguments of the plist's `ProgramArguments` array
pub fn launchd_arguments(plist: &str) -> Result<ProgramArguments, DescriptorError> {
    let body = find_array_body(plist)?;
    Ok(ProgramArguments(strings_in(&plist[body.range])))
}

/// Patch a launchd plist; `None` when it already runs `tunnel run`
pub fn patch_launchd(plist: &str, binary: &Path) -> Result<Option<String>, DescriptorError> {
    let body = find_array_body(plist)?;
    let mut arguments = ProgramArguments(strings_in(&plist[body.range.clone()]));

    if !arguments.ensure_runs_tunnel(binary) {
        return Ok(None);
    }

    let indent = item_indent(&plist[body.range.clone()], &body.closing_indent);
    let mut rendered = String::new();
    for argument in &arguments.0 {
        rendered.push('\n');
        rendered.push_str(&indent);
        rendered.push_str("<string>");
        rendered.push_str(&escape_xml(argument));
        rendered.push_str("</string>");
    }
    rendered.push('\n');
    rendered.push_str(&body.closing_indent);

    let mut patched = String::with_capacity(plist.len() + rendered.len());
    patched.push_str(&plist[..body.range.start]);
    patched.push_str(&rendered);
    patched.push_str(&plist[body.range.end..]);
    Ok(Some(patched))
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn unescape_xml(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

// ============ systemd unit ============

fn exec_start_line(unit: &str) -> Result<(Range<usize>, &str), DescriptorError> {
    let mut offset = 0;
    for line in unit.split_inclusive('\n') {
        let content = line.trim_end_matches(['\n', '\r']);
        if let Some(command) = content.trim_start().strip_prefix(EXEC_START) {
            let value_start = offset + (content.len() - command.len());
            return Ok((value_start..offset + content.len(), command));
        }
        offset += line.len();
    }
    Err(DescriptorError::MissingExecStart)
}

/// Arguments of the unit's `ExecStart` line, split on whitespace
///
/// Quoted arguments are not supported; cloudflared never writes them.
pub fn systemd_arguments(unit: &str) -> Result<ProgramArguments, DescriptorError> {
    let (_, command) = exec_start_line(unit)?;
    Ok(ProgramArguments(
        command.split_whitespace().map(str::to_string).collect(),
    ))
}

/// Patch a systemd unit; `None` when it already runs `tunnel run`
pub fn patch_systemd(unit: &str, binary: &Path) -> Result<Option<String>, DescriptorError> {
    let (range, _) = exec_start_line(unit)?;
    let mut arguments = systemd_arguments(unit)?;

    if !arguments.ensure_runs_tunnel(binary) {
        return Ok(None);
    }

    let mut patched = String::with_capacity(unit.len() + 16);
    patched.push_str(&unit[..range.start]);
    patched.push_str(&arguments.0.join(" "));
    patched.push_str(&unit[range.end..]);
    Ok(Some(patched))
}
