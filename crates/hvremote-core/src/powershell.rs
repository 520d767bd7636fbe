//! PowerShell command-line vocabulary shared by the transport layers.
//!
//! Remote scripts travel as `-EncodedCommand` payloads (base64 over
//! UTF-16LE) so no shell quoting applies to their bodies.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

/// Interpreter invocation prefix used for every remote script.
pub const POWERSHELL: &str = "powershell -NoProfile -NonInteractive -ExecutionPolicy Bypass";

/// Typographic quotes PowerShell treats like `'`.
const SINGLE_QUOTES: [char; 5] = ['\'', '\u{2018}', '\u{2019}', '\u{201A}', '\u{201B}'];

/// Quote a value as a single-quoted PowerShell literal.
///
/// Every quote character is doubled, which is the only escape single-quoted
/// strings understand.
#[must_use]
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if SINGLE_QUOTES.contains(&c) {
            out.push(c);
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// Parse the single-quoted literal that starts at the beginning of `input`.
///
/// Returns the unescaped value and the remaining input after the closing
/// quote.
#[must_use]
pub fn unquote(input: &str) -> Option<(String, &str)> {
    let mut chars = input.char_indices().peekable();
    match chars.next() {
        Some((_, c)) if SINGLE_QUOTES.contains(&c) => {}
        _ => return None,
    }
    let mut value = String::new();
    while let Some((i, c)) = chars.next() {
        if SINGLE_QUOTES.contains(&c) {
            if chars.peek().is_some_and(|&(_, next)| next == c) {
                chars.next();
                value.push(c);
            } else {
                return Some((value, &input[i + c.len_utf8()..]));
            }
        } else {
            value.push(c);
        }
    }
    None
}

/// Find `marker` in `script` and parse the single-quoted literal after it.
#[must_use]
pub fn quoted_after(script: &str, marker: &str) -> Option<String> {
    let start = script.find(marker)? + marker.len();
    unquote(script[start..].trim_start()).map(|(value, _)| value)
}

/// Encode a script for `-EncodedCommand`.
#[must_use]
pub fn encode(script: &str) -> String {
    let bytes: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    BASE64.encode(bytes)
}

/// Decode an `-EncodedCommand` payload back into script text.
#[must_use]
pub fn decode(encoded: &str) -> Option<String> {
    let bytes = BASE64.decode(encoded.trim()).ok()?;
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

/// Full command line running `script` through the interpreter.
#[must_use]
pub fn encoded_command(script: &str) -> String {
    format!("{POWERSHELL} -EncodedCommand {}", encode(script))
}

/// Command line running the script file at `path`.
#[must_use]
pub fn file_command(path: &str) -> String {
    format!("{POWERSHELL} -File \"{path}\"")
}

/// Script printing the absolute form of `path`, expanding `%VAR%`
/// references on the remote side.
#[must_use]
pub fn resolve_path_script(path: &str) -> String {
    format!(
        "[System.IO.Path]::GetFullPath([System.Environment]::ExpandEnvironmentVariables({}))",
        quote(path)
    )
}

/// Script deleting `path` if it exists.
#[must_use]
pub fn delete_script(path: &str) -> String {
    let quoted = quote(path);
    format!("if (Test-Path -LiteralPath {quoted}) {{ Remove-Item -LiteralPath {quoted} -Force }}")
}
