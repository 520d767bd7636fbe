//! In-memory simulated remote host.
//!
//! Interprets the command lines this workspace generates: path resolution,
//! chunk appends, reconstruction, deletion, scheduled tasks and script
//! files. Script bodies are dispatched to handlers registered by substring.
//! Useful for development and tests; nothing leaves the process.

use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hvremote_core::{
    Connector, ExecutionResult, Shell, ShellError,
    powershell::{self, POWERSHELL, quoted_after},
};

/// Handler producing the result of a script whose text matched.
pub type ScriptHandler = Arc<dyn Fn(&str) -> ExecutionResult + Send + Sync>;

const DEFAULT_MAX_COMMAND_LEN: usize = 8191;
const TASK_HAS_NOT_RUN: i32 = 267_011;
const TASK_RUNNING: i32 = 267_009;
const HOME: &str = "C:\\Users\\hvremote";

struct StoredFile {
    path: String,
    data: Vec<u8>,
}

struct Task {
    stdout_path: Option<String>,
    stderr_path: Option<String>,
    script_path: Option<String>,
    running: bool,
    pending: VecDeque<String>,
    start_delay: usize,
    polls_left: usize,
    exit_code: i32,
    last_result: i32,
}

struct HostState {
    files: HashMap<String, StoredFile>,
    env: HashMap<String, String>,
    handlers: Vec<(String, ScriptHandler)>,
    failures: Vec<(String, ExecutionResult)>,
    tasks: HashMap<String, Task>,
    registrations: Vec<(String, String)>,
    commands: Vec<String>,
    max_command_len: usize,
    running_polls: usize,
    start_polls: usize,
    connects: usize,
    closes: usize,
    refuse_connect: bool,
    fail_close: bool,
    connection_lost: bool,
}

/// Simulated remote host shared by every session it hands out.
#[derive(Clone)]
pub struct MemoryHost {
    state: Arc<Mutex<HostState>>,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHost {
    /// Create a host with `%TEMP%` under a fixed profile directory.
    #[must_use]
    pub fn new() -> Self {
        let mut env = HashMap::new();
        env.insert("TEMP".to_string(), format!("{HOME}\\AppData\\Local\\Temp"));
        env.insert("USERPROFILE".to_string(), HOME.to_string());
        Self {
            state: Arc::new(Mutex::new(HostState {
                files: HashMap::new(),
                env,
                handlers: Vec::new(),
                failures: Vec::new(),
                tasks: HashMap::new(),
                registrations: Vec::new(),
                commands: Vec::new(),
                max_command_len: DEFAULT_MAX_COMMAND_LEN,
                running_polls: 1,
                start_polls: 0,
                connects: 0,
                closes: 0,
                refuse_connect: false,
                fail_close: false,
                connection_lost: false,
            })),
        }
    }

    /// Reject commands longer than `limit` characters.
    #[must_use]
    pub fn with_max_command_len(self, limit: usize) -> Self {
        self.lock().max_command_len = limit;
        self
    }

    /// Number of status polls a started task reports `Running` for.
    /// Each of those polls releases one more output line.
    #[must_use]
    pub fn with_task_running_polls(self, polls: usize) -> Self {
        self.lock().running_polls = polls;
        self
    }

    /// Number of status polls a started task still reports `Ready` with
    /// "has not run" before it picks up.
    #[must_use]
    pub fn with_task_start_delay(self, polls: usize) -> Self {
        self.lock().start_polls = polls;
        self
    }

    /// Set a remote environment variable.
    pub fn set_env(&self, name: &str, value: &str) {
        self.lock()
            .env
            .insert(name.to_ascii_uppercase(), value.to_string());
    }

    /// Answer scripts containing `needle` with `handler`.
    ///
    /// Handlers run while the host is locked and must not call back into it.
    pub fn on_script<F>(&self, needle: &str, handler: F)
    where
        F: Fn(&str) -> ExecutionResult + Send + Sync + 'static,
    {
        self.lock()
            .handlers
            .push((needle.to_string(), Arc::new(handler)));
    }

    /// Answer every command or script containing `needle` with `result`,
    /// before any other interpretation.
    pub fn fail_when(&self, needle: &str, result: ExecutionResult) {
        self.lock().failures.push((needle.to_string(), result));
    }

    /// Refuse new connections.
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connect = refuse;
    }

    /// Make `close` fail on every session.
    pub fn fail_close(&self, fail: bool) {
        self.lock().fail_close = fail;
    }

    /// Make every command fail at the transport level.
    pub fn lose_connection(&self, lost: bool) {
        self.lock().connection_lost = lost;
    }

    /// Store a file.
    pub fn put_file(&self, path: &str, data: impl Into<Vec<u8>>) {
        self.lock().write_file(path, data.into());
    }

    /// Read a file.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().read_file(path).map(<[u8]>::to_vec)
    }

    /// Paths of every stored file.
    #[must_use]
    pub fn files(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.lock().files.values().map(|f| f.path.clone()).collect();
        paths.sort();
        paths
    }

    /// Every command line received, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Every command as the script text it carried, decoding
    /// `-EncodedCommand` payloads.
    #[must_use]
    pub fn scripts(&self) -> Vec<String> {
        self.commands().iter().map(|c| effective_text(c)).collect()
    }

    /// Names of currently registered tasks.
    #[must_use]
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().tasks.keys().cloned().collect();
        names.sort();
        names
    }

    /// `(task name, user)` for every registration seen.
    #[must_use]
    pub fn registrations(&self) -> Vec<(String, String)> {
        self.lock().registrations.clone()
    }

    /// Number of sessions opened.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    /// Number of sessions closed.
    #[must_use]
    pub fn closes(&self) -> usize {
        self.lock().closes
    }

    /// Connector opening sessions against this host.
    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { host: self.clone() }
    }

    /// Open a session directly.
    #[must_use]
    pub fn shell(&self) -> MemoryShell {
        self.lock().connects += 1;
        MemoryShell {
            host: self.clone(),
            closed: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Connector for [`MemoryHost`].
#[derive(Clone)]
pub struct MemoryConnector {
    host: MemoryHost,
}

impl MemoryConnector {
    /// The host behind this connector.
    #[must_use]
    pub const fn host(&self) -> &MemoryHost {
        &self.host
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Shell = MemoryShell;

    async fn connect(&self) -> Result<MemoryShell, ShellError> {
        if self.host.lock().refuse_connect {
            return Err(ShellError::Connect("connection refused".to_string()));
        }
        Ok(self.host.shell())
    }
}

/// One session against a [`MemoryHost`].
pub struct MemoryShell {
    host: MemoryHost,
    closed: bool,
}

#[async_trait]
impl Shell for MemoryShell {
    async fn execute(&mut self, command: &str) -> Result<ExecutionResult, ShellError> {
        if self.closed {
            return Err(ShellError::Closed);
        }
        let mut state = self.host.lock();
        if state.connection_lost {
            return Err(ShellError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        state.commands.push(command.to_string());
        if command.len() > state.max_command_len {
            return Err(ShellError::Rejected(format!(
                "command is {} characters, limit is {}",
                command.len(),
                state.max_command_len
            )));
        }
        Ok(state.dispatch(command))
    }

    async fn close(&mut self) -> Result<(), ShellError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut state = self.host.lock();
        state.closes += 1;
        if state.fail_close {
            return Err(ShellError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection already gone",
            )));
        }
        Ok(())
    }
}

impl HostState {
    fn dispatch(&mut self, command: &str) -> ExecutionResult {
        let text = effective_text(command);
        if let Some(result) = self.injected_failure(&text) {
            return result;
        }

        if let Some(rest) = command.strip_prefix("echo ") {
            return self.append(rest);
        }
        if let Some(rest) = command.strip_prefix(POWERSHELL) {
            let rest = rest.trim_start();
            if rest.starts_with("-EncodedCommand ") {
                return self.run_script(&text);
            }
            if let Some(path) = rest.strip_prefix("-File ") {
                return self.run_file(path.trim().trim_matches('"'));
            }
        }
        ExecutionResult::new(
            1,
            "",
            format!("'{command}' is not recognized as an internal or external command"),
        )
    }

    fn injected_failure(&self, text: &str) -> Option<ExecutionResult> {
        self.failures
            .iter()
            .find(|(needle, _)| text.contains(needle.as_str()))
            .map(|(_, result)| result.clone())
    }

    fn append(&mut self, rest: &str) -> ExecutionResult {
        let Some((data, target)) = rest.split_once(" >> ") else {
            return ExecutionResult::new(1, "", "The syntax of the command is incorrect.");
        };
        let path = target.trim().trim_matches('"').to_string();
        let mut content = self.read_file(&path).map(<[u8]>::to_vec).unwrap_or_default();
        content.extend_from_slice(data.as_bytes());
        content.extend_from_slice(b"\r\n");
        self.write_file(&path, content);
        ExecutionResult::ok("")
    }

    fn run_script(&mut self, script: &str) -> ExecutionResult {
        if script.contains("FromBase64String") {
            self.restore(script)
        } else if script.contains("ExpandEnvironmentVariables") {
            self.resolve(script)
        } else if script.contains("Unregister-ScheduledTask") {
            self.unregister_task(script)
        } else if script.contains("Register-ScheduledTask") {
            self.register_task(script)
        } else if script.contains("Start-ScheduledTask") {
            self.start_task(script)
        } else if script.contains("Get-ScheduledTask") && script.contains("Select-Object -Skip") {
            self.poll_task(script)
        } else if script.contains("Get-ScheduledTaskInfo") {
            self.task_result(script)
        } else if script.contains("Remove-Item") {
            self.delete(script)
        } else {
            self.handle(script)
        }
    }

    fn run_file(&mut self, path: &str) -> ExecutionResult {
        let Some(data) = self.read_file(path) else {
            return ExecutionResult::new(
                1,
                "",
                format!("The argument '{path}' to the -File parameter does not exist."),
            );
        };
        let script = String::from_utf8_lossy(data).into_owned();
        if let Some(result) = self.injected_failure(&script) {
            return result;
        }
        self.handle(&script)
    }

    fn handle(&self, script: &str) -> ExecutionResult {
        self.handlers
            .iter()
            .find(|(needle, _)| script.contains(needle.as_str()))
            .map_or_else(|| ExecutionResult::ok(""), |(_, handler)| handler(script))
    }

    fn resolve(&self, script: &str) -> ExecutionResult {
        let Some(path) = quoted_after(script, "ExpandEnvironmentVariables(") else {
            return ExecutionResult::new(1, "", "Missing path argument.");
        };
        let expanded = self.expand(&path);
        let absolute = if is_absolute(&expanded) {
            expanded
        } else {
            format!("{HOME}\\{expanded}")
        };
        ExecutionResult::ok(format!("{absolute}\r\n"))
    }

    fn expand(&self, path: &str) -> String {
        let mut out = String::new();
        let mut rest = path;
        while let Some(start) = rest.find('%') {
            let after = &rest[start + 1..];
            let Some(end) = after.find('%') else {
                break;
            };
            out.push_str(&rest[..start]);
            let name = &after[..end];
            match self.env.get(&name.to_ascii_uppercase()) {
                Some(value) => out.push_str(value),
                None => {
                    out.push('%');
                    out.push_str(name);
                    out.push('%');
                }
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        out
    }

    fn restore(&mut self, script: &str) -> ExecutionResult {
        let (Some(tmp), Some(dest)) = (
            quoted_after(script, "$tmp_file_path = "),
            quoted_after(script, "$dest_file_path = "),
        ) else {
            return ExecutionResult::new(1, "", "Missing restore paths.");
        };
        let mut decoded = Vec::new();
        if let Some(data) = self.read_file(&tmp) {
            for line in String::from_utf8_lossy(data).lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match BASE64.decode(line) {
                    Ok(bytes) => decoded.extend(bytes),
                    Err(e) => {
                        return ExecutionResult::new(
                            1,
                            "",
                            format!("Exception calling \"FromBase64String\": {e}"),
                        );
                    }
                }
            }
        }
        self.write_file(&dest, decoded);
        ExecutionResult::ok("")
    }

    fn delete(&mut self, script: &str) -> ExecutionResult {
        if let Some(path) = quoted_after(script, "Remove-Item -LiteralPath") {
            self.files.remove(&key(&path));
        }
        ExecutionResult::ok("")
    }

    fn register_task(&mut self, script: &str) -> ExecutionResult {
        let (Some(name), Some(xml_path)) = (
            quoted_after(script, "-TaskName"),
            quoted_after(script, "ReadAllText("),
        ) else {
            return ExecutionResult::new(1, "", "Register-ScheduledTask: missing arguments.");
        };
        let Some(xml) = self.read_file(&xml_path) else {
            return ExecutionResult::new(1, "", format!("Could not find file '{xml_path}'."));
        };
        let arguments = xml_text(&String::from_utf8_lossy(xml), "Arguments").unwrap_or_default();
        let user = quoted_after(script, "-User").unwrap_or_default();
        self.registrations.push((name.clone(), user));
        self.tasks.insert(
            name,
            Task {
                script_path: between(&arguments, "-File \"", "\""),
                stdout_path: between(&arguments, "1> \"", "\""),
                stderr_path: between(&arguments, "2> \"", "\""),
                running: false,
                pending: VecDeque::new(),
                start_delay: 0,
                polls_left: 0,
                exit_code: 0,
                last_result: TASK_HAS_NOT_RUN,
            },
        );
        ExecutionResult::ok("")
    }

    fn start_task(&mut self, script: &str) -> ExecutionResult {
        let Some(name) = quoted_after(script, "-TaskName") else {
            return ExecutionResult::new(1, "", "Start-ScheduledTask: missing task name.");
        };
        let Some(script_path) = self.tasks.get(&name).map(|t| t.script_path.clone()) else {
            return ExecutionResult::new(1, "", format!("No MSFT_ScheduledTask objects found with property 'TaskName' equal to '{name}'."));
        };
        let outcome = match script_path {
            Some(path) => self.run_file(&path),
            None => ExecutionResult::new(1, "", "Unsupported task action."),
        };
        let (running_polls, start_polls) = (self.running_polls, self.start_polls);
        let Some(task) = self.tasks.get_mut(&name) else {
            return ExecutionResult::ok("");
        };
        task.pending = outcome.stdout.lines().map(str::to_string).collect();
        task.exit_code = outcome.exit_code;
        task.start_delay = start_polls;
        task.polls_left = running_polls;
        task.running = true;
        let stderr_path = task.stderr_path.clone();
        if let Some(path) = stderr_path {
            let mut errors = Vec::new();
            for line in outcome.stderr.lines() {
                errors.extend_from_slice(line.as_bytes());
                errors.extend_from_slice(b"\r\n");
            }
            self.write_file(&path, errors);
        }
        ExecutionResult::ok("")
    }

    fn poll_task(&mut self, script: &str) -> ExecutionResult {
        let Some(name) = quoted_after(script, "-TaskName") else {
            return ExecutionResult::new(1, "", "Get-ScheduledTask: missing task name.");
        };
        let skip = script
            .split("-Skip ")
            .nth(1)
            .and_then(|s| s.split(|c: char| !c.is_ascii_digit()).next())
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);

        let Some(task) = self.tasks.get_mut(&name) else {
            return ExecutionResult::new(1, "", format!("No MSFT_ScheduledTask objects found with property 'TaskName' equal to '{name}'."));
        };
        let mut released = Vec::new();
        let state = if task.start_delay > 0 {
            task.start_delay -= 1;
            "Ready"
        } else if task.running && task.polls_left > 0 {
            task.polls_left -= 1;
            task.last_result = TASK_RUNNING;
            released.extend(task.pending.pop_front());
            "Running"
        } else {
            if task.running {
                released.extend(task.pending.drain(..));
                task.running = false;
                task.last_result = task.exit_code;
            }
            "Ready"
        };
        let last_result = task.last_result;
        let log_path = task.stdout_path.clone();

        let lines = match log_path {
            Some(path) => {
                let mut content = self.read_file(&path).map(<[u8]>::to_vec).unwrap_or_default();
                for line in released {
                    content.extend_from_slice(line.as_bytes());
                    content.extend_from_slice(b"\r\n");
                }
                let all: Vec<String> = String::from_utf8_lossy(&content)
                    .lines()
                    .map(str::to_string)
                    .collect();
                self.write_file(&path, content);
                all.into_iter().skip(skip).collect()
            }
            None => Vec::new(),
        };
        let body = serde_json::json!({ "State": state, "Result": last_result, "Lines": lines });
        ExecutionResult::ok(body.to_string())
    }

    fn task_result(&self, script: &str) -> ExecutionResult {
        let Some(task) = quoted_after(script, "-TaskName").and_then(|name| self.tasks.get(&name)) else {
            return ExecutionResult::new(1, "", "No MSFT_ScheduledTask objects found.");
        };
        let errors: Vec<String> = task
            .stderr_path
            .as_deref()
            .and_then(|path| self.read_file(path))
            .map(|data| String::from_utf8_lossy(data).lines().map(str::to_string).collect())
            .unwrap_or_default();
        // LastTaskResult is a UInt32.
        let result = u32::from_ne_bytes(task.last_result.to_ne_bytes());
        let body = serde_json::json!({ "Result": result, "Errors": errors });
        ExecutionResult::ok(format!("{body}\r\n"))
    }

    fn unregister_task(&mut self, script: &str) -> ExecutionResult {
        match quoted_after(script, "-TaskName").and_then(|name| self.tasks.remove(&name)) {
            Some(_) => ExecutionResult::ok(""),
            None => ExecutionResult::new(1, "", "No MSFT_ScheduledTask objects found."),
        }
    }

    fn read_file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(&key(path)).map(|f| f.data.as_slice())
    }

    fn write_file(&mut self, path: &str, data: Vec<u8>) {
        self.files.insert(
            key(path),
            StoredFile {
                path: path.to_string(),
                data,
            },
        );
    }
}

/// The script a command carries, or the command itself.
fn effective_text(command: &str) -> String {
    command
        .split_once("-EncodedCommand ")
        .and_then(|(_, payload)| powershell::decode(payload))
        .unwrap_or_else(|| command.to_string())
}

fn key(path: &str) -> String {
    path.to_ascii_lowercase()
}

fn is_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    path.starts_with("\\\\")
        || (bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'\\')
}

fn between(text: &str, open: &str, close: &str) -> Option<String> {
    let start = text.find(open)? + open.len();
    let end = text[start..].find(close)? + start;
    Some(text[start..end].to_string())
}

fn xml_text(xml: &str, element: &str) -> Option<String> {
    let raw = between(xml, &format!("<{element}>"), &format!("</{element}>"))?;
    Some(
        raw.replace("&quot;", "\"")
            .replace("&apos;", "'")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&amp;", "&"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use hvremote_core::powershell::{delete_script, encoded_command, resolve_path_script};

    #[tokio::test]
    async fn resolves_environment_references() {
        let host = MemoryHost::new();
        let mut shell = host.shell();
        let result = shell
            .execute(&encoded_command(&resolve_path_script("%TEMP%\\x.b64")))
            .await
            .unwrap();
        assert_eq!(
            result.stdout.trim(),
            "C:\\Users\\hvremote\\AppData\\Local\\Temp\\x.b64"
        );
    }

    #[tokio::test]
    async fn rejects_commands_over_the_limit() {
        let host = MemoryHost::new().with_max_command_len(16);
        let mut shell = host.shell();
        let err = shell.execute("echo 0123456789 >> \"C:\\t\"").await.unwrap_err();
        assert!(matches!(err, ShellError::Rejected(_)));
    }

    #[tokio::test]
    async fn appends_lines_and_deletes_files() {
        let host = MemoryHost::new();
        let mut shell = host.shell();
        shell.execute("echo QUJD >> \"C:\\T\\a.b64\"").await.unwrap();
        shell.execute("echo REVG >> \"C:\\t\\A.b64\"").await.unwrap();
        assert_eq!(host.file("c:\\t\\a.b64").unwrap(), b"QUJD\r\nREVG\r\n");

        shell
            .execute(&encoded_command(&delete_script("C:\\t\\a.b64")))
            .await
            .unwrap();
        assert!(host.files().is_empty());
    }

    #[tokio::test]
    async fn unknown_scripts_reach_handlers() {
        let host = MemoryHost::new();
        host.on_script("Get-VM", |_| ExecutionResult::ok("{\"Name\":\"web\"}"));
        let mut shell = host.shell();
        let result = shell
            .execute(&encoded_command("Get-VM | ConvertTo-Json"))
            .await
            .unwrap();
        assert_eq!(result.stdout, "{\"Name\":\"web\"}");
        assert_eq!(host.scripts(), vec!["Get-VM | ConvertTo-Json".to_string()]);
    }

    #[tokio::test]
    async fn closed_shell_rejects_commands() {
        let host = MemoryHost::new();
        let mut shell = host.shell();
        shell.close().await.unwrap();
        assert!(matches!(
            shell.execute("echo x >> \"C:\\a\"").await,
            Err(ShellError::Closed)
        ));
        assert_eq!(host.closes(), 1);
    }
}
