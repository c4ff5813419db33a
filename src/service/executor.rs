//! Agent execution.
//!
//! The engine hands each stage attempt to an [`AgentExecutor`]. The binary
//! uses [`CommandExecutor`], which runs the command configured for the
//! stage's agent in `agents/<agent>.toml`:
//!
//! ```toml
//! [agent]
//! command = "my-agent"
//! args = ["--task", "{{task_id}}", "--stage", "{{stage}}"]
//! working_dir = "/src/project"
//!
//! [agent.env]
//! AGENT_ROLE = "{{agent}}"
//! ```
//!
//! The stage request is written to the child's stdin as JSON. The child
//! reports back on stdout:
//!
//! ```json
//! {"outputs": {"passed": true}, "usage": {"input_tokens": 1200, "output_tokens": 300, "cost": 0.04}}
//! ```
//!
//! or `{"rate_limited": {"retry_after": 120}}`. Stdout that is not such an
//! object becomes the single output `stdout`. A non-zero exit status is a
//! failed attempt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::task::Usage;
use crate::workflow::StageOutputs;

/// Directory name under the project dir for agent definitions
pub const AGENTS_DIR: &str = "agents";

/// One stage attempt handed to an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRequest {
    pub task_id: String,
    pub description: String,
    pub stage: String,
    pub agent: String,
    /// Static stage input from the workflow definition
    #[serde(default)]
    pub input: Value,
    /// Outputs of the stages that finished before this one
    #[serde(default)]
    pub context: StageOutputs,
    pub attempt: u32,
}

/// Successful stage attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub usage: Usage,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("{message}")]
    Failed { message: String, usage: Usage },

    #[error("rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("failed to start agent: {0}")]
    Spawn(String),

    #[error("agent protocol error: {0}")]
    Protocol(String),

    #[error("agent configuration error: {0}")]
    Config(String),
}

impl AgentError {
    pub fn failed(message: impl Into<String>) -> Self {
        AgentError::Failed {
            message: message.into(),
            usage: Usage::default(),
        }
    }

    /// Usage consumed by the failed attempt, if the agent reported any
    pub fn usage(&self) -> Usage {
        match self {
            AgentError::Failed { usage, .. } => *usage,
            _ => Usage::default(),
        }
    }
}

/// Agent execution collaborator
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute_stage(&self, request: StageRequest) -> Result<StageReport, AgentError>;
}

/// Template variables usable in agent definitions
#[derive(Debug, Clone)]
pub struct TemplateVars {
    pub task_id: String,
    pub stage: String,
    pub agent: String,
    pub description: String,
    pub attempt: u32,
}

impl TemplateVars {
    pub fn from_request(request: &StageRequest) -> Self {
        Self {
            task_id: request.task_id.clone(),
            stage: request.stage.clone(),
            agent: request.agent.clone(),
            description: request.description.clone(),
            attempt: request.attempt,
        }
    }

    pub fn apply(&self, template: &str) -> String {
        template
            .replace("{{task_id}}", &self.task_id)
            .replace("{{stage}}", &self.stage)
            .replace("{{agent}}", &self.agent)
            .replace("{{description}}", &self.description)
            .replace("{{attempt}}", &self.attempt.to_string())
    }
}

/// Agent definition, loaded from `agents/<name>.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent: AgentSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub working_dir: Option<String>,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let content = fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| AgentError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    pub fn load_by_name(dir: &Path, name: &str) -> Result<Self, AgentError> {
        let path = agents_dir(dir).join(format!("{}.toml", name));
        if !path.exists() {
            return Err(AgentError::Config(format!(
                "agent '{}' is not defined; create {}",
                name,
                path.display()
            )));
        }
        Self::load(&path)
    }

    /// Apply template variables to every configurable field
    pub fn apply_templates(&self, vars: &TemplateVars) -> AgentSettings {
        let mut settings = self.agent.clone();
        settings.command = vars.apply(&settings.command);
        settings.args = settings.args.iter().map(|arg| vars.apply(arg)).collect();
        settings.env = settings
            .env
            .iter()
            .map(|(k, v)| (k.clone(), vars.apply(v)))
            .collect();
        if let Some(ref wd) = settings.working_dir {
            settings.working_dir = Some(vars.apply(wd));
        }
        settings
    }
}

pub fn agents_dir(dir: &Path) -> PathBuf {
    dir.join(AGENTS_DIR)
}

/// Placeholder agents for the default workflow. Each one drains the request
/// and reports a fixed result, so a fresh project runs end to end.
fn starter_agents() -> Vec<(&'static str, &'static str)> {
    vec![
        ("planner", r#"{"outputs": {"plan": "placeholder plan"}}"#),
        ("coder", r#"{"outputs": {"changed": true}}"#),
        ("tester", r#"{"outputs": {"passed": true}}"#),
        ("reviewer", r#"{"outputs": {"approved": true}}"#),
    ]
}

/// Write starter agent definitions that don't exist yet; returns how many
/// were written
pub fn install_starter_agents(dir: &Path) -> std::io::Result<usize> {
    let agents = agents_dir(dir);
    fs::create_dir_all(&agents)?;
    let mut written = 0;
    for (name, reply) in starter_agents() {
        let path = agents.join(format!("{}.toml", name));
        if path.exists() {
            continue;
        }
        let config = AgentConfig {
            agent: AgentSettings {
                command: "sh".to_string(),
                args: vec![
                    "-c".to_string(),
                    format!("cat > /dev/null; echo '{}'", reply),
                ],
                env: HashMap::new(),
                working_dir: None,
            },
        };
        let content = toml::to_string_pretty(&config).map_err(std::io::Error::other)?;
        fs::write(&path, content)?;
        written += 1;
    }
    Ok(written)
}

/// What an agent prints on stdout
#[derive(Debug, Default, Deserialize)]
struct AgentReply {
    #[serde(default)]
    outputs: BTreeMap<String, Value>,
    #[serde(default)]
    usage: Usage,
    #[serde(default)]
    rate_limited: Option<RateLimitReply>,
}

#[derive(Debug, Deserialize)]
struct RateLimitReply {
    #[serde(default = "default_retry_after")]
    retry_after: u64,
}

fn default_retry_after() -> u64 {
    60
}

fn parse_reply(stdout: &str) -> Result<AgentReply, AgentError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(AgentReply::default());
    }
    let structured = match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => ["outputs", "usage", "rate_limited"]
            .iter()
            .any(|k| map.contains_key(*k)),
        _ => false,
    };
    if structured {
        return serde_json::from_str(trimmed).map_err(|e| AgentError::Protocol(e.to_string()));
    }
    let mut outputs = BTreeMap::new();
    outputs.insert("stdout".to_string(), Value::String(trimmed.to_string()));
    Ok(AgentReply {
        outputs,
        ..AgentReply::default()
    })
}

fn tail(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

/// Runs agents as child processes. Dropping an in-flight attempt (timeout
/// or cancellation) kills the child.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    dir: PathBuf,
}

impl CommandExecutor {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl AgentExecutor for CommandExecutor {
    async fn execute_stage(&self, request: StageRequest) -> Result<StageReport, AgentError> {
        let config = AgentConfig::load_by_name(&self.dir, &request.agent)?;
        let vars = TemplateVars::from_request(&request);
        let settings = config.apply_templates(&vars);

        let mut cmd = Command::new(&settings.command);
        cmd.args(&settings.args)
            .envs(&settings.env)
            .env("NIGHTSHIFT_TASK_ID", &request.task_id)
            .env("NIGHTSHIFT_STAGE", &request.stage)
            .env("NIGHTSHIFT_AGENT", &request.agent)
            .env("NIGHTSHIFT_ATTEMPT", request.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref wd) = settings.working_dir {
            cmd.current_dir(wd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AgentError::Spawn(format!("{}: {}", settings.command, e)))?;

        let payload =
            serde_json::to_vec(&request).map_err(|e| AgentError::Protocol(e.to_string()))?;
        // Feed stdin while stdout and stderr drain; an agent that writes a
        // lot before reading its input would otherwise block on a full pipe
        let stdin = child.stdin.take();
        let feed = async {
            if let Some(mut stdin) = stdin {
                // An agent that ignores stdin may close it early; that is fine
                if let Err(e) = stdin.write_all(&payload).await {
                    tracing::debug!(agent = %request.agent, error = %e, "agent closed stdin");
                }
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|e| AgentError::Spawn(e.to_string()))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let usage = parse_reply(&stdout).map(|r| r.usage).unwrap_or_default();
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let detail = tail(&stderr, 5);
            let message = if detail.is_empty() {
                format!("agent '{}' exited with {}", request.agent, code)
            } else {
                format!("agent '{}' exited with {}: {}", request.agent, code, detail)
            };
            return Err(AgentError::Failed { message, usage });
        }

        let reply = parse_reply(&stdout)?;
        if let Some(limit) = reply.rate_limited {
            return Err(AgentError::RateLimited {
                retry_after: Duration::from_secs(limit.retry_after),
            });
        }
        Ok(StageReport {
            outputs: reply.outputs,
            usage: reply.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(agent: &str) -> StageRequest {
        StageRequest {
            task_id: "t1".to_string(),
            description: "Fix the bug".to_string(),
            stage: "test".to_string(),
            agent: agent.to_string(),
            input: Value::Null,
            context: StageOutputs::new(),
            attempt: 1,
        }
    }

    fn write_agent(dir: &Path, name: &str, script: &str) {
        fs::create_dir_all(agents_dir(dir)).unwrap();
        let config = AgentConfig {
            agent: AgentSettings {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                env: HashMap::new(),
                working_dir: None,
            },
        };
        fs::write(
            agents_dir(dir).join(format!("{}.toml", name)),
            toml::to_string_pretty(&config).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_template_vars_apply() {
        let vars = TemplateVars::from_request(&request("coder"));
        assert_eq!(
            vars.apply("{{task_id}}/{{stage}}/{{agent}}#{{attempt}}: {{description}}"),
            "t1/test/coder#1: Fix the bug"
        );
    }

    #[test]
    fn test_agent_config_load() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(agents_dir(temp_dir.path())).unwrap();
        fs::write(
            agents_dir(temp_dir.path()).join("coder.toml"),
            r#"
[agent]
command = "run-{{agent}}"
args = ["--task", "{{task_id}}"]

[agent.env]
STAGE = "{{stage}}"
"#,
        )
        .unwrap();

        let config = AgentConfig::load_by_name(temp_dir.path(), "coder").unwrap();
        let settings = config.apply_templates(&TemplateVars::from_request(&request("coder")));
        assert_eq!(settings.command, "run-coder");
        assert_eq!(settings.args, vec!["--task", "t1"]);
        assert_eq!(settings.env.get("STAGE").map(String::as_str), Some("test"));

        assert!(matches!(
            AgentConfig::load_by_name(temp_dir.path(), "missing"),
            Err(AgentError::Config(_))
        ));
    }

    #[test]
    fn test_parse_reply() {
        let reply = parse_reply(r#"{"outputs": {"passed": false}, "usage": {"cost": 0.5}}"#)
            .unwrap();
        assert_eq!(reply.outputs["passed"], Value::Bool(false));
        assert_eq!(reply.usage.cost, 0.5);

        let plain = parse_reply("all done\n").unwrap();
        assert_eq!(plain.outputs["stdout"], Value::String("all done".to_string()));

        let limited = parse_reply(r#"{"rate_limited": {"retry_after": 30}}"#).unwrap();
        assert_eq!(limited.rate_limited.unwrap().retry_after, 30);

        assert!(matches!(
            parse_reply(r#"{"outputs": 5}"#),
            Err(AgentError::Protocol(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_executor_reads_stdin_and_reports() {
        let temp_dir = TempDir::new().unwrap();
        write_agent(
            temp_dir.path(),
            "echoer",
            r#"input=$(cat); case "$input" in *'"stage":"test"'*) echo '{"outputs": {"saw_stage": true}, "usage": {"input_tokens": 3, "cost": 0.01}}';; *) echo '{"outputs": {"saw_stage": false}}';; esac"#,
        );
        let executor = CommandExecutor::new(temp_dir.path());
        let report = executor.execute_stage(request("echoer")).await.unwrap();
        assert_eq!(report.outputs["saw_stage"], Value::Bool(true));
        assert_eq!(report.usage.input_tokens, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_executor_failure_and_rate_limit() {
        let temp_dir = TempDir::new().unwrap();
        write_agent(temp_dir.path(), "broken", "echo boom >&2; exit 3");
        write_agent(
            temp_dir.path(),
            "limited",
            r#"echo '{"rate_limited": {"retry_after": 42}}'"#,
        );
        let executor = CommandExecutor::new(temp_dir.path());

        match executor.execute_stage(request("broken")).await {
            Err(AgentError::Failed { message, .. }) => {
                assert!(message.contains("exited with 3"));
                assert!(message.contains("boom"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(
            executor.execute_stage(request("limited")).await,
            Err(AgentError::RateLimited {
                retry_after: Duration::from_secs(42)
            })
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_executor_large_output_before_reading_stdin() {
        let temp_dir = TempDir::new().unwrap();
        // Fills the stdout pipe before it reads any of its input
        write_agent(
            temp_dir.path(),
            "chatty",
            r#"head -c 200000 /dev/zero | tr '\0' a; cat >/dev/null; echo"#,
        );
        let executor = CommandExecutor::new(temp_dir.path());
        let mut req = request("chatty");
        req.input = Value::String("b".repeat(200_000));

        let report = tokio::time::timeout(Duration::from_secs(20), executor.execute_stage(req))
            .await
            .expect("agent I/O blocked")
            .unwrap();
        let stdout = report.outputs["stdout"].as_str().unwrap();
        assert_eq!(stdout.len(), 200_000);
    }

    #[test]
    fn test_install_starter_agents() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(install_starter_agents(temp_dir.path()).unwrap(), 4);
        assert_eq!(install_starter_agents(temp_dir.path()).unwrap(), 0);
        AgentConfig::load_by_name(temp_dir.path(), "tester").unwrap();
    }
}
