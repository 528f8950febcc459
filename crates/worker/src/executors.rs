//! 各执行方式的处理器
//!
//! 处理器只负责把渲染好的命令交给对应的传输方式并收集结果；
//! 状态持久化、超时与取消由 [`crate::executor::TaskExecutor`] 统一处理。

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobcenter_core::{config::ExecutorConfig, ExecutorKind, TaskStatus};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 一次执行的输入，命令与脚本中的占位符已替换
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task_id: i64,
    pub execution_id: String,
    pub task_name: String,
    pub command: String,
    pub script: Option<String>,
    pub params: HashMap<String, Value>,
    pub server_id: Option<i64>,
    pub timeout: Duration,
}

impl ExecutionContext {
    fn param_str(&self, key: &str) -> Option<String> {
        match self.params.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// 命令为空时退回到脚本内容
    fn body(&self) -> &str {
        if self.command.trim().is_empty() {
            self.script.as_deref().unwrap_or_default()
        } else {
            &self.command
        }
    }
}

/// 处理器返回的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub status: TaskStatus,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
}

impl HandlerOutcome {
    pub fn success<S: Into<String>>(output: S) -> Self {
        Self {
            status: TaskStatus::Success,
            output: output.into(),
            error: None,
            exit_code: None,
        }
    }

    pub fn failure<S: Into<String>>(error: S) -> Self {
        Self {
            status: TaskStatus::Failed,
            output: String::new(),
            error: Some(error.into()),
            exit_code: None,
        }
    }

    pub fn canceled() -> Self {
        Self {
            status: TaskStatus::Canceled,
            output: String::new(),
            error: Some("执行已取消".to_string()),
            exit_code: None,
        }
    }

    pub fn timed_out(after: Duration) -> Self {
        Self {
            status: TaskStatus::Timeout,
            output: String::new(),
            error: Some(format!("执行超时: {}s", after.as_secs())),
            exit_code: None,
        }
    }
}

/// 单一执行方式的处理器，必须及时响应 `cancel`
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext, cancel: CancellationToken) -> HandlerOutcome;
}

/// 待启动的外部进程
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn stdin<S: Into<String>>(mut self, input: S) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

/// 进程启动的抽象，测试中可以替换为记录调用的实现
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: CommandSpec, cancel: CancellationToken) -> HandlerOutcome;
}

/// 基于 tokio::process 的本地进程执行
#[derive(Debug, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: CommandSpec, cancel: CancellationToken) -> HandlerOutcome {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return HandlerOutcome::failure(format!("启动命令 {} 失败: {e}", spec.program)),
        };

        if let (Some(input), Some(mut stdin)) = (spec.stdin, child.stdin.take()) {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                warn!(program = %spec.program, "写入标准输入失败: {e}");
            }
            // 关闭 stdin，解释器才会开始执行
            drop(stdin);
        }

        // 分支被放弃时 child 随之析构，kill_on_drop 负责终止进程
        tokio::select! {
            output = child.wait_with_output() => match output {
                Ok(output) => {
                    let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
                    let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
                    let exit_code = output.status.code();
                    let success = output.status.success();
                    debug!(program = %spec.program, ?exit_code, "进程已退出");

                    let error = if !stderr.is_empty() {
                        Some(stderr)
                    } else if !success {
                        Some(format!("命令执行失败，退出码: {exit_code:?}"))
                    } else {
                        None
                    };
                    HandlerOutcome {
                        status: if success { TaskStatus::Success } else { TaskStatus::Failed },
                        output: stdout,
                        error,
                        exit_code,
                    }
                }
                Err(e) => HandlerOutcome::failure(format!("等待进程结束失败: {e}")),
            },
            _ = cancel.cancelled() => HandlerOutcome::canceled(),
        }
    }
}

/// 本地 shell：`sh -c <command>`
pub struct ShellHandler {
    shell: String,
    runner: Arc<dyn CommandRunner>,
}

impl ShellHandler {
    pub fn new<S: Into<String>>(shell: S, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            shell: shell.into(),
            runner,
        }
    }
}

#[async_trait]
impl TaskHandler for ShellHandler {
    async fn execute(&self, ctx: &ExecutionContext, cancel: CancellationToken) -> HandlerOutcome {
        let spec = CommandSpec::new(&self.shell).arg("-c").arg(ctx.body());
        self.runner.run(spec, cancel).await
    }
}

/// 远程 shell，经由系统 ssh 客户端
///
/// 目标取自参数 `host`，可选 `user` 与 `port`。
pub struct RemoteShellHandler {
    ssh: String,
    runner: Arc<dyn CommandRunner>,
}

impl RemoteShellHandler {
    pub fn new<S: Into<String>>(ssh: S, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            ssh: ssh.into(),
            runner,
        }
    }
}

#[async_trait]
impl TaskHandler for RemoteShellHandler {
    async fn execute(&self, ctx: &ExecutionContext, cancel: CancellationToken) -> HandlerOutcome {
        let Some(host) = ctx.param_str("host") else {
            return match ctx.server_id {
                Some(id) => HandlerOutcome::failure(format!("服务器 {id} 未提供 host 参数")),
                None => HandlerOutcome::failure("未指定目标服务器"),
            };
        };

        let target = match ctx.param_str("user") {
            Some(user) => format!("{user}@{host}"),
            None => host,
        };
        let mut spec = CommandSpec::new(&self.ssh)
            .arg("-o")
            .arg("BatchMode=yes");
        if let Some(port) = ctx.param_str("port") {
            spec = spec.arg("-p").arg(port);
        }
        let spec = spec.arg(target).arg(ctx.body());
        self.runner.run(spec, cancel).await
    }
}

/// 容器操作：`docker <command>`，通过 shell 保留参数中的引号
pub struct ContainerHandler {
    shell: String,
    docker: String,
    runner: Arc<dyn CommandRunner>,
}

impl ContainerHandler {
    pub fn new<S: Into<String>, D: Into<String>>(
        shell: S,
        docker: D,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            shell: shell.into(),
            docker: docker.into(),
            runner,
        }
    }
}

#[async_trait]
impl TaskHandler for ContainerHandler {
    async fn execute(&self, ctx: &ExecutionContext, cancel: CancellationToken) -> HandlerOutcome {
        let line = format!("{} {}", self.docker, ctx.body());
        let spec = CommandSpec::new(&self.shell).arg("-c").arg(line);
        self.runner.run(spec, cancel).await
    }
}

/// 编排操作：`kubectl [--namespace ns] [--context ctx] <command>`
pub struct OrchestrationHandler {
    shell: String,
    kubectl: String,
    runner: Arc<dyn CommandRunner>,
}

impl OrchestrationHandler {
    pub fn new<S: Into<String>, K: Into<String>>(
        shell: S,
        kubectl: K,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            shell: shell.into(),
            kubectl: kubectl.into(),
            runner,
        }
    }
}

#[async_trait]
impl TaskHandler for OrchestrationHandler {
    async fn execute(&self, ctx: &ExecutionContext, cancel: CancellationToken) -> HandlerOutcome {
        let mut line = self.kubectl.clone();
        if let Some(ns) = ctx.param_str("namespace") {
            line.push_str(&format!(" --namespace {ns}"));
        }
        if let Some(context) = ctx.param_str("context") {
            line.push_str(&format!(" --context {context}"));
        }
        line.push(' ');
        line.push_str(ctx.body());
        let spec = CommandSpec::new(&self.shell).arg("-c").arg(line);
        self.runner.run(spec, cancel).await
    }
}

/// 脚本：内容经标准输入交给解释器，参数 `interpreter` 可覆盖默认解释器
pub struct ScriptHandler {
    interpreter: String,
    runner: Arc<dyn CommandRunner>,
}

impl ScriptHandler {
    pub fn new<S: Into<String>>(interpreter: S, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            interpreter: interpreter.into(),
            runner,
        }
    }
}

#[async_trait]
impl TaskHandler for ScriptHandler {
    async fn execute(&self, ctx: &ExecutionContext, cancel: CancellationToken) -> HandlerOutcome {
        let interpreter = ctx
            .param_str("interpreter")
            .unwrap_or_else(|| self.interpreter.clone());
        let source = match &ctx.script {
            Some(script) if !script.trim().is_empty() => script.clone(),
            _ => ctx.command.clone(),
        };
        let spec = CommandSpec::new(interpreter).stdin(source);
        self.runner.run(spec, cancel).await
    }
}

/// HTTP 调用
///
/// 命令为 URL 时直接请求；否则从参数 `url`、`method`、`headers`、`body` 构造请求。
/// 非 2xx 响应视为失败。
pub struct HttpHandler {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpHandler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    fn build_request(&self, ctx: &ExecutionContext) -> Result<reqwest::RequestBuilder, String> {
        let command = ctx.command.trim();
        let url = if command.starts_with("http://") || command.starts_with("https://") {
            command.to_string()
        } else {
            ctx.param_str("url").ok_or("缺少请求地址")?
        };
        let method = ctx
            .param_str("method")
            .unwrap_or_else(|| "GET".to_string())
            .to_uppercase();

        let mut request = match method.as_str() {
            "GET" => self.client.get(&url),
            "POST" => self.client.post(&url),
            "PUT" => self.client.put(&url),
            "DELETE" => self.client.delete(&url),
            "PATCH" => self.client.patch(&url),
            "HEAD" => self.client.head(&url),
            _ => return Err(format!("不支持的HTTP方法: {method}")),
        };
        request = request.timeout(self.timeout.min(ctx.timeout));

        if let Some(Value::Object(headers)) = ctx.params.get("headers") {
            for (key, value) in headers {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                request = request.header(key.as_str(), value);
            }
        }
        match ctx.params.get("body") {
            Some(Value::String(body)) => request = request.body(body.clone()),
            Some(Value::Null) | None => {}
            Some(body) => request = request.json(body),
        }
        Ok(request)
    }
}

#[async_trait]
impl TaskHandler for HttpHandler {
    async fn execute(&self, ctx: &ExecutionContext, cancel: CancellationToken) -> HandlerOutcome {
        let request = match self.build_request(ctx) {
            Ok(request) => request,
            Err(e) => return HandlerOutcome::failure(e),
        };

        let response = tokio::select! {
            response = request.send() => response,
            _ = cancel.cancelled() => return HandlerOutcome::canceled(),
        };

        match response {
            Ok(response) => {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|e| format!("读取响应体失败: {e}"));
                let mut outcome = if status.is_success() {
                    HandlerOutcome::success(body)
                } else {
                    HandlerOutcome {
                        output: body,
                        ..HandlerOutcome::failure(format!("HTTP请求失败，状态码: {}", status.as_u16()))
                    }
                };
                outcome.exit_code = Some(i32::from(status.as_u16()));
                outcome
            }
            Err(e) => HandlerOutcome::failure(format!("HTTP请求失败: {e}")),
        }
    }
}

/// 执行方式到处理器的映射，每种方式一个槽位
#[derive(Clone)]
pub struct HandlerRegistry {
    shell: Arc<dyn TaskHandler>,
    remote_shell: Arc<dyn TaskHandler>,
    http: Arc<dyn TaskHandler>,
    container: Arc<dyn TaskHandler>,
    orchestration: Arc<dyn TaskHandler>,
    script: Arc<dyn TaskHandler>,
}

impl HandlerRegistry {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self::with_runner(config, Arc::new(ProcessRunner))
    }

    pub fn with_runner(config: &ExecutorConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            shell: Arc::new(ShellHandler::new(&config.shell, Arc::clone(&runner))),
            remote_shell: Arc::new(RemoteShellHandler::new(
                &config.ssh_program,
                Arc::clone(&runner),
            )),
            http: Arc::new(HttpHandler::new(Duration::from_secs(
                config.http_timeout_seconds,
            ))),
            container: Arc::new(ContainerHandler::new(
                &config.shell,
                &config.docker_program,
                Arc::clone(&runner),
            )),
            orchestration: Arc::new(OrchestrationHandler::new(
                &config.shell,
                &config.kubectl_program,
                Arc::clone(&runner),
            )),
            script: Arc::new(ScriptHandler::new(&config.script_interpreter, runner)),
        }
    }

    /// 替换某一种执行方式的处理器
    pub fn with_handler(mut self, kind: ExecutorKind, handler: Arc<dyn TaskHandler>) -> Self {
        match kind {
            ExecutorKind::Shell => self.shell = handler,
            ExecutorKind::RemoteShell => self.remote_shell = handler,
            ExecutorKind::Http => self.http = handler,
            ExecutorKind::Container => self.container = handler,
            ExecutorKind::Orchestration => self.orchestration = handler,
            ExecutorKind::Script => self.script = handler,
        }
        self
    }

    pub fn handler_for(&self, kind: ExecutorKind) -> Arc<dyn TaskHandler> {
        let handler = match kind {
            ExecutorKind::Shell => &self.shell,
            ExecutorKind::RemoteShell => &self.remote_shell,
            ExecutorKind::Http => &self.http,
            ExecutorKind::Container => &self.container,
            ExecutorKind::Orchestration => &self.orchestration,
            ExecutorKind::Script => &self.script,
        };
        Arc::clone(handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<CommandSpec>>,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, spec: CommandSpec, _cancel: CancellationToken) -> HandlerOutcome {
            self.calls.lock().unwrap().push(spec);
            HandlerOutcome::success("ok")
        }
    }

    fn context(command: &str, params: serde_json::Value) -> ExecutionContext {
        ExecutionContext {
            task_id: 1,
            execution_id: "exec-1".to_string(),
            task_name: "t".to_string(),
            command: command.to_string(),
            script: None,
            params: serde_json::from_value(params).unwrap(),
            server_id: None,
            timeout: Duration::from_secs(30),
        }
    }

    fn registry(runner: &Arc<RecordingRunner>) -> HandlerRegistry {
        let runner: Arc<dyn CommandRunner> = runner.clone();
        HandlerRegistry::with_runner(&ExecutorConfig::default(), runner)
    }

    async fn run_kind(
        kind: ExecutorKind,
        ctx: ExecutionContext,
    ) -> (HandlerOutcome, Vec<CommandSpec>) {
        let runner = Arc::new(RecordingRunner::default());
        let outcome = registry(&runner)
            .handler_for(kind)
            .execute(&ctx, CancellationToken::new())
            .await;
        let calls = runner.calls.lock().unwrap().clone();
        (outcome, calls)
    }

    #[tokio::test]
    async fn test_shell_uses_configured_shell() {
        let (_, calls) = run_kind(ExecutorKind::Shell, context("uptime", serde_json::json!({}))).await;
        assert_eq!(calls, vec![CommandSpec::new("sh").arg("-c").arg("uptime")]);
    }

    #[tokio::test]
    async fn test_remote_shell_requires_target() {
        let (outcome, calls) =
            run_kind(ExecutorKind::RemoteShell, context("df -h", serde_json::json!({}))).await;
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("未指定目标服务器"));
        assert!(calls.is_empty());

        let (_, calls) = run_kind(
            ExecutorKind::RemoteShell,
            context(
                "df -h",
                serde_json::json!({"host": "10.0.0.8", "user": "ops", "port": 2222}),
            ),
        )
        .await;
        assert_eq!(
            calls[0].args,
            vec!["-o", "BatchMode=yes", "-p", "2222", "ops@10.0.0.8", "df -h"]
        );
    }

    #[tokio::test]
    async fn test_orchestration_adds_namespace_and_context() {
        let (_, calls) = run_kind(
            ExecutorKind::Orchestration,
            context(
                "rollout restart deploy/api",
                serde_json::json!({"namespace": "prod", "context": "east"}),
            ),
        )
        .await;
        assert_eq!(
            calls[0].args[1],
            "kubectl --namespace prod --context east rollout restart deploy/api"
        );
    }

    #[tokio::test]
    async fn test_container_prefixes_docker() {
        let (_, calls) =
            run_kind(ExecutorKind::Container, context("ps -a", serde_json::json!({}))).await;
        assert_eq!(calls[0].args, vec!["-c", "docker ps -a"]);
    }

    #[tokio::test]
    async fn test_script_feeds_interpreter_stdin() {
        let mut ctx = context("", serde_json::json!({"interpreter": "bash"}));
        ctx.script = Some("echo hi".to_string());
        let (_, calls) = run_kind(ExecutorKind::Script, ctx).await;
        assert_eq!(calls[0], CommandSpec::new("bash").stdin("echo hi"));
    }

    #[tokio::test]
    async fn test_http_rejects_missing_url_and_bad_method() {
        let handler = HttpHandler::new(Duration::from_secs(5));
        let outcome = handler
            .execute(&context("ping", serde_json::json!({})), CancellationToken::new())
            .await;
        assert_eq!(outcome.status, TaskStatus::Failed);

        let outcome = handler
            .execute(
                &context("http://127.0.0.1:1/", serde_json::json!({"method": "BREW"})),
                CancellationToken::new(),
            )
            .await;
        assert!(outcome.error.unwrap().contains("BREW"));
    }

    #[tokio::test]
    async fn test_process_runner_captures_output_and_exit_code() {
        let runner = ProcessRunner;
        let ok = runner
            .run(
                CommandSpec::new("sh").arg("-c").arg("echo hello"),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(ok.status, TaskStatus::Success);
        assert_eq!(ok.output, "hello");

        let failed = runner
            .run(
                CommandSpec::new("sh").arg("-c").arg("echo oops >&2; exit 3"),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.exit_code, Some(3));
        assert_eq!(failed.error.as_deref(), Some("oops"));
    }

    #[tokio::test]
    async fn test_process_runner_stops_on_cancel() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let outcome = ProcessRunner
            .run(CommandSpec::new("sh").arg("-c").arg("sleep 10"), token)
            .await;
        assert_eq!(outcome.status, TaskStatus::Canceled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
