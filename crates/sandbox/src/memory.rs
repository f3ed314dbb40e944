//! In-process sandbox provider for tests.
//!
//! Each sandbox is a set of file paths plus a list of checkpoints. A handful
//! of shell builtins (`echo`, `touch`, `ls`, `cat`, `base64`, `command -v`,
//! `sleep`, `true`, `false`) are interpreted; anything else can be answered by
//! a registered responder.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    base64::Engine as _,
    chrono::Utc,
};

use crate::client::{
    CheckpointInfo, ExecOptions, ExecOutput, NetworkRule, Result, SandboxClient, SandboxError,
    SandboxInfo,
};

type Responder = Arc<dyn Fn(&[String], &ExecOptions) -> ExecOutput + Send + Sync>;

#[derive(Default)]
struct FakeSandbox {
    files: BTreeSet<String>,
    contents: HashMap<String, Vec<u8>>,
    policy: Vec<NetworkRule>,
    checkpoints: Vec<(CheckpointInfo, BTreeSet<String>, HashMap<String, Vec<u8>>)>,
    active_execs: usize,
}

#[derive(Default)]
struct State {
    sandboxes: HashMap<String, FakeSandbox>,
    probe_failures: HashMap<String, usize>,
    restore_failures: HashMap<String, usize>,
    create_failures: usize,
    responders: Vec<(String, Responder)>,
    delays: HashMap<String, Duration>,
    exec_log: Vec<(String, Vec<String>, ExecOptions)>,
}

/// Fake [`SandboxClient`] with failure injection and call counters.
#[derive(Default)]
pub struct MemorySandboxClient {
    state: Mutex<State>,
    creates: AtomicUsize,
    restores: AtomicUsize,
    max_concurrent_execs: AtomicUsize,
}

impl MemorySandboxClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.with_state(|s| s.sandboxes.contains_key(name))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.with_state(|s| s.sandboxes.keys().cloned().collect());
        names.sort();
        names
    }

    pub fn files(&self, name: &str) -> Vec<String> {
        self.with_state(|s| {
            s.sandboxes
                .get(name)
                .map(|b| b.files.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    /// Place a file with contents directly into a sandbox.
    pub fn put_file(&self, name: &str, path: &str, data: &[u8]) {
        self.with_state(|s| {
            if let Some(b) = s.sandboxes.get_mut(name) {
                b.files.insert(path.to_string());
                b.contents.insert(path.to_string(), data.to_vec());
            }
        });
    }

    pub fn network_policy(&self, name: &str) -> Vec<NetworkRule> {
        self.with_state(|s| {
            s.sandboxes
                .get(name)
                .map(|b| b.policy.clone())
                .unwrap_or_default()
        })
    }

    /// The next `times` probes against `name` print the wrong token.
    pub fn fail_probes(&self, name: &str, times: usize) {
        self.with_state(|s| {
            s.probe_failures.insert(name.to_string(), times);
        });
    }

    /// The next `times` restores of `name` fail with a provider error.
    pub fn fail_restores(&self, name: &str, times: usize) {
        self.with_state(|s| {
            s.restore_failures.insert(name.to_string(), times);
        });
    }

    /// The next `times` calls to `create` fail, whatever the name.
    pub fn fail_creates(&self, times: usize) {
        self.with_state(|s| s.create_failures = times);
    }

    /// Answer any exec whose argv starts with `program`.
    pub fn respond(
        &self,
        program: &str,
        responder: impl Fn(&[String], &ExecOptions) -> ExecOutput + Send + Sync + 'static,
    ) {
        self.with_state(|s| {
            s.responders
                .push((program.to_string(), Arc::new(responder)))
        });
    }

    /// Execs whose argv starts with `program` take `delay` before answering.
    pub fn delay(&self, program: &str, delay: Duration) {
        self.with_state(|s| {
            s.delays.insert(program.to_string(), delay);
        });
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn restores(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }

    /// Highest number of execs observed running at once inside one sandbox.
    pub fn max_concurrent_execs(&self) -> usize {
        self.max_concurrent_execs.load(Ordering::SeqCst)
    }

    /// Every exec so far, as `(sandbox, argv, options)`.
    pub fn exec_log(&self) -> Vec<(String, Vec<String>, ExecOptions)> {
        self.with_state(|s| s.exec_log.clone())
    }

    fn interpret(&self, name: &str, argv: &[String]) -> Result<ExecOutput> {
        let script = match argv {
            [sh, flag, script] if sh == "sh" && flag == "-c" => script.clone(),
            _ => argv.join(" "),
        };
        let words: Vec<&str> = script.split_whitespace().collect();

        self.with_state(|s| {
            let probe_fail = match s.probe_failures.get_mut(name) {
                Some(n) if *n > 0 && words.first() == Some(&"echo") => {
                    *n -= 1;
                    true
                },
                _ => false,
            };
            let b = s
                .sandboxes
                .get_mut(name)
                .ok_or_else(|| SandboxError::NotFound(name.to_string()))?;
            let out = match words.as_slice() {
                ["echo", ..] if probe_fail => ok(""),
                ["echo", rest @ ..] => ok(&format!("{}\n", rest.join(" "))),
                ["touch", paths @ ..] => {
                    for p in paths {
                        b.files.insert((*p).to_string());
                    }
                    ok("")
                },
                ["ls"] => ok(&b
                    .files
                    .iter()
                    .map(|f| format!("{f}\n"))
                    .collect::<String>()),
                ["cat", path] | ["base64", path] => match b.contents.get(*path) {
                    Some(data) if words[0] == "base64" => {
                        ok(&base64::engine::general_purpose::STANDARD.encode(data))
                    },
                    Some(data) => ok(&String::from_utf8_lossy(data)),
                    None if b.files.contains(*path) => ok(""),
                    None => exit(1, &format!("{path}: No such file or directory")),
                },
                ["true"] | [] => ok(""),
                ["false"] => exit(1, ""),
                ["command", "-v", bin] => {
                    if b.files.contains(&format!("/usr/local/bin/{bin}")) {
                        ok(&format!("/usr/local/bin/{bin}\n"))
                    } else {
                        exit(1, "")
                    }
                },
                _ => ok(""),
            };
            Ok(out)
        })
    }
}

fn ok(stdout: &str) -> ExecOutput {
    ExecOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
    }
}

fn exit(code: i32, stderr: &str) -> ExecOutput {
    ExecOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: code,
    }
}

#[async_trait]
impl SandboxClient for MemorySandboxClient {
    async fn create(&self, name: &str) -> Result<SandboxInfo> {
        self.with_state(|s| {
            if s.create_failures > 0 {
                s.create_failures -= 1;
                return Err(SandboxError::Provider("capacity exhausted".into()));
            }
            if s.sandboxes.contains_key(name) {
                return Err(SandboxError::Provider(format!("{name} already exists")));
            }
            s.sandboxes.insert(name.to_string(), FakeSandbox::default());
            Ok(())
        })?;
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(SandboxInfo {
            name: name.to_string(),
            status: Some("running".into()),
            created_at: Some(Utc::now()),
            updated_at: None,
        })
    }

    async fn get(&self, name: &str) -> Result<Option<SandboxInfo>> {
        Ok(self.with_state(|s| {
            s.sandboxes.contains_key(name).then(|| SandboxInfo {
                name: name.to_string(),
                status: Some("running".into()),
                created_at: None,
                updated_at: None,
            })
        }))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.with_state(|s| match s.sandboxes.remove(name) {
            Some(_) => Ok(()),
            None => Err(SandboxError::NotFound(name.to_string())),
        })
    }

    async fn exec(&self, name: &str, argv: &[String], opts: &ExecOptions) -> Result<ExecOutput> {
        let (responder, delay) = self.with_state(|s| {
            s.exec_log
                .push((name.to_string(), argv.to_vec(), opts.clone()));
            let active = s.sandboxes.get_mut(name).map(|b| {
                b.active_execs += 1;
                b.active_execs
            });
            if let Some(active) = active {
                self.max_concurrent_execs
                    .fetch_max(active, Ordering::SeqCst);
            }
            let responder = s
                .responders
                .iter()
                .rev()
                .find(|(program, _)| argv.first() == Some(program))
                .map(|(_, r)| Arc::clone(r));
            let delay = argv.first().and_then(|p| s.delays.get(p).copied());
            (responder, delay)
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = match (responder, argv) {
            (Some(responder), _) => {
                // Give concurrent callers a chance to overlap.
                tokio::task::yield_now().await;
                Ok(responder(argv, opts))
            },
            (None, [sleep, secs]) if sleep == "sleep" => {
                let secs: u64 = secs.parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_secs(secs)).await;
                Ok(ok(""))
            },
            (None, _) => self.interpret(name, argv),
        };

        self.with_state(|s| {
            if let Some(b) = s.sandboxes.get_mut(name) {
                b.active_execs = b.active_execs.saturating_sub(1);
            }
        });
        result
    }

    async fn set_network_policy(&self, name: &str, rules: &[NetworkRule]) -> Result<()> {
        self.with_state(|s| {
            let b = s
                .sandboxes
                .get_mut(name)
                .ok_or_else(|| SandboxError::NotFound(name.to_string()))?;
            b.policy = rules.to_vec();
            Ok(())
        })
    }

    async fn create_checkpoint(&self, name: &str, comment: Option<&str>) -> Result<String> {
        self.with_state(|s| {
            let b = s
                .sandboxes
                .get_mut(name)
                .ok_or_else(|| SandboxError::NotFound(name.to_string()))?;
            let id = uuid::Uuid::new_v4().to_string();
            b.checkpoints.push((
                CheckpointInfo {
                    id: id.clone(),
                    comment: comment.map(str::to_string),
                    created_at: Utc::now(),
                },
                b.files.clone(),
                b.contents.clone(),
            ));
            Ok(id)
        })
    }

    async fn list_checkpoints(&self, name: &str) -> Result<Vec<CheckpointInfo>> {
        self.with_state(|s| {
            let b = s
                .sandboxes
                .get(name)
                .ok_or_else(|| SandboxError::NotFound(name.to_string()))?;
            Ok(b.checkpoints.iter().map(|(c, ..)| c.clone()).collect())
        })
    }

    async fn restore_checkpoint(&self, name: &str, checkpoint_id: &str) -> Result<()> {
        self.with_state(|s| {
            if let Some(n) = s.restore_failures.get_mut(name)
                && *n > 0
            {
                *n -= 1;
                return Err(SandboxError::Provider("restore failed".into()));
            }
            let b = s
                .sandboxes
                .get_mut(name)
                .ok_or_else(|| SandboxError::NotFound(name.to_string()))?;
            let (_, files, contents) = b
                .checkpoints
                .iter()
                .find(|(c, ..)| c.id == checkpoint_id)
                .ok_or_else(|| SandboxError::NotFound(checkpoint_id.to_string()))?;
            b.files = files.clone();
            b.contents = contents.clone();
            Ok(())
        })?;
        self.restores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<SandboxInfo>> {
        Ok(self
            .names()
            .into_iter()
            .filter(|n| n.starts_with(prefix))
            .map(|name| SandboxInfo {
                name,
                status: Some("running".into()),
                created_at: None,
                updated_at: None,
            })
            .collect())
    }
}
