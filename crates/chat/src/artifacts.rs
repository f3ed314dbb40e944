use {
    base64::{Engine as _, engine::general_purpose::STANDARD},
    corral_channels::ChannelOutbound,
    corral_common::{Artifact, ThreadKey},
    corral_sandbox::{ExecOptions, RunnerLease},
    std::time::Duration,
    tracing::{debug, warn},
};

/// Pull payloads for artifacts the agent only referenced by path. Must run
/// while the lease is held; the sandbox is restored on release.
///
/// Returns one note per artifact that could not be fetched. Those artifacts
/// stay without data.
pub async fn download_missing(
    lease: &RunnerLease,
    artifacts: &mut [Artifact],
    timeout: Duration,
) -> Vec<String> {
    let mut notes = Vec::new();
    for artifact in artifacts.iter_mut().filter(|a| !a.has_payload()) {
        let argv = vec!["base64".to_string(), artifact.path.clone()];
        let result = lease
            .exec(&argv, &ExecOptions::with_timeout(timeout))
            .await;
        let fetched = match result {
            Ok(out) if out.success() => {
                let compact: String = out.stdout.split_whitespace().collect();
                STANDARD.decode(compact).map_err(|e| e.to_string())
            },
            Ok(out) => Err(format!("exit {}: {}", out.exit_code, out.stderr.trim())),
            Err(e) => Err(e.to_string()),
        };
        match fetched {
            Ok(data) => {
                debug!(runner = lease.name(), path = %artifact.path, bytes = data.len(), "downloaded artifact");
                artifact.data = Some(data);
            },
            Err(error) => {
                warn!(runner = lease.name(), path = %artifact.path, %error, "artifact download failed");
                notes.push(format!("Couldn't retrieve `{}`.", artifact.display_name()));
            },
        }
    }
    notes
}

/// Post artifacts that have a payload. Returns notes for the ones that
/// failed.
pub async fn deliver(
    channel: &dyn ChannelOutbound,
    thread: &ThreadKey,
    artifacts: &[Artifact],
) -> Vec<String> {
    let mut notes = Vec::new();
    for artifact in artifacts.iter().filter(|a| a.has_payload()) {
        if let Err(e) = channel.send_artifact(thread, artifact).await {
            warn!(thread = %thread, path = %artifact.path, error = %e, "artifact upload failed");
            notes.push(format!("Couldn't upload `{}`.", artifact.display_name()));
        }
    }
    notes
}

pub fn append_notes(mut reply: String, notes: &[String]) -> String {
    if notes.is_empty() {
        return reply;
    }
    if !reply.is_empty() {
        reply.push_str("\n\n");
    }
    reply.push_str("_Note:_ ");
    reply.push_str(&notes.join(" "));
    reply
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        anyhow::{Result, bail},
        async_trait::async_trait,
        corral_sandbox::{PoolSettings, RunnerPool, SandboxClient, memory::MemorySandboxClient},
        std::sync::{Arc, Mutex},
    };

    #[derive(Default)]
    struct FlakyChannel {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChannelOutbound for FlakyChannel {
        async fn send_text(&self, _: &ThreadKey, _: &str) -> Result<()> {
            Ok(())
        }

        async fn send_artifact(&self, _: &ThreadKey, artifact: &Artifact) -> Result<()> {
            if artifact.filename == "broken.bin" {
                bail!("upload rejected");
            }
            self.sent.lock().unwrap().push(artifact.filename.clone());
            Ok(())
        }
    }

    fn artifact(path: &str, data: Option<&[u8]>) -> Artifact {
        Artifact {
            path: path.into(),
            filename: path.rsplit('/').next().unwrap().into(),
            data: data.map(<[u8]>::to_vec),
        }
    }

    #[test]
    fn notes_are_appended() {
        assert_eq!(append_notes("done".into(), &[]), "done");
        assert_eq!(
            append_notes("done".into(), &["Couldn't upload `a`.".into()]),
            "done\n\n_Note:_ Couldn't upload `a`."
        );
        assert_eq!(append_notes(String::new(), &["x".into()]), "_Note:_ x");
    }

    #[tokio::test]
    async fn downloads_only_missing_payloads() {
        let client = Arc::new(MemorySandboxClient::new());
        let pool = RunnerPool::new(
            Arc::clone(&client) as Arc<dyn SandboxClient>,
            PoolSettings {
                size: 1,
                reap_orphans: false,
                ..Default::default()
            },
        );
        pool.initialize().await;
        let lease = loop {
            if let Ok(lease) = pool.acquire().await {
                break lease;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        client.put_file(lease.name(), "/workspace/out.csv", b"a,b\n1,2\n");

        let mut artifacts = vec![
            artifact("/workspace/out.csv", None),
            artifact("/workspace/inline.txt", Some(b"inline")),
            artifact("/workspace/missing.png", None),
        ];
        let notes = download_missing(&lease, &mut artifacts, Duration::from_secs(5)).await;
        lease.release().await;

        assert_eq!(artifacts[0].data.as_deref(), Some(&b"a,b\n1,2\n"[..]));
        assert_eq!(artifacts[1].data.as_deref(), Some(&b"inline"[..]));
        assert!(artifacts[2].data.is_none());
        assert_eq!(notes, vec!["Couldn't retrieve `missing.png`."]);

        let downloads = client
            .exec_log()
            .iter()
            .filter(|(_, argv, _)| argv[0] == "base64")
            .count();
        assert_eq!(downloads, 2);
    }

    #[tokio::test]
    async fn delivery_failure_becomes_note() {
        let channel = FlakyChannel::default();
        let thread = ThreadKey::new("C1", "T1");
        let artifacts = vec![
            artifact("/w/ok.txt", Some(b"ok")),
            artifact("/w/broken.bin", Some(b"x")),
            artifact("/w/never-downloaded.txt", None),
        ];
        let notes = deliver(&channel, &thread, &artifacts).await;
        assert_eq!(*channel.sent.lock().unwrap(), vec!["ok.txt"]);
        assert_eq!(notes, vec!["Couldn't upload `broken.bin`."]);
    }
}
