//! Pod exec and pod logs through the Kubernetes API.
//!
//! Commands run as `sh -c <command>` inside the selected container. Setup
//! failures (auth, unknown pod, unreachable API server) surface immediately
//! as [`RemoteError::Connect`]; nothing here retries.

use std::future::Future;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::Client;
use kube::api::{Api, AttachParams, AttachedProcess, ListParams, LogParams};
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::compat::FuturesAsyncReadCompatExt;

use super::{RemoteError, RemoteExec, RemoteStream, pipe};
use crate::model::Target;

/// Shared handle to the cluster API, built once per invocation.
#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
}

impl ClusterClient {
    /// Build a client from the ambient kubeconfig or in-cluster config.
    pub async fn try_default() -> Result<Self, RemoteError> {
        let client = Client::try_default()
            .await
            .map_err(|e| RemoteError::Connect {
                target: "kubernetes".to_string(),
                reason: format!("failed to create kube client: {e}"),
            })?;
        Ok(Self { client })
    }

    /// Names of the pods in `namespace` matching `^pattern`.
    pub async fn list_pods(
        &self,
        namespace: &str,
        pattern: &str,
    ) -> Result<Vec<String>, RemoteError> {
        let matcher = Regex::new(&format!("^{pattern}"))
            .map_err(|e| RemoteError::Enumerate(format!("invalid pod pattern `{pattern}`: {e}")))?;

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods.list(&ListParams::default()).await.map_err(|e| {
            RemoteError::Enumerate(format!("listing pods in {namespace} failed: {e}"))
        })?;

        let names: Vec<String> = list
            .items
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .filter(|name| matcher.is_match(name))
            .collect();

        tracing::debug!(%namespace, %pattern, count = names.len(), "matched pods");
        Ok(names)
    }

    /// Executor bound to one pod target.
    pub fn exec(&self, target: &Target) -> Result<PodExec, RemoteError> {
        let Target::Pod {
            namespace,
            pod,
            container,
        } = target
        else {
            return Err(RemoteError::Connect {
                target: target.to_string(),
                reason: "not a pod target".to_string(),
            });
        };
        Ok(PodExec {
            pods: Api::namespaced(self.client.clone(), namespace),
            target: target.clone(),
            pod: pod.clone(),
            container: container.clone(),
        })
    }

    /// Stream the last `lines` lines of a pod's log.
    pub async fn tail(&self, target: &Target, lines: u32) -> Result<RemoteStream, RemoteError> {
        let exec = self.exec(target)?;
        let params = LogParams {
            tail_lines: Some(i64::from(lines)),
            container: exec.container.clone(),
            ..LogParams::default()
        };
        let logs = exec
            .pods
            .log_stream(&exec.pod, &params)
            .await
            .map_err(|e| RemoteError::Connect {
                target: target.to_string(),
                reason: e.to_string(),
            })?;

        let label = target.to_string();
        let (mut writer, reader) = pipe();
        let done = tokio::spawn(async move {
            let mut logs = Box::pin(logs.compat());
            tokio::io::copy(&mut logs, &mut writer)
                .await
                .map_err(|e| RemoteError::Stream {
                    target: label,
                    reason: e.to_string(),
                })?;
            writer.shutdown().await?;
            Ok(())
        });

        Ok(RemoteStream::new(Box::new(reader), done))
    }
}

/// [`RemoteExec`] over the pod exec subresource.
pub struct PodExec {
    pods: Api<Pod>,
    target: Target,
    pod: String,
    container: Option<String>,
}

impl PodExec {
    fn params(&self) -> AttachParams {
        let params = AttachParams::default()
            .stdin(false)
            .stdout(true)
            .stderr(true);
        match &self.container {
            Some(container) => params.container(container.clone()),
            None => params,
        }
    }

    async fn attach(&self, command: &str) -> Result<AttachedProcess, RemoteError> {
        tracing::debug!(remote = %self.target, %command, "pod exec");
        self.pods
            .exec(&self.pod, vec!["sh", "-c", command], &self.params())
            .await
            .map_err(|e| RemoteError::Connect {
                target: self.target.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl RemoteExec for PodExec {
    fn target(&self) -> &Target {
        &self.target
    }

    async fn run_command(&self, command: &str) -> Result<String, RemoteError> {
        let mut attached = self.attach(command).await?;
        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status = attached.take_status();

        let (out, err) = tokio::join!(read_to_string(stdout), read_to_string(stderr));
        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        attached.join().await.map_err(|e| RemoteError::Stream {
            target: self.target.to_string(),
            reason: e.to_string(),
        })?;

        let combined = format!("{}{}", out?, err?);
        tracing::debug!(remote = %self.target, %command, output = %combined.trim_end(), "pod exec finished");

        match failure(status.as_ref()) {
            Some(reason) => Err(RemoteError::CommandFailed {
                target: self.target.to_string(),
                command: command.to_string(),
                status: reason,
                output: combined,
            }),
            None => Ok(combined),
        }
    }

    async fn open_stream(&self, command: &str) -> Result<RemoteStream, RemoteError> {
        let mut attached = self.attach(command).await?;
        let stdout = attached.stdout().ok_or_else(|| RemoteError::Stream {
            target: self.target.to_string(),
            reason: "exec session has no stdout".to_string(),
        })?;
        let stderr = attached.stderr();
        let status = attached.take_status();

        let label = self.target.to_string();
        let command = command.to_string();
        let (writer, reader) = pipe();
        let done = tokio::spawn(async move {
            let (err_text, status) = match pump_exec(stdout, stderr, status, writer).await {
                Ok(pumped) => pumped,
                Err(e) => {
                    attached.abort();
                    return Err(RemoteError::Stream {
                        target: label,
                        reason: e.to_string(),
                    });
                }
            };
            attached.join().await.map_err(|e| RemoteError::Stream {
                target: label.clone(),
                reason: e.to_string(),
            })?;
            match failure(status.as_ref()) {
                Some(reason) => Err(RemoteError::CommandFailed {
                    target: label,
                    command,
                    status: reason,
                    output: err_text,
                }),
                None => Ok(()),
            }
        });

        Ok(RemoteStream::new(Box::new(reader), done))
    }
}

/// Copy an exec session's stdout into `writer`, then collect stderr and the
/// exit status.
///
/// If the copy fails the consumer is gone while the remote process still
/// blocks on stdout, so the error is returned at once: neither stderr nor the
/// status is awaited and the caller aborts the session.
async fn pump_exec<O, E, S>(
    mut stdout: O,
    stderr: Option<E>,
    status: Option<S>,
    mut writer: DuplexStream,
) -> std::io::Result<(String, Option<Status>)>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
    S: Future<Output = Option<Status>>,
{
    let mut err_text = std::pin::pin!(read_to_string(stderr));
    let mut stderr_done = None;
    let copied = {
        let copy = async {
            tokio::io::copy(&mut stdout, &mut writer).await?;
            writer.shutdown().await
        };
        tokio::pin!(copy);
        loop {
            tokio::select! {
                copied = &mut copy => break copied,
                text = &mut err_text, if stderr_done.is_none() => stderr_done = Some(text),
            }
        }
    };

    copied?;

    let err_text = match stderr_done {
        Some(text) => text,
        None => err_text.await,
    };
    let status = match status {
        Some(status) => status.await,
        None => None,
    };
    Ok((err_text.unwrap_or_default(), status))
}

async fn read_to_string<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Failure description from an exec status, `None` on success.
fn failure(status: Option<&Status>) -> Option<String> {
    let status = status?;
    if status.status.as_deref() == Some("Success") {
        return None;
    }
    Some(
        status
            .message
            .clone()
            .or_else(|| status.reason.clone())
            .unwrap_or_else(|| "exec failed".to_string()),
    )
}
