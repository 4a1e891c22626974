//! Port-forward tunnels
//!
//! A tunnel is a local TCP listener plus, per accepted connection, one
//! upstream port-forward stream into the pod. Bytes are pumped both ways
//! with `copy_bidirectional`; the upstream error channel is watched so a
//! dying pod reaps the whole tunnel, not just one connection.

use super::ForwardError;
use futures::FutureExt;
use k8s_openapi::api::core::v1::{Endpoints, Pod};
use kube::Api;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Upstream coordinates of one tunnel.
#[derive(Clone)]
pub struct TunnelTarget {
    pub client: kube::Client,
    pub namespace: String,
    pub pod: String,
    pub target_port: u16,
}

/// Bind the local listener. `None` asks the OS for a free port.
pub async fn bind_listener(port: Option<u16>) -> Result<(TcpListener, u16), ForwardError> {
    let requested = port.unwrap_or(0);
    let listener = TcpListener::bind(("127.0.0.1", requested))
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                ForwardError::PortInUse(requested)
            } else {
                ForwardError::Internal(format!("bind failed: {}", e))
            }
        })?;
    let local_port = listener
        .local_addr()
        .map_err(|e| ForwardError::Internal(format!("local_addr failed: {}", e)))?
        .port();
    Ok((listener, local_port))
}

/// Check the pod accepts a port-forward before the tunnel goes Running.
pub async fn probe_target(target: &TunnelTarget) -> Result<(), ForwardError> {
    let pods: Api<Pod> = Api::namespaced(target.client.clone(), &target.namespace);
    let forwarder = pods
        .portforward(&target.pod, &[target.target_port])
        .await
        .map_err(|e| ForwardError::PodUnavailable(format!("{}: {}", target.pod, e)))?;
    drop(forwarder);
    Ok(())
}

/// Resolve a service to a backing pod name, once, at start time.
///
/// Picks the first ready endpoint address that targets a pod. Pod rotation
/// after this point does not re-resolve.
pub async fn resolve_service_pod(
    client: &kube::Client,
    namespace: &str,
    service: &str,
) -> Result<String, ForwardError> {
    let endpoints: Api<Endpoints> = Api::namespaced(client.clone(), namespace);
    let eps = endpoints.get(service).await.map_err(|e| {
        ForwardError::PodUnavailable(format!("service {}/{}: {}", namespace, service, e))
    })?;

    for subset in eps.subsets.unwrap_or_default() {
        for address in subset.addresses.unwrap_or_default() {
            if let Some(target) = address.target_ref {
                if target.kind.as_deref() == Some("Pod") {
                    if let Some(name) = target.name {
                        return Ok(name);
                    }
                }
            }
        }
    }
    Err(ForwardError::PodUnavailable(format!(
        "service {}/{} has no ready pod endpoints",
        namespace, service
    )))
}

/// Accept-loop outcome, reported to the registry supervisor.
pub enum TunnelExit {
    /// Cancelled through the tunnel token
    Stopped,
    /// Upstream reported a terminal failure
    Failed(String),
}

/// Run the accept loop until cancellation or an upstream failure.
///
/// The listener is dropped before this returns, so the caller can rely on
/// the local port being released by the time it records the new status.
pub async fn run_tunnel(
    listener: TcpListener,
    target: TunnelTarget,
    cancel: CancellationToken,
) -> TunnelExit {
    let (err_tx, mut err_rx) = mpsc::channel::<String>(1);

    let exit = loop {
        tokio::select! {
            _ = cancel.cancelled() => break TunnelExit::Stopped,
            failure = err_rx.recv() => {
                let message = failure.unwrap_or_else(|| "forwarder failed".to_string());
                break TunnelExit::Failed(message);
            }
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    tracing::debug!(pod = %target.pod, %peer, "port-forward connection accepted");
                    tokio::spawn(relay_connection(
                        socket,
                        target.clone(),
                        err_tx.clone(),
                        cancel.child_token(),
                    ));
                }
                Err(e) => {
                    break TunnelExit::Failed(format!("accept failed: {}", e));
                }
            }
        }
    };

    // Release the socket before the caller flips the record out of Running.
    drop(listener);
    exit
}

/// Pump one local connection to the pod and back.
async fn relay_connection(
    mut socket: TcpStream,
    target: TunnelTarget,
    err_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    let pods: Api<Pod> = Api::namespaced(target.client.clone(), &target.namespace);

    let mut forwarder = match pods.portforward(&target.pod, &[target.target_port]).await {
        Ok(forwarder) => forwarder,
        Err(e) => {
            // The pod no longer accepts forwards; reap the tunnel.
            let _ = err_tx.try_send(format!("pod {} unavailable: {}", target.pod, e));
            return;
        }
    };

    let Some(mut upstream) = forwarder.take_stream(target.target_port) else {
        let _ = err_tx.try_send(format!(
            "no stream for port {} on pod {}",
            target.target_port, target.pod
        ));
        return;
    };

    // The error channel resolves when the server rejects or aborts the port.
    let upstream_error = forwarder
        .take_error(target.target_port)
        .map(|f| f.left_future())
        .unwrap_or_else(|| std::future::pending::<Option<String>>().right_future());

    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut socket, &mut upstream) => {
            if let Err(e) = result {
                tracing::debug!(pod = %target.pod, "relay ended: {}", e);
            }
        }
        error = upstream_error => {
            if let Some(message) = error {
                let _ = err_tx.try_send(format!("forwarder error: {}", message));
            }
        }
    }

    drop(upstream);
    if let Err(e) = forwarder.join().await {
        tracing::debug!(pod = %target.pod, "forwarder join: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_allocates_free_port() {
        let (listener, port) = bind_listener(None).await.unwrap();
        assert!(port > 0);
        drop(listener);
    }

    #[tokio::test]
    async fn test_bind_reports_port_in_use() {
        let (first, port) = bind_listener(None).await.unwrap();
        let err = bind_listener(Some(port)).await.unwrap_err();
        assert!(matches!(err, ForwardError::PortInUse(p) if p == port));
        drop(first);
    }

    #[tokio::test]
    async fn test_distinct_binds_get_distinct_ports() {
        let (a, port_a) = bind_listener(None).await.unwrap();
        let (b, port_b) = bind_listener(None).await.unwrap();
        assert_ne!(port_a, port_b);
        drop((a, b));
    }

    #[tokio::test]
    async fn test_run_tunnel_stops_on_cancel() {
        let (listener, port) = bind_listener(None).await.unwrap();
        let target = TunnelTarget {
            client: kube::Client::try_from(
                kube::Config::new("http://127.0.0.1:1".parse().unwrap()),
            )
            .unwrap(),
            namespace: "default".into(),
            pod: "p1".into(),
            target_port: 80,
        };
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_tunnel(listener, target, cancel.clone()));

        cancel.cancel();
        let exit = handle.await.unwrap();
        assert!(matches!(exit, TunnelExit::Stopped));

        // The port is free again once run_tunnel returned.
        let rebound = bind_listener(Some(port)).await;
        assert!(rebound.is_ok());
    }
}
