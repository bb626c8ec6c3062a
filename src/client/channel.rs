// # RPC Channel
//
// One framed TCP channel to one proxy server. Calls are serialized on the
// channel (the stream carries one request/response pair at a time), carry a
// deadline, and surface transport failures as typed RPC statuses so the
// classifier can tell a dead server from a failed statement.
//
// A channel can be cancelled: [`cancel`](RpcChannel::cancel) aborts the
// in-flight call and fails every later call with `Cancelled`, which the
// classifier treats as connection-level. This is the client-shutdown path;
// a cancelled channel is not reusable.

use crate::cluster::Endpoint;
use crate::error::{ProxyError, Result, RpcStatus};
use crate::protocol::{read_frame, write_frame, Request, Response};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;

pub struct RpcChannel {
    endpoint: Endpoint,
    stream: Mutex<Option<TcpStream>>,
    deadline: Duration,
    cancel: watch::Sender<bool>,
}

enum CallOutcome {
    Cancelled,
    TimedOut,
    Finished(Result<Response>),
}

impl RpcChannel {
    pub fn new(endpoint: Endpoint, deadline: Duration) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            endpoint,
            stream: Mutex::new(None),
            deadline,
            cancel,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Cancels the in-flight call, if any, and every call after it.
    pub fn cancel(&self) {
        if !self.cancel.send_replace(true) {
            tracing::debug!("Channel to {} cancelled", self.endpoint);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn cancelled_error(&self) -> ProxyError {
        ProxyError::rpc(
            RpcStatus::Cancelled,
            format!("call to {} was cancelled", self.endpoint),
        )
    }

    /// Sends one request and awaits its response within the deadline,
    /// racing against cancellation.
    ///
    /// A server-reported error is rebuilt into its typed form; transport
    /// failures drop the cached stream so the next call reconnects.
    pub async fn call(&self, request: &Request) -> Result<Response> {
        let mut cancelled = self.cancel.subscribe();
        if *cancelled.borrow() {
            return Err(self.cancelled_error());
        }

        let mut guard = self.stream.lock().await;

        let outcome = {
            let exchange = async {
                if guard.is_none() {
                    let stream =
                        TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port))
                            .await
                            .map_err(|e| {
                                ProxyError::rpc(
                                    RpcStatus::Unavailable,
                                    format!("{}: {}", self.endpoint, e),
                                )
                            })?;
                    *guard = Some(stream);
                }
                let stream = guard.as_mut().ok_or_else(|| {
                    ProxyError::rpc(
                        RpcStatus::Unavailable,
                        format!("{}: no stream", self.endpoint),
                    )
                })?;
                write_frame(stream, request).await?;
                read_frame::<_, Response>(stream).await
            };
            tokio::pin!(exchange);

            tokio::select! {
                _ = cancelled.changed() => CallOutcome::Cancelled,
                finished = timeout(self.deadline, &mut exchange) => match finished {
                    Ok(result) => CallOutcome::Finished(result),
                    Err(_) => CallOutcome::TimedOut,
                },
            }
        };

        match outcome {
            CallOutcome::Cancelled => {
                // The stream may hold a half-written frame; drop it.
                *guard = None;
                Err(self.cancelled_error())
            }
            CallOutcome::TimedOut => {
                *guard = None;
                Err(ProxyError::rpc(
                    RpcStatus::DeadlineExceeded,
                    format!("call to {} exceeded {:?}", self.endpoint, self.deadline),
                ))
            }
            CallOutcome::Finished(Ok(Response::Error(detail))) => Err(detail.into_proxy_error()),
            CallOutcome::Finished(Ok(response)) => Ok(response),
            CallOutcome::Finished(Err(e)) => {
                *guard = None;
                Err(match e {
                    already_typed @ ProxyError::Rpc { .. } => already_typed,
                    ProxyError::Io(io) => ProxyError::rpc(
                        RpcStatus::Unavailable,
                        format!("{}: {}", self.endpoint, io),
                    ),
                    other => ProxyError::rpc(
                        RpcStatus::Unknown,
                        format!("{}: {}", self.endpoint, other),
                    ),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorClassifier;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    /// Accepts connections and reads forever without ever responding.
    async fn silent_server() -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut sink = [0u8; 1024];
                    loop {
                        use tokio::io::AsyncReadExt;
                        if socket.read(&mut sink).await.unwrap_or(0) == 0 {
                            return;
                        }
                    }
                });
            }
        });
        Endpoint::new("127.0.0.1", addr.port())
    }

    #[tokio::test]
    async fn test_cancel_aborts_an_in_flight_call() {
        let endpoint = silent_server().await;
        let channel = Arc::new(RpcChannel::new(endpoint, Duration::from_secs(30)));

        let in_flight = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.call(&Request::Ping).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        channel.cancel();

        let err = in_flight.await.unwrap().unwrap_err();
        match &err {
            ProxyError::Rpc { status, .. } => assert_eq!(*status, RpcStatus::Cancelled),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(ErrorClassifier::is_connection_level(&err));
    }

    #[tokio::test]
    async fn test_cancelled_channel_refuses_further_calls() {
        let endpoint = silent_server().await;
        let channel = RpcChannel::new(endpoint, Duration::from_secs(1));

        channel.cancel();
        assert!(channel.is_cancelled());

        let err = channel.call(&Request::Ping).await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Rpc {
                status: RpcStatus::Cancelled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_deadline_still_applies_without_cancellation() {
        let endpoint = silent_server().await;
        let channel = RpcChannel::new(endpoint, Duration::from_millis(100));

        let err = channel.call(&Request::Ping).await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Rpc {
                status: RpcStatus::DeadlineExceeded,
                ..
            }
        ));
    }
}
