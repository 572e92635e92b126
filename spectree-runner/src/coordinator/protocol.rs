// Copyright (c) The spectree Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The coordinator wire protocol.
//!
//! Each exchange is one JSON-encoded [`Request`] frame followed by one
//! [`Response`] frame, newline-delimited, on a fresh TCP connection. The
//! [`Status`] carried by every response distinguishes retry-worthy
//! conditions from terminal ones so clients never have to parse payloads
//! to decide whether to poll again.

use crate::{
    errors::ProtocolError,
    report::{SpecReport, SuiteReport},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Outcome class of a coordinator exchange.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    /// The request succeeded; any payload is attached.
    Ok,
    /// The queried state has not resolved yet; poll again.
    TooEarly,
    /// The worker responsible for resolving the state exited first; the
    /// state will never resolve.
    Gone,
    /// The state resolved to a failure on the responsible worker.
    FailedDependency,
    /// The request was malformed or arrived out of protocol order.
    BadRequest,
}

/// Outcome of the privileged worker's suite-setup body, as tracked by the
/// coordinator. Transitions are one-way: `Pending` resolves to exactly
/// one of the other states and never changes again.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum BeforeSuiteState {
    /// Worker 1 has not reported yet.
    Pending,
    /// Setup succeeded; the data is distributed to every worker.
    Passed {
        /// The bytes returned by the primary setup body.
        data: Vec<u8>,
    },
    /// Setup ran and failed.
    Failed,
    /// Worker 1 exited without reporting.
    Disappeared,
}

/// A request from a worker to the coordinator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum Request {
    /// Begin-barrier: this worker is about to run its slice.
    SuiteWillBegin {
        /// The reporting worker's 1-based index.
        worker: usize,
        /// The suite description (identical across workers).
        description: String,
        /// Number of specs this worker will consider.
        total_specs: usize,
    },
    /// One spec finished on some worker.
    DidRun {
        /// The finished spec's report.
        report: SpecReport,
    },
    /// End-barrier: this worker's final per-worker summary.
    SuiteDidEnd {
        /// The reporting worker's 1-based index.
        worker: usize,
        /// The worker's completed suite report.
        report: SuiteReport,
    },
    /// Worker 1 reports its suite-setup outcome.
    PostBeforeSuiteState {
        /// `Passed { data }` or `Failed`.
        state: BeforeSuiteState,
    },
    /// Poll the suite-setup outcome.
    BeforeSuiteState,
    /// Poll whether every nonprimary worker is confirmed finished.
    AfterSuiteState,
    /// Poll the merged report of workers 2..=N.
    AggregatedNonprimaryReport,
    /// Atomically fetch-and-increment the shared spec counter.
    Counter,
    /// Liveness probe.
    Up,
    /// Broadcast an abort to every worker.
    PostAbort,
    /// Poll the abort flag.
    ShouldAbort,
}

/// Payload attached to an `Ok` response, when the method has one.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "payload", rename_all = "kebab-case")]
pub enum ResponsePayload {
    /// The resolved suite-setup state.
    BeforeSuite {
        /// Always `Passed` when attached to an `Ok` response.
        state: BeforeSuiteState,
    },
    /// Whether the privileged worker may run its final teardown.
    AfterSuite {
        /// True once all nonprimary workers are finished or gone.
        can_run: bool,
    },
    /// The merged nonprimary suite report.
    Aggregated {
        /// Reports of workers 2..=N folded together.
        report: SuiteReport,
    },
    /// A counter value.
    Counter {
        /// The handed-out index, gap-free from 0.
        index: usize,
    },
    /// The abort flag.
    Abort {
        /// True once any worker posted an abort.
        abort: bool,
    },
}

/// A response from the coordinator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    /// Outcome class.
    pub status: Status,
    /// Method-specific payload, present only on some `Ok` responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ResponsePayload>,
}

impl Response {
    /// An `Ok` response with no payload.
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            payload: None,
        }
    }

    /// An `Ok` response carrying a payload.
    pub fn with_payload(payload: ResponsePayload) -> Self {
        Self {
            status: Status::Ok,
            payload: Some(payload),
        }
    }

    /// A payload-less response with the given status.
    pub fn status(status: Status) -> Self {
        Self {
            status,
            payload: None,
        }
    }
}

/// Writes one newline-delimited JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one newline-delimited JSON frame. Returns `None` on a cleanly
/// closed connection.
pub async fn read_frame<R, T>(reader: &mut BufReader<R>) -> Result<Option<T>, ProtocolError>
where
    R: tokio::io::AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let read = reader.read_line(&mut line).await?;
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line.trim_end())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{location::CodeLocation, node::NodeKind};

    #[tokio::test]
    async fn frames_round_trip_over_a_duplex_pipe() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, _server_write) = tokio::io::split(server);
        let (_, mut client_write) = tokio::io::split(client);

        let request = Request::DidRun {
            report: SpecReport::new(
                vec!["group".to_owned(), "works".to_owned()],
                NodeKind::Assertion,
                CodeLocation::new("protocol.rs", 1),
            ),
        };
        write_frame(&mut client_write, &request)
            .await
            .expect("writes");
        drop(client_write);

        let mut reader = BufReader::new(server_read);
        let decoded: Request = read_frame(&mut reader)
            .await
            .expect("reads")
            .expect("one frame present");
        match decoded {
            Request::DidRun { report } => assert_eq!(report.full_text(), "group works"),
            other => panic!("unexpected request: {other:?}"),
        }
        let eof: Option<Request> = read_frame(&mut reader).await.expect("clean eof");
        assert!(eof.is_none());
    }

    #[test]
    fn before_suite_state_serializes_with_a_state_tag() {
        let encoded =
            serde_json::to_string(&BeforeSuiteState::Passed { data: vec![1, 2] }).expect("encodes");
        assert!(encoded.contains("\"state\":\"passed\""), "got {encoded}");
        let decoded: BeforeSuiteState = serde_json::from_str(&encoded).expect("decodes");
        assert_eq!(decoded, BeforeSuiteState::Passed { data: vec![1, 2] });
    }
}
