// Copyright (c) The spectree Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The worker-side coordinator client.
//!
//! One connection per exchange: connect, send one request frame, read one
//! response frame, hang up. Blocking semantics are built client-side by
//! re-polling on [`Status::TooEarly`] at a fixed interval; `Gone` and
//! `FailedDependency` resolve the poll to distinct typed errors so the
//! caller can report the actual cause.

use crate::{
    coordinator::protocol::{
        BeforeSuiteState, Request, Response, ResponsePayload, Status, read_frame, write_frame,
    },
    errors::{ProtocolError, SuiteSyncError},
    report::{SpecReport, SuiteReport},
};
use std::time::Duration;
use tokio::{io::BufReader, net::TcpStream};

const POLLING_INTERVAL: Duration = Duration::from_millis(50);

/// A worker's handle on the coordinator.
#[derive(Clone, Debug)]
pub struct CoordinatorClient {
    address: String,
    worker: usize,
}

impl CoordinatorClient {
    /// Creates a client for the worker with the given 1-based index.
    pub fn new(address: impl Into<String>, worker: usize) -> Self {
        Self {
            address: address.into(),
            worker,
        }
    }

    async fn roundtrip(&self, request: &Request) -> Result<Response, ProtocolError> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|source| ProtocolError::Connect {
                address: self.address.clone(),
                source,
            })?;
        let (read_half, mut write_half) = stream.into_split();
        write_frame(&mut write_half, request).await?;
        let mut reader = BufReader::new(read_half);
        read_frame(&mut reader)
            .await?
            .ok_or(ProtocolError::ConnectionClosed)
    }

    /// Sends a request whose only interesting outcome is `Ok`.
    async fn post(&self, request: Request) -> Result<(), ProtocolError> {
        let response = self.roundtrip(&request).await?;
        match response.status {
            Status::Ok => Ok(()),
            status => Err(ProtocolError::UnexpectedStatus { status }),
        }
    }

    /// True if the coordinator is reachable and answering.
    pub async fn is_up(&self) -> bool {
        matches!(
            self.roundtrip(&Request::Up).await,
            Ok(Response {
                status: Status::Ok,
                ..
            })
        )
    }

    /// Begin-barrier check-in.
    pub async fn post_suite_will_begin(
        &self,
        description: &str,
        total_specs: usize,
    ) -> Result<(), ProtocolError> {
        self.post(Request::SuiteWillBegin {
            worker: self.worker,
            description: description.to_owned(),
            total_specs,
        })
        .await
    }

    /// Streams one finished spec report to the coordinator.
    pub async fn post_did_run(&self, report: &SpecReport) -> Result<(), ProtocolError> {
        self.post(Request::DidRun {
            report: report.clone(),
        })
        .await
    }

    /// Posts this worker's end-of-run summary.
    pub async fn post_suite_did_end(&self, report: &SuiteReport) -> Result<(), ProtocolError> {
        self.post(Request::SuiteDidEnd {
            worker: self.worker,
            report: report.clone(),
        })
        .await
    }

    /// Worker 1 reports that its suite-setup body succeeded.
    pub async fn post_before_suite_succeeded(&self, data: Vec<u8>) -> Result<(), ProtocolError> {
        self.post(Request::PostBeforeSuiteState {
            state: BeforeSuiteState::Passed { data },
        })
        .await
    }

    /// Worker 1 reports that its suite-setup body failed.
    pub async fn post_before_suite_failed(&self) -> Result<(), ProtocolError> {
        self.post(Request::PostBeforeSuiteState {
            state: BeforeSuiteState::Failed,
        })
        .await
    }

    /// Blocks until worker 1's suite-setup outcome resolves, returning the
    /// setup data on success.
    pub async fn block_until_before_suite_data(&self) -> Result<Vec<u8>, SuiteSyncError> {
        loop {
            let response = self.roundtrip(&Request::BeforeSuiteState).await?;
            match response.status {
                Status::TooEarly => tokio::time::sleep(POLLING_INTERVAL).await,
                Status::Gone => return Err(SuiteSyncError::SetupDisappeared),
                Status::FailedDependency => return Err(SuiteSyncError::SetupFailed),
                Status::Ok => match response.payload {
                    Some(ResponsePayload::BeforeSuite {
                        state: BeforeSuiteState::Passed { data },
                    }) => return Ok(data),
                    _ => return Err(ProtocolError::MissingPayload.into()),
                },
                status => return Err(ProtocolError::UnexpectedStatus { status }.into()),
            }
        }
    }

    /// Blocks until every nonprimary worker is confirmed finished (or
    /// dead), gating worker 1's final teardown.
    pub async fn block_until_nonprimary_workers_finished(&self) -> Result<(), ProtocolError> {
        loop {
            let response = self.roundtrip(&Request::AfterSuiteState).await?;
            match (response.status, response.payload) {
                (Status::Ok, Some(ResponsePayload::AfterSuite { can_run: true })) => return Ok(()),
                (Status::Ok, Some(ResponsePayload::AfterSuite { can_run: false })) => {
                    tokio::time::sleep(POLLING_INTERVAL).await;
                }
                (Status::Ok, _) => return Err(ProtocolError::MissingPayload),
                (status, _) => return Err(ProtocolError::UnexpectedStatus { status }),
            }
        }
    }

    /// Blocks until every nonprimary worker has posted its summary, then
    /// returns their merged report.
    pub async fn block_until_aggregated_nonprimary_report(
        &self,
    ) -> Result<SuiteReport, SuiteSyncError> {
        loop {
            let response = self.roundtrip(&Request::AggregatedNonprimaryReport).await?;
            match response.status {
                Status::TooEarly => tokio::time::sleep(POLLING_INTERVAL).await,
                Status::Gone => return Err(SuiteSyncError::ReportUnavailable),
                Status::Ok => match response.payload {
                    Some(ResponsePayload::Aggregated { report }) => return Ok(report),
                    _ => return Err(ProtocolError::MissingPayload.into()),
                },
                status => return Err(ProtocolError::UnexpectedStatus { status }.into()),
            }
        }
    }

    /// Fetches the next gap-free spec index from the shared counter.
    pub async fn next_counter_index(&self) -> Result<usize, ProtocolError> {
        let response = self.roundtrip(&Request::Counter).await?;
        match (response.status, response.payload) {
            (Status::Ok, Some(ResponsePayload::Counter { index })) => Ok(index),
            (Status::Ok, _) => Err(ProtocolError::MissingPayload),
            (status, _) => Err(ProtocolError::UnexpectedStatus { status }),
        }
    }

    /// Broadcasts an abort to every worker.
    pub async fn post_abort(&self) -> Result<(), ProtocolError> {
        self.post(Request::PostAbort).await
    }

    /// Polls the abort flag.
    pub async fn should_abort(&self) -> Result<bool, ProtocolError> {
        let response = self.roundtrip(&Request::ShouldAbort).await?;
        match (response.status, response.payload) {
            (Status::Ok, Some(ResponsePayload::Abort { abort })) => Ok(abort),
            (Status::Ok, _) => Err(ProtocolError::MissingPayload),
            (status, _) => Err(ProtocolError::UnexpectedStatus { status }),
        }
    }
}
