//! The gRPC dispatcher for the Log service.
//!
//! Every method authorizes the caller, then routes to the replicated
//! log through two narrow capabilities: [`CommitLog`] for append/read
//! and [`ServerProvider`] for membership. The dispatcher holds no
//! back-reference to anything above it.
//!
//! The authorized subject is the common name of the peer's TLS
//! certificate when the transport terminated TLS; connections without a
//! peer identity act as the anonymous (empty) subject.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use streamlog_cluster::{ClusterError, ClusterResult, DistributedLog};
use streamlog_proto::v1::log_server::Log;
use streamlog_proto::v1::{
    ConsumeRequest, ConsumeResponse, GetServersRequest, GetServersResponse, ProduceRequest,
    ProduceResponse, Record, Server,
};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::auth::Authorizer;

const OBJECT_WILDCARD: &str = "*";
const PRODUCE_ACTION: &str = "produce";
const CONSUME_ACTION: &str = "consume";

/// Append/read capability the dispatcher needs from the replicated log.
#[async_trait]
pub trait CommitLog: Send + Sync + 'static {
    async fn append(&self, record: Record) -> ClusterResult<u64>;
    fn read(&self, offset: u64) -> ClusterResult<Record>;
    /// Notifier signaled after every applied append, used by tailing
    /// consumers.
    fn subscribe(&self) -> Arc<Notify>;
}

/// Membership capability the dispatcher needs from the replicated log.
pub trait ServerProvider: Send + Sync + 'static {
    fn get_servers(&self) -> ClusterResult<Vec<Server>>;
}

#[async_trait]
impl CommitLog for DistributedLog {
    async fn append(&self, record: Record) -> ClusterResult<u64> {
        DistributedLog::append(self, record).await
    }

    fn read(&self, offset: u64) -> ClusterResult<Record> {
        DistributedLog::read(self, offset)
    }

    fn subscribe(&self) -> Arc<Notify> {
        DistributedLog::subscribe(self)
    }
}

impl ServerProvider for DistributedLog {
    fn get_servers(&self) -> ClusterResult<Vec<Server>> {
        DistributedLog::get_servers(self)
    }
}

/// gRPC Log service implementation.
pub struct LogService {
    commit_log: Arc<dyn CommitLog>,
    servers: Arc<dyn ServerProvider>,
    authorizer: Arc<Authorizer>,
    shutdown: Arc<AtomicBool>,
}

impl LogService {
    pub fn new(
        commit_log: Arc<dyn CommitLog>,
        servers: Arc<dyn ServerProvider>,
        authorizer: Arc<Authorizer>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            commit_log,
            servers,
            authorizer,
            shutdown,
        }
    }

    /// Fail fast once shutdown has begun.
    fn check_available(&self) -> Result<(), Status> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(Status::unavailable("server is shutting down"));
        }
        Ok(())
    }

    fn authorize(&self, subject: &str, object: &str, action: &str) -> Result<(), Status> {
        self.authorizer
            .authorize(subject, object, action)
            .map_err(|e| Status::permission_denied(e.to_string()))
    }
}

/// Map replicated-log errors onto wire status codes. `NotLeader`
/// carries the leader's address in response metadata so clients can
/// re-route.
fn to_status(err: ClusterError) -> Status {
    match err {
        ClusterError::Storage(streamlog_storage::Error::OffsetOutOfRange { offset }) => {
            Status::out_of_range(format!("offset out of range: {offset}"))
        }
        ClusterError::NotLeader { leader_addr } => {
            let mut status = Status::failed_precondition("not leader");
            if let Some(value) = leader_addr.as_deref().and_then(|a| a.parse().ok()) {
                status.metadata_mut().insert("leader-addr", value);
            }
            status
        }
        ClusterError::CommitTimeout(_) => Status::deadline_exceeded(err.to_string()),
        ClusterError::Shutdown => Status::unavailable(err.to_string()),
        other => Status::internal(other.to_string()),
    }
}

/// The authenticated subject of a request: the common name of the
/// peer's first TLS certificate, or the empty string without one.
fn subject<T>(request: &Request<T>) -> String {
    request
        .peer_certs()
        .and_then(|certs| certs.first().and_then(|cert| common_name(cert.as_ref())))
        .unwrap_or_default()
}

fn common_name(der: &[u8]) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    name
}

#[tonic::async_trait]
impl Log for LogService {
    #[tracing::instrument(skip(self, request))]
    async fn produce(
        &self,
        request: Request<ProduceRequest>,
    ) -> Result<Response<ProduceResponse>, Status> {
        self.check_available()?;
        let subject = subject(&request);
        self.authorize(&subject, OBJECT_WILDCARD, PRODUCE_ACTION)?;

        let record = request
            .into_inner()
            .record
            .ok_or_else(|| Status::invalid_argument("record is required"))?;
        let offset = self.commit_log.append(record).await.map_err(to_status)?;

        tracing::debug!(offset, "produced record");
        Ok(Response::new(ProduceResponse { offset }))
    }

    #[tracing::instrument(skip(self, request), fields(offset = request.get_ref().offset))]
    async fn consume(
        &self,
        request: Request<ConsumeRequest>,
    ) -> Result<Response<ConsumeResponse>, Status> {
        self.check_available()?;
        let subject = subject(&request);
        self.authorize(&subject, OBJECT_WILDCARD, CONSUME_ACTION)?;

        let record = self
            .commit_log
            .read(request.into_inner().offset)
            .map_err(to_status)?;
        Ok(Response::new(ConsumeResponse {
            record: Some(record),
        }))
    }

    type ProduceStreamStream = ReceiverStream<Result<ProduceResponse, Status>>;

    #[tracing::instrument(skip(self, request))]
    async fn produce_stream(
        &self,
        request: Request<Streaming<ProduceRequest>>,
    ) -> Result<Response<Self::ProduceStreamStream>, Status> {
        self.check_available()?;
        let subject = subject(&request);
        self.authorize(&subject, OBJECT_WILDCARD, PRODUCE_ACTION)?;

        let mut inbound = request.into_inner();
        let commit_log = self.commit_log.clone();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            loop {
                let message = match inbound.message().await {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                };
                let result = match message.record {
                    Some(record) => match commit_log.append(record).await {
                        Ok(offset) => Ok(ProduceResponse { offset }),
                        Err(e) => Err(to_status(e)),
                    },
                    None => Err(Status::invalid_argument("record is required")),
                };
                let failed = result.is_err();
                if tx.send(result).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type ConsumeStreamStream = ReceiverStream<Result<ConsumeResponse, Status>>;

    #[tracing::instrument(skip(self, request), fields(offset = request.get_ref().offset))]
    async fn consume_stream(
        &self,
        request: Request<ConsumeRequest>,
    ) -> Result<Response<Self::ConsumeStreamStream>, Status> {
        self.check_available()?;
        let subject = subject(&request);
        self.authorize(&subject, OBJECT_WILDCARD, CONSUME_ACTION)?;

        let mut offset = request.into_inner().offset;
        let commit_log = self.commit_log.clone();
        let notify = commit_log.subscribe();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            loop {
                // Register for the append signal before checking the log,
                // so an append between the check and the wait still wakes
                // the stream.
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match commit_log.read(offset) {
                    Ok(record) => {
                        let response = ConsumeResponse {
                            record: Some(record),
                        };
                        if tx.send(Ok(response)).await.is_err() {
                            break;
                        }
                        offset += 1;
                    }
                    Err(ClusterError::Storage(
                        streamlog_storage::Error::OffsetOutOfRange { .. },
                    )) => {
                        // Past the tail: park until the next applied
                        // append, or until the consumer goes away.
                        tokio::select! {
                            _ = notified => {}
                            _ = tx.closed() => break,
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(to_status(e))).await;
                        break;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    #[tracing::instrument(skip(self, _request))]
    async fn get_servers(
        &self,
        _request: Request<GetServersRequest>,
    ) -> Result<Response<GetServersResponse>, Status> {
        self.check_available()?;
        let servers = self.servers.get_servers().map_err(to_status)?;
        Ok(Response::new(GetServersResponse { servers }))
    }
}
