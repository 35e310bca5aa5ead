//! Streamlog Protocol Buffer Definitions
//!
//! This crate contains the gRPC service definition and message types shared
//! by the streamlog server, the storage engine and clients.
//!
//! ## Service
//!
//! - **Log**: the node's public API
//!   - `Produce` / `ProduceStream`: append records, replicated through
//!     consensus on the leader
//!   - `Consume` / `ConsumeStream`: read records from the local log
//!   - `GetServers`: cluster membership plus leader tag
//!
//! ## Usage
//!
//! ```ignore
//! use streamlog_proto::v1::{log_client::LogClient, ProduceRequest, Record};
//!
//! let mut client = LogClient::connect("http://localhost:8400").await?;
//! let response = client
//!     .produce(ProduceRequest {
//!         record: Some(Record {
//!             value: "hello".into(),
//!             ..Default::default()
//!         }),
//!     })
//!     .await?;
//! println!("offset: {}", response.into_inner().offset);
//! ```

/// Version 1 of the streamlog wire protocol.
pub mod v1 {
    tonic::include_proto!("streamlog.v1");
}
