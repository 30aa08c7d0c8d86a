//! Connection handshake: feature negotiation, authentication, bucket selection.

use bytes::{BufMut, Bytes, BytesMut};
use ember_core::protocol::{features, Outcome, Request, ResponseBody, Status};
use ember_core::{EmberError, Result};

use super::connection::Connection;

/// Features requested on every connection.
const REQUESTED_FEATURES: &[u16] = &[
    features::TCP_NODELAY,
    features::MUTATION_SEQNO,
    features::XATTR,
    features::XERROR,
    features::SELECT_BUCKET,
    features::JSON,
    features::UNORDERED_EXECUTION,
    features::ALT_REQUEST,
    features::SYNC_REPLICATION,
    features::COLLECTIONS,
];

/// What a connection needs to become usable for a bucket.
#[derive(Debug, Clone)]
pub struct Handshake {
    agent: String,
    credentials: Option<(String, String)>,
    bucket: String,
}

/// Feature set the server agreed to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiatedFeatures {
    features: Vec<u16>,
}

impl NegotiatedFeatures {
    /// Returns `true` if `feature` was acknowledged by the server.
    pub fn supports(&self, feature: u16) -> bool {
        self.features.contains(&feature)
    }

    /// Returns `true` if keys must carry a collection id prefix.
    pub fn collections(&self) -> bool {
        self.supports(features::COLLECTIONS)
    }

    /// Returns the raw feature codes.
    pub fn codes(&self) -> &[u16] {
        &self.features
    }
}

fn plain_payload(username: &str, password: &str) -> Bytes {
    let mut payload = BytesMut::with_capacity(username.len() + password.len() + 2);
    payload.put_u8(0);
    payload.put_slice(username.as_bytes());
    payload.put_u8(0);
    payload.put_slice(password.as_bytes());
    payload.freeze()
}

impl Handshake {
    /// Creates a handshake for `bucket`.
    pub fn new(
        agent: impl Into<String>,
        credentials: Option<(String, String)>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            agent: agent.into(),
            credentials,
            bucket: bucket.into(),
        }
    }

    /// Runs the handshake on a fresh connection.
    ///
    /// Authentication and bucket-access failures are returned as
    /// [`EmberError::Authentication`]; they are not worth retrying on the
    /// same node with the same credentials.
    pub async fn perform(&self, connection: &mut Connection) -> Result<NegotiatedFeatures> {
        let hello = connection
            .request(&Request::Hello {
                agent: self.agent.clone(),
                features: REQUESTED_FEATURES.to_vec(),
            })
            .await?;
        let negotiated = match hello.outcome {
            Outcome::Success(ResponseBody::Features(features)) => NegotiatedFeatures { features },
            Outcome::Success(_) => NegotiatedFeatures::default(),
            Outcome::Failure { status, .. } => {
                return Err(EmberError::Connection(format!(
                    "hello rejected by {}: {}",
                    connection.address(),
                    status
                )))
            }
            Outcome::ProtocolError { reason } => return Err(EmberError::Protocol(reason)),
        };

        if let Some((username, password)) = &self.credentials {
            let auth = connection
                .request(&Request::SaslAuth {
                    mechanism: "PLAIN".to_string(),
                    payload: plain_payload(username, password),
                })
                .await?;
            match auth.outcome {
                Outcome::Success(_) => {}
                Outcome::Failure { status, .. } => {
                    return Err(EmberError::Authentication(format!(
                        "authentication as '{}' rejected by {}: {}",
                        username,
                        connection.address(),
                        status
                    )))
                }
                Outcome::ProtocolError { reason } => return Err(EmberError::Protocol(reason)),
            }
        }

        if negotiated.supports(features::SELECT_BUCKET) {
            let select = connection
                .request(&Request::SelectBucket {
                    bucket: self.bucket.clone(),
                })
                .await?;
            match select.outcome {
                Outcome::Success(_) => {}
                Outcome::Failure {
                    status: status @ (Status::AccessDenied | Status::AuthError),
                    ..
                } => {
                    return Err(EmberError::Authentication(format!(
                        "access to bucket '{}' denied: {}",
                        self.bucket, status
                    )))
                }
                Outcome::Failure { status, .. } => {
                    return Err(EmberError::Bootstrap(format!(
                        "bucket '{}' not available on {}: {}",
                        self.bucket,
                        connection.address(),
                        status
                    )))
                }
                Outcome::ProtocolError { reason } => return Err(EmberError::Protocol(reason)),
            }
        }

        tracing::debug!(
            address = %connection.address(),
            features = ?negotiated.codes(),
            bucket = %self.bucket,
            "handshake complete"
        );
        Ok(negotiated)
    }
}
