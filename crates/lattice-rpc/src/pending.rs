//! Host-side pending requests
//!
//! A `PendingRequest` carries everything needed to serialize one
//! response: the connection, the request id, and the serializer set the
//! operation was dispatched with. Holding the serializer set here pins
//! the encoding of an in-flight call across a concurrent service
//! replacement. The value is consumed by exactly one respond call.

use std::sync::Arc;

use lattice_proto::{ResponseKind, SerializerSet, Value, WireError};

use crate::connection::{CommError, Connection};

/// Faults raised while sending a response.
#[derive(Debug, thiserror::Error)]
pub enum RespondError {
    #[error(transparent)]
    Comm(#[from] CommError),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// One response owed to a peer.
pub struct PendingRequest {
    conn: Arc<Connection>,
    request_id: u64,
    serializers: Arc<SerializerSet>,
    interface_id: u16,
    operation_id: u16,
}

impl PendingRequest {
    pub fn new(
        conn: Arc<Connection>,
        request_id: u64,
        serializers: Arc<SerializerSet>,
        interface_id: u16,
        operation_id: u16,
    ) -> PendingRequest {
        PendingRequest {
            conn,
            request_id,
            serializers,
            interface_id,
            operation_id,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Serialize the operation's return value into a response frame.
    pub async fn respond_value(self, result: &Value) -> Result<(), RespondError> {
        let serializers = Arc::clone(&self.serializers);
        let op = serializers
            .descriptor()
            .operation(self.interface_id, self.operation_id)
            .ok_or(WireError::CorruptMessage("operation vanished from descriptor"))?
            .clone();
        self.conn
            .send_response(self.request_id, |w| serializers.encode_response(w, &op, result))
            .await?;
        Ok(())
    }

    /// Serialize a typed error body.
    pub async fn respond_error(self, type_id: u16, error: &Value) -> Result<(), RespondError> {
        let serializers = Arc::clone(&self.serializers);
        self.conn
            .send_response(self.request_id, |w| {
                serializers.encode_error_response(w, type_id, error)
            })
            .await?;
        Ok(())
    }

    /// Serialize a header-only status response.
    pub async fn respond_status(self, kind: ResponseKind) -> Result<(), RespondError> {
        let serializers = Arc::clone(&self.serializers);
        self.conn
            .send_response(self.request_id, |w| {
                serializers.encode_status_response(w, kind);
                Ok(())
            })
            .await?;
        Ok(())
    }
}
